//! The stream task: pull, transform, publish, track progress.

use std::sync::Arc;
use std::time::Duration;

use rill_core::RawRecord;
use rill_state::Checkpoint;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checkpoint::WatermarkTracker;
use crate::error::{EngineError, EngineResult};
use crate::source::{RecordSink, RecordSource, SinkError};
use crate::topology::Topology;

/// Exponential retry delay: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(2))
    }
}

/// Counters reported when a stream task stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    /// Records fully handled (emitted, dropped, or routed to the error path).
    pub processed: u64,
    /// Records published to the output topic.
    pub emitted: u64,
    /// Records that failed with a per-record error.
    pub failed: u64,
}

/// Payload written to the error topic for a failed record.
#[derive(Debug, Serialize)]
struct FailedRecord<'a> {
    topic: &'a str,
    partition: u32,
    offset: u64,
    error: String,
    value: String,
}

/// Single-threaded processing loop over one source.
///
/// Records are handled strictly in source order. The watermark of a record
/// advances only after all of its outputs were acknowledged by the sink.
pub struct StreamTask<T, S, K> {
    topology: T,
    source: S,
    sink: K,
    dead_letter: Option<K>,
    cursor: Arc<WatermarkTracker>,
    poll_timeout: Duration,
    backoff: Backoff,
}

impl<T, S, K> StreamTask<T, S, K>
where
    T: Topology,
    S: RecordSource,
    K: RecordSink,
{
    pub fn new(
        topology: T,
        source: S,
        sink: K,
        cursor: Arc<WatermarkTracker>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            source,
            sink,
            dead_letter: None,
            cursor,
            poll_timeout,
            backoff: Backoff::default(),
        }
    }

    /// Publish records that fail with a per-record error to `sink`
    /// instead of only logging them.
    pub fn with_dead_letter(mut self, sink: K) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// On shutdown the batch in hand is finished before returning. A
    /// publish still being retried when shutdown fires is abandoned; the
    /// record stays below the watermark and is redelivered on restart.
    /// Store changes the topology already made for it are kept and
    /// checkpointed, so a counted record is counted again after restart.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut committed: watch::Receiver<Option<Checkpoint>>,
    ) -> EngineResult<TaskSummary> {
        let mut summary = TaskSummary::default();
        let mut pull_backoff = self.backoff.clone();
        let mut watching = true;
        info!(
            topology = self.topology.name(),
            input = %self.source.topic(),
            output = %self.sink.topic(),
            "stream task started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = committed.changed(), if watching => match changed {
                    Ok(()) => self.commit_checkpointed(&mut committed)?,
                    Err(_) => watching = false,
                },
                pulled = self.source.pull(self.poll_timeout) => match pulled {
                    Ok(batch) => {
                        pull_backoff.reset();
                        if !self.process_batch(batch, &mut summary, &mut shutdown).await? {
                            break;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        let delay = pull_backoff.next_delay();
                        warn!(error = %e, delay_ms = delay.as_millis() as u64, "pull failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        info!(
            topology = self.topology.name(),
            processed = summary.processed,
            emitted = summary.emitted,
            failed = summary.failed,
            "stream task stopped"
        );
        Ok(summary)
    }

    /// Handle every record of `batch`. Returns `false` when shutdown
    /// interrupted a publish retry.
    async fn process_batch(
        &mut self,
        batch: Vec<RawRecord>,
        summary: &mut TaskSummary,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EngineResult<bool> {
        for record in batch {
            let (partition, offset) = (record.partition, record.offset);
            match self.topology.process(record.clone()) {
                Ok(outputs) => {
                    for output in &outputs {
                        if !publish_with_retry(&mut self.sink, output, &mut self.backoff, shutdown)
                            .await?
                        {
                            return Ok(false);
                        }
                        summary.emitted += 1;
                    }
                }
                Err(e) if e.is_record_error() => {
                    summary.failed += 1;
                    if !self.route_failed(&record, &e, shutdown).await? {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
            self.cursor.advance(partition, offset);
            summary.processed += 1;
        }
        Ok(true)
    }

    async fn route_failed(
        &mut self,
        record: &RawRecord,
        error: &EngineError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EngineResult<bool> {
        let Some(dead_letter) = self.dead_letter.as_mut() else {
            warn!(
                partition = record.partition,
                offset = record.offset,
                error = %error,
                "record skipped"
            );
            return Ok(true);
        };

        let payload = FailedRecord {
            topic: self.source.topic(),
            partition: record.partition,
            offset: record.offset,
            error: error.to_string(),
            value: String::from_utf8_lossy(&record.value).into_owned(),
        };
        let value = serde_json::to_vec(&payload)
            .map_err(|e| EngineError::connector(dead_letter.topic(), e))?;
        let failed = RawRecord::new(
            record.key.clone(),
            value,
            record.partition,
            record.offset,
            record.timestamp,
        );
        debug!(
            partition = record.partition,
            offset = record.offset,
            error = %error,
            topic = %dead_letter.topic(),
            "record routed to error topic"
        );
        publish_with_retry(dead_letter, &failed, &mut self.backoff, shutdown).await
    }

    fn commit_checkpointed(
        &mut self,
        committed: &mut watch::Receiver<Option<Checkpoint>>,
    ) -> EngineResult<()> {
        let watermark = committed
            .borrow_and_update()
            .as_ref()
            .map(|c| c.watermark(self.cursor.topic()));
        if let Some(watermark) = watermark.filter(|w| !w.is_empty()) {
            self.source.commit(&watermark)?;
        }
        Ok(())
    }
}

/// Publish `record`, retrying unavailable sinks with backoff.
///
/// Returns `Ok(false)` if shutdown fired while waiting to retry.
async fn publish_with_retry<K: RecordSink>(
    sink: &mut K,
    record: &RawRecord,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> EngineResult<bool> {
    loop {
        match sink.publish(&record.key, &record.value).await {
            Ok(()) => {
                backoff.reset();
                return Ok(true);
            }
            Err(SinkError::Unavailable(reason)) => {
                let delay = backoff.next_delay();
                warn!(
                    topic = %sink.topic(),
                    %reason,
                    delay_ms = delay.as_millis() as u64,
                    "sink unavailable, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        warn!(topic = %sink.topic(), offset = record.offset, "publish abandoned on shutdown");
                        return Ok(false);
                    }
                }
            }
            Err(e @ SinkError::Rejected(_)) => {
                return Err(EngineError::connector(sink.topic(), e));
            }
        }
    }
}
