//! Global table replication: mirror a whole reference topic locally.

use std::sync::Arc;
use std::time::Duration;

use rill_core::{RawRecord, Watermark};
use rill_state::{Checkpoint, KeyValueStore, TypedStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checkpoint::WatermarkTracker;
use crate::error::EngineResult;
use crate::source::RecordSource;
use crate::task::Backoff;

/// Read-only view of a replicated reference table.
pub type GlobalTable<K, V> = TypedStore<K, V>;

/// Copies every record of a reference topic into a local store.
///
/// Records are stored with `version = offset`, so redelivered or
/// reordered records never overwrite a newer entry.
pub struct GlobalTableReplicator<S> {
    source: S,
    store: Arc<KeyValueStore>,
    cursor: Arc<WatermarkTracker>,
    poll_timeout: Duration,
}

impl<S: RecordSource> GlobalTableReplicator<S> {
    pub fn new(
        source: S,
        store: Arc<KeyValueStore>,
        cursor: Arc<WatermarkTracker>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            source,
            store,
            cursor,
            poll_timeout,
        }
    }

    pub fn cursor(&self) -> &Arc<WatermarkTracker> {
        &self.cursor
    }

    /// Typed lookup view over the replica.
    pub fn table<K, V>(
        &self,
        keys: impl rill_core::Codec<K> + 'static,
        values: impl rill_core::Codec<V> + 'static,
    ) -> GlobalTable<K, V> {
        TypedStore::new(Arc::clone(&self.store), keys, values)
    }

    /// Apply one reference record. Returns `false` when it was stale.
    pub fn apply(&self, record: &RawRecord) -> EngineResult<bool> {
        let applied = self.store.put(&record.key, &record.value, record.offset)?;
        self.cursor.advance(record.partition, record.offset);
        Ok(applied)
    }

    fn apply_batch(&self, batch: &[RawRecord]) -> EngineResult<usize> {
        let mut applied = 0;
        for record in batch {
            if self.apply(record)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Pull until the source returns its first empty batch.
    ///
    /// Run before the stream task starts so lookups see the reference data
    /// that existed at startup. Transient pull errors are retried with
    /// backoff for as long as the future is polled; drop it to give up.
    pub async fn bootstrap(&mut self) -> EngineResult<usize> {
        let mut backoff = Backoff::default();
        let mut total = 0;
        loop {
            match self.source.pull(self.poll_timeout).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    backoff.reset();
                    total += self.apply_batch(&batch)?;
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(topic = %self.source.topic(), error = %e, delay_ms = delay.as_millis() as u64, "bootstrap pull failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        info!(topic = %self.source.topic(), records = total, "global table bootstrapped");
        Ok(total)
    }

    /// Keep the replica up to date until `shutdown` fires.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut committed: watch::Receiver<Option<Checkpoint>>,
    ) -> EngineResult<()> {
        let mut backoff = Backoff::default();
        let mut watching = true;
        info!(topic = %self.source.topic(), "global table replicator started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = committed.changed(), if watching => match changed {
                    Ok(()) => self.commit_checkpointed(&mut committed)?,
                    Err(_) => watching = false,
                },
                pulled = self.source.pull(self.poll_timeout) => match pulled {
                    Ok(batch) => {
                        backoff.reset();
                        if !batch.is_empty() {
                            let applied = self.apply_batch(&batch)?;
                            debug!(topic = %self.source.topic(), pulled = batch.len(), applied, "reference records applied");
                        }
                    }
                    Err(e) if e.is_transient() => {
                        let delay = backoff.next_delay();
                        warn!(topic = %self.source.topic(), error = %e, delay_ms = delay.as_millis() as u64, "reference pull failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        info!(topic = %self.source.topic(), "global table replicator stopped");
        Ok(())
    }

    fn commit_checkpointed(
        &mut self,
        committed: &mut watch::Receiver<Option<Checkpoint>>,
    ) -> EngineResult<()> {
        let watermark: Option<Watermark> = committed
            .borrow_and_update()
            .as_ref()
            .map(|c| c.watermark(self.cursor.topic()));
        if let Some(watermark) = watermark.filter(|w| !w.is_empty()) {
            self.source.commit(&watermark)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::error::EngineError;
    use crate::memory::{MemoryBackend, MemorySource};
    use crate::source::Backend;
    use rill_core::{Codec, U64Codec, Utf8Codec};
    use rill_state::StateDir;

    fn replicator(backend: &MemoryBackend, state: &StateDir) -> GlobalTableReplicator<MemorySource> {
        GlobalTableReplicator::new(
            backend.source("fruits").unwrap(),
            state.open_store("fruits-global").unwrap(),
            Arc::new(WatermarkTracker::new("fruits", Watermark::new())),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn bootstrap_mirrors_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let backend = MemoryBackend::new(1);
        let fruits = backend.topic("fruits");
        fruits.append(&U64Codec.encode(&7), b"seven");
        fruits.append(&U64Codec.encode(&12), b"twelve");
        fruits.append(&U64Codec.encode(&7), b"SEVEN");

        let mut replicator = replicator(&backend, &state);
        assert_eq!(replicator.bootstrap().await.unwrap(), 3);

        let table = replicator.table(U64Codec, Utf8Codec);
        assert_eq!(table.get(&7).unwrap().as_deref(), Some("SEVEN"));
        assert_eq!(table.get(&12).unwrap().as_deref(), Some("twelve"));
        assert_eq!(replicator.cursor().snapshot().next_offset(0), 3);
    }

    /// Fails its first `failures` pulls, then hands out `batches`.
    struct Flaky {
        failures: u32,
        error: fn() -> EngineError,
        batches: VecDeque<Vec<RawRecord>>,
    }

    impl RecordSource for Flaky {
        fn topic(&self) -> &str {
            "fruits"
        }

        async fn pull(&mut self, _timeout: Duration) -> EngineResult<Vec<RawRecord>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err((self.error)());
            }
            Ok(self.batches.pop_front().unwrap_or_default())
        }

        fn commit(&mut self, _watermark: &Watermark) -> EngineResult<()> {
            Ok(())
        }

        fn seek(&mut self, _watermark: &Watermark) -> EngineResult<()> {
            Ok(())
        }
    }

    fn flaky(state: &StateDir, error: fn() -> EngineError) -> GlobalTableReplicator<Flaky> {
        let seven = RawRecord::new(U64Codec.encode(&7), b"seven".to_vec(), 0, 0, 0);
        GlobalTableReplicator::new(
            Flaky {
                failures: 1,
                error,
                batches: VecDeque::from([vec![seven]]),
            },
            state.open_store("fruits-global").unwrap(),
            Arc::new(WatermarkTracker::new("fruits", Watermark::new())),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn bootstrap_retries_transient_pull_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let mut replicator = flaky(&state, || {
            EngineError::Transient("connection refused".to_string())
        });

        assert_eq!(replicator.bootstrap().await.unwrap(), 1);
        let table = replicator.table(U64Codec, Utf8Codec);
        assert_eq!(table.get(&7).unwrap().as_deref(), Some("seven"));
    }

    #[tokio::test]
    async fn bootstrap_stops_on_permanent_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let mut replicator = flaky(&state, || EngineError::connector("fruits", "no such topic"));

        let err = replicator.bootstrap().await.unwrap_err();
        assert!(matches!(err, EngineError::Connector { .. }));
    }

    #[tokio::test]
    async fn older_offset_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let backend = MemoryBackend::new(1);
        let replicator = replicator(&backend, &state);

        let newer = RawRecord::new(b"7".to_vec(), b"new".to_vec(), 0, 5, 0);
        let older = RawRecord::new(b"7".to_vec(), b"old".to_vec(), 0, 2, 0);
        assert!(replicator.apply(&newer).unwrap());
        assert!(!replicator.apply(&older).unwrap());
        assert_eq!(replicator.store.get(b"7").unwrap().unwrap().value, b"new");
    }

    #[tokio::test]
    async fn run_follows_new_records_and_commits_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let backend = MemoryBackend::new(1);
        let fruits = backend.topic("fruits");
        let replicator = replicator(&backend, &state);
        let table = replicator.table(U64Codec, Utf8Codec);

        let (stop, shutdown) = watch::channel(false);
        let (publish, committed) = watch::channel(None);
        let handle = tokio::spawn(replicator.run(shutdown, committed));

        fruits.append(&U64Codec.encode(&7), b"seven");
        for _ in 0..100 {
            if table.get(&7).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(table.get(&7).unwrap().as_deref(), Some("seven"));

        let mut wm = Watermark::new();
        wm.advance(0, 0);
        publish.send_replace(Some(Checkpoint {
            id: 1,
            group: "g".to_string(),
            watermarks: [("fruits".to_string(), wm.clone())].into(),
            stores: vec![],
            created_at: 0,
        }));
        for _ in 0..100 {
            if fruits.committed() == wm {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fruits.committed(), wm);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
