//! In-memory partitioned topics, for tests and embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rill_core::{RawRecord, Watermark};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::EngineResult;
use crate::source::{Backend, RecordSink, RecordSource, SinkError, partition_for};

struct TopicInner {
    name: String,
    partitions: Mutex<Vec<Vec<RawRecord>>>,
    committed: Mutex<Watermark>,
    appended: Notify,
    /// Publishes left to fail with `SinkError::Unavailable`.
    failing_publishes: AtomicU32,
}

/// A named topic shared by every source and sink created for it.
#[derive(Clone)]
pub struct MemoryTopic {
    inner: Arc<TopicInner>,
}

impl MemoryTopic {
    pub fn new(name: &str, partitions: u32) -> Self {
        Self {
            inner: Arc::new(TopicInner {
                name: name.to_string(),
                partitions: Mutex::new(vec![Vec::new(); partitions.max(1) as usize]),
                committed: Mutex::new(Watermark::new()),
                appended: Notify::new(),
                failing_publishes: AtomicU32::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<RawRecord>>> {
        self.inner
            .partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record to the partition chosen by its key.
    /// Returns `(partition, offset)`.
    pub fn append(&self, key: &[u8], value: &[u8]) -> (u32, u64) {
        let position = {
            let mut partitions = self.lock();
            let partition = partition_for(key, partitions.len() as u32);
            let log = &mut partitions[partition as usize];
            let offset = log.len() as u64;
            log.push(RawRecord::new(
                key.to_vec(),
                value.to_vec(),
                partition,
                offset,
                epoch_millis(),
            ));
            (partition, offset)
        };
        self.inner.appended.notify_waiters();
        position
    }

    /// Every record of every partition, partition by partition.
    pub fn records(&self) -> Vec<RawRecord> {
        self.lock().iter().flatten().cloned().collect()
    }

    /// `(key, value)` pairs, partition by partition.
    pub fn key_values(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.records()
            .into_iter()
            .map(|r| (r.key, r.value))
            .collect()
    }

    /// Last watermark committed by a source of this topic.
    pub fn committed(&self) -> Watermark {
        self.inner
            .committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Make the next `count` publishes fail as unavailable.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    fn read_from(&self, positions: &Watermark, max: usize) -> Vec<RawRecord> {
        let partitions = self.lock();
        let mut batch = Vec::new();
        for (partition, log) in partitions.iter().enumerate() {
            let next = positions.next_offset(partition as u32) as usize;
            batch.extend(log.iter().skip(next).take(max.saturating_sub(batch.len())).cloned());
        }
        batch
    }
}

/// Reader over a [`MemoryTopic`] with its own positions.
pub struct MemorySource {
    topic: MemoryTopic,
    positions: Watermark,
    max_batch: usize,
}

impl RecordSource for MemorySource {
    fn topic(&self) -> &str {
        self.topic.name()
    }

    async fn pull(&mut self, timeout: Duration) -> EngineResult<Vec<RawRecord>> {
        // Registered before reading so an append in between still wakes us.
        let appended = self.topic.inner.appended.notified();
        let mut batch = self.topic.read_from(&self.positions, self.max_batch);
        if batch.is_empty() {
            if tokio::time::timeout(timeout, appended).await.is_err() {
                return Ok(Vec::new());
            }
            batch = self.topic.read_from(&self.positions, self.max_batch);
        }
        for record in &batch {
            self.positions.advance(record.partition, record.offset);
        }
        Ok(batch)
    }

    fn commit(&mut self, watermark: &Watermark) -> EngineResult<()> {
        *self
            .topic
            .inner
            .committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = watermark.clone();
        debug!(topic = %self.topic.name(), ?watermark, "offsets committed");
        Ok(())
    }

    fn seek(&mut self, watermark: &Watermark) -> EngineResult<()> {
        self.positions = watermark.clone();
        Ok(())
    }
}

/// Writer into a [`MemoryTopic`].
pub struct MemorySink {
    topic: MemoryTopic,
}

impl RecordSink for MemorySink {
    fn topic(&self) -> &str {
        self.topic.name()
    }

    async fn publish(&mut self, key: &[u8], value: &[u8]) -> Result<(), SinkError> {
        let failing = &self.topic.inner.failing_publishes;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Unavailable(format!(
                "{} temporarily unavailable",
                self.topic.name()
            )));
        }
        self.topic.append(key, value);
        Ok(())
    }
}

/// Set of in-memory topics created on first use.
#[derive(Clone)]
pub struct MemoryBackend {
    topics: Arc<Mutex<HashMap<String, MemoryTopic>>>,
    partitions: u32,
    max_batch: usize,
}

impl MemoryBackend {
    pub fn new(partitions: u32) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            partitions,
            max_batch: 500,
        }
    }

    /// Topic `name`, created empty if it does not exist yet.
    pub fn topic(&self, name: &str) -> MemoryTopic {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| MemoryTopic::new(name, self.partitions))
            .clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Backend for MemoryBackend {
    type Source = MemorySource;
    type Sink = MemorySink;

    fn source(&self, topic: &str) -> EngineResult<MemorySource> {
        Ok(MemorySource {
            topic: self.topic(topic),
            positions: Watermark::new(),
            max_batch: self.max_batch,
        })
    }

    fn sink(&self, topic: &str) -> EngineResult<MemorySink> {
        Ok(MemorySink {
            topic: self.topic(topic),
        })
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
