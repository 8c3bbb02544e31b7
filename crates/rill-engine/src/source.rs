//! Source and sink contracts for partitioned record logs.
//!
//! The engine is generic over these traits; [`crate::memory`] and
//! [`crate::file_log`] provide the two bundled backends.

use std::future::Future;
use std::time::Duration;

use rill_core::{RawRecord, Watermark};
use thiserror::Error;

use crate::error::EngineResult;

/// Ordered, partitioned record source with at-least-once redelivery.
pub trait RecordSource: Send {
    fn topic(&self) -> &str;

    /// Next batch of records, in offset order per partition.
    ///
    /// Waits at most `timeout`; an empty batch means nothing arrived in
    /// time and is not an error. Must be cancel-safe: dropping the future
    /// loses no record.
    fn pull(&mut self, timeout: Duration) -> impl Future<Output = EngineResult<Vec<RawRecord>>> + Send;

    /// Record that everything below `watermark` has been checkpointed.
    fn commit(&mut self, watermark: &Watermark) -> EngineResult<()>;

    /// Resume reading at `watermark` (partitions absent from it start at 0).
    fn seek(&mut self, watermark: &Watermark) -> EngineResult<()>;
}

/// Errors returned by [`RecordSink::publish`].
#[derive(Debug, Error)]
pub enum SinkError {
    /// Retry the same record later.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink rejected record: {0}")]
    Rejected(String),
}

/// Destination log that preserves per-key order.
pub trait RecordSink: Send {
    fn topic(&self) -> &str;

    /// Publish one record; resolves once the log acknowledged it.
    fn publish(
        &mut self,
        key: &[u8],
        value: &[u8],
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Factory for sources and sinks of one log system.
pub trait Backend: Send + Sync + 'static {
    type Source: RecordSource + 'static;
    type Sink: RecordSink + 'static;

    fn source(&self, topic: &str) -> EngineResult<Self::Source>;
    fn sink(&self, topic: &str) -> EngineResult<Self::Sink>;
}

/// Partition for `key` out of `partitions` (FNV-1a), stable across runs.
pub fn partition_for(key: &[u8], partitions: u32) -> u32 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let hash = key
        .iter()
        .fold(OFFSET_BASIS, |acc, b| (acc ^ u64::from(*b)).wrapping_mul(PRIME));
    (hash % u64::from(partitions.max(1))) as u32
}
