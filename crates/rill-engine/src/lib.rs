//! rill-engine — the stateful stream-processing engine.
//!
//! Wires record sources and sinks through a stateless transform pipeline
//! into one of three stateful operators, and checkpoints the resulting
//! state on a fixed interval.
//!
//! # Architecture
//!
//! ```text
//! run()
//!   ├── GlobalTableReplicator task (reference topic → replica store)
//!   ├── StreamTask (input topic → Pipeline → Join | Materializer | Count → sink)
//!   └── CheckpointScheduler task (flush stores + persist watermarks)
//! ```
//!
//! All three tasks share one shutdown channel. The scheduler publishes
//! every completed checkpoint on a watch channel; the stream task and the
//! replicator commit their watermark to their source when they see it.

pub mod aggregate;
pub mod app;
pub mod checkpoint;
pub mod error;
pub mod file_log;
pub mod join;
pub mod materializer;
pub mod memory;
pub mod pipeline;
pub mod replicator;
pub mod source;
pub mod task;
pub mod topology;

pub use aggregate::CountAggregator;
pub use app::{Mode, RunSummary, run};
pub use checkpoint::{CheckpointScheduler, WatermarkTracker};
pub use error::{EngineError, EngineResult};
pub use file_log::FileBackend;
pub use join::JoinOperator;
pub use materializer::TableMaterializer;
pub use memory::{MemoryBackend, MemoryTopic};
pub use pipeline::{Observer, Pipeline};
pub use replicator::{GlobalTable, GlobalTableReplicator};
pub use source::{Backend, RecordSink, RecordSource, SinkError};
pub use task::{Backoff, StreamTask, TaskSummary};
pub use topology::{CountTopology, EnrichTopology, TableTopology, Topology};
