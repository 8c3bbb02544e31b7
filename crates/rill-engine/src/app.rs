//! Assembles and runs one processing group.

use std::future::Future;
use std::sync::Arc;

use rill_core::{RillConfig, U64Codec, Utf8Codec};
use rill_state::{Checkpoint, StateDir, TypedStore};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info};

use crate::checkpoint::{CheckpointScheduler, WatermarkTracker};
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{Observer, noop_observer, tracing_observer};
use crate::replicator::GlobalTableReplicator;
use crate::source::{Backend, RecordSource};
use crate::task::{StreamTask, TaskSummary};
use crate::topology::{CountTopology, EnrichTopology, TableTopology, Topology};

/// Which topology a processing group runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Enrich the input stream from the reference topic's global table.
    Join,
    /// Materialize the input topic into a filtered, projected table.
    Table,
    /// Count input records per key.
    Count,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Join => "join",
            Mode::Table => "table",
            Mode::Count => "count",
        }
    }
}

/// Outcome of a clean run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub task: TaskSummary,
    /// The final checkpoint, if it completed before the shutdown timeout.
    pub checkpoint: Option<Checkpoint>,
}

enum Stopped {
    Signal,
    Task(Result<EngineResult<TaskSummary>, JoinError>),
    Scheduler(Result<EngineResult<()>, JoinError>),
    Replicator(Result<EngineResult<()>, JoinError>),
}

fn joined<T>(result: Result<EngineResult<T>, JoinError>) -> EngineResult<T> {
    result.map_err(|e| EngineError::Task(e.to_string()))?
}

/// Run `mode` for the group described by `config` until `shutdown`
/// resolves or a fatal error stops processing.
///
/// Recovers the group's stores, resumes every source at the last
/// checkpoint, bootstraps the global table (join mode), then runs the
/// stream task, the replicator and the checkpoint scheduler concurrently.
/// On exit a final checkpoint is attempted within `shutdown-timeout`.
pub async fn run<B: Backend>(
    config: &RillConfig,
    mode: Mode,
    backend: &B,
    shutdown: impl Future<Output = ()> + Send,
) -> EngineResult<RunSummary> {
    let group = config.processing_group_id.as_str();
    tokio::pin!(shutdown);
    if mode == Mode::Join {
        config.require_reference_topic()?;
    }

    let state = StateDir::open(&config.group_state_dir())?.with_max_entries(config.state_max_entries);
    let last = state.last_checkpoint(group)?;
    match &last {
        Some(checkpoint) => info!(
            %group,
            id = checkpoint.id,
            topics = checkpoint.watermarks.len(),
            "resuming from checkpoint"
        ),
        None => info!(%group, "no checkpoint, starting from the beginning"),
    }
    let resume_at = |topic: &str| {
        last.as_ref()
            .map(|c| c.watermark(topic))
            .unwrap_or_default()
    };

    let mut scheduler = CheckpointScheduler::new(state.clone(), group, config.checkpoint_interval);
    let observer: Observer<String, String> = if config.observe {
        tracing_observer()
    } else {
        noop_observer()
    };

    let mut replicator = None;
    let topology: Box<dyn Topology> = match mode {
        Mode::Join => {
            let topic = config.require_reference_topic()?;
            let store = state.open_store(&format!("{topic}-global"))?;
            scheduler.register_store(Arc::clone(&store));

            let cursor = Arc::new(WatermarkTracker::new(topic, resume_at(topic)));
            let mut source = backend.source(topic)?;
            source.seek(&cursor.snapshot())?;
            scheduler.track(Arc::clone(&cursor));

            let mut global = GlobalTableReplicator::new(source, store, cursor, config.poll_timeout);
            tokio::select! {
                bootstrapped = global.bootstrap() => {
                    bootstrapped?;
                }
                _ = &mut shutdown => {
                    info!(%group, "shutdown requested during bootstrap");
                    return Ok(RunSummary::default());
                }
            }
            let table = global.table(U64Codec, Utf8Codec);
            replicator = Some(global);
            Box::new(EnrichTopology::new(table, &config.filter_prefix, observer))
        }
        Mode::Table => {
            let store = state.open_store(&format!("{}-table", config.input_topic))?;
            scheduler.register_store(Arc::clone(&store));
            let table = TypedStore::new(store, Utf8Codec, Utf8Codec);
            Box::new(TableTopology::new(table, &config.filter_prefix, observer))
        }
        Mode::Count => {
            let store = state.open_store(&format!("{}-counts", config.input_topic))?;
            scheduler.register_store(Arc::clone(&store));
            let counts = TypedStore::new(store, Utf8Codec, U64Codec);
            Box::new(CountTopology::new(
                counts,
                &config.filter_prefix,
                config.count_group_by,
                &config.count_json_field,
                observer,
            ))
        }
    };

    let cursor = Arc::new(WatermarkTracker::new(
        &config.input_topic,
        resume_at(&config.input_topic),
    ));
    let mut source = backend.source(&config.input_topic)?;
    source.seek(&cursor.snapshot())?;
    scheduler.track(Arc::clone(&cursor));

    let mut stream = StreamTask::new(
        topology,
        source,
        backend.sink(&config.output_topic)?,
        cursor,
        config.poll_timeout,
    );
    if let Some(topic) = &config.error_topic {
        stream = stream.with_dead_letter(backend.sink(topic)?);
    }

    let scheduler = Arc::new(scheduler);
    let (stop, stopped) = watch::channel(false);

    let mut replicator = replicator
        .map(|r| tokio::spawn(r.run(stopped.clone(), scheduler.subscribe())));
    let mut task = tokio::spawn(stream.run(stopped.clone(), scheduler.subscribe()));
    let mut checkpoints = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(stopped).await })
    };
    info!(%group, mode = mode.name(), "processing started");

    let first = {
        let replicator_done = async {
            match replicator.as_mut() {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = &mut shutdown => Stopped::Signal,
            result = &mut task => Stopped::Task(result),
            result = &mut checkpoints => Stopped::Scheduler(result),
            result = replicator_done => Stopped::Replicator(result),
        }
    };

    let (mut task_out, mut scheduler_out, mut replicator_out) = (None, None, None);
    match first {
        Stopped::Signal => info!(%group, "shutdown requested"),
        Stopped::Task(result) => task_out = Some(result),
        Stopped::Scheduler(result) => scheduler_out = Some(result),
        Stopped::Replicator(result) => replicator_out = Some(result),
    }
    stop.send_replace(true);

    let task_result = joined(match task_out {
        Some(result) => result,
        None => task.await,
    });
    let scheduler_result = joined(match scheduler_out {
        Some(result) => result,
        None => checkpoints.await,
    });
    let replicator_result = match (replicator_out, replicator) {
        (Some(result), _) => joined(result),
        (None, Some(handle)) => joined(handle.await),
        (None, None) => Ok(()),
    };

    let checkpoint = scheduler.final_checkpoint(config.shutdown_timeout).await;

    for result in [&scheduler_result, &replicator_result] {
        if let Err(e) = result {
            error!(%group, error = %e, "processing stopped");
        }
    }
    let task = task_result?;
    scheduler_result?;
    replicator_result?;

    info!(
        %group,
        processed = task.processed,
        emitted = task.emitted,
        failed = task.failed,
        "processing stopped cleanly"
    );
    Ok(RunSummary { task, checkpoint })
}
