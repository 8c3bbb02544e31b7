//! Periodic checkpoints of state stores and source watermarks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill_core::Watermark;
use rill_state::{Checkpoint, KeyValueStore, StateDir};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Processed position of one source, shared between the task that
/// consumes it and the checkpoint scheduler.
#[derive(Debug)]
pub struct WatermarkTracker {
    topic: String,
    watermark: Mutex<Watermark>,
}

impl WatermarkTracker {
    /// Tracker for `topic` starting at `initial` (usually the last
    /// checkpointed watermark).
    pub fn new(topic: &str, initial: Watermark) -> Self {
        Self {
            topic: topic.to_string(),
            watermark: Mutex::new(initial),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Mark `offset` of `partition` as fully processed.
    pub fn advance(&self, partition: u32, offset: u64) {
        self.watermark
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .advance(partition, offset);
    }

    pub fn snapshot(&self) -> Watermark {
        self.watermark
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Flushes registered stores and persists watermarks every `interval`.
///
/// Completed checkpoints are published on a watch channel, see
/// [`CheckpointScheduler::subscribe`].
pub struct CheckpointScheduler {
    state: StateDir,
    group: String,
    stores: Vec<Arc<KeyValueStore>>,
    cursors: Vec<Arc<WatermarkTracker>>,
    interval: Duration,
    committed: watch::Sender<Option<Checkpoint>>,
}

impl CheckpointScheduler {
    pub fn new(state: StateDir, group: &str, interval: Duration) -> Self {
        let (committed, _) = watch::channel(None);
        Self {
            state,
            group: group.to_string(),
            stores: Vec::new(),
            cursors: Vec::new(),
            interval,
            committed,
        }
    }

    /// Include `store` in every checkpoint. Stores are locked in
    /// registration order.
    pub fn register_store(&mut self, store: Arc<KeyValueStore>) {
        self.stores.push(store);
    }

    /// Include the watermark of `cursor` in every checkpoint.
    pub fn track(&mut self, cursor: Arc<WatermarkTracker>) {
        self.cursors.push(cursor);
    }

    /// Receiver that sees every completed checkpoint.
    pub fn subscribe(&self) -> watch::Receiver<Option<Checkpoint>> {
        self.committed.subscribe()
    }

    /// Take one checkpoint now.
    pub async fn checkpoint(&self) -> EngineResult<Checkpoint> {
        self.checkpoint_unless(Arc::new(AtomicBool::new(false))).await
    }

    async fn checkpoint_unless(&self, abandoned: Arc<AtomicBool>) -> EngineResult<Checkpoint> {
        let state = self.state.clone();
        let group = self.group.clone();
        let stores = self.stores.clone();
        let cursors = self.cursors.clone();

        let checkpoint = tokio::task::spawn_blocking(move || {
            state.checkpoint_unless(
                &group,
                &stores,
                || {
                    cursors
                        .iter()
                        .map(|c| (c.topic().to_string(), c.snapshot()))
                        .collect::<BTreeMap<_, _>>()
                },
                &abandoned,
            )
        })
        .await
        .map_err(|e| EngineError::Task(format!("checkpoint task: {e}")))??;

        self.committed.send_replace(Some(checkpoint.clone()));
        Ok(checkpoint)
    }

    /// Checkpoint every `interval` until `shutdown` fires.
    ///
    /// Returns an error only for failures that must stop processing, such
    /// as a full store.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        info!(
            group = %self.group,
            interval_ms = self.interval.as_millis() as u64,
            stores = self.stores.len(),
            "checkpoint scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.checkpoint().await {
                        Ok(checkpoint) => {
                            debug!(id = checkpoint.id, "periodic checkpoint");
                        }
                        Err(EngineError::State(e)) if e.is_fatal() => {
                            return Err(EngineError::State(e));
                        }
                        Err(e) => warn!(error = %e, "checkpoint failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(group = %self.group, "checkpoint scheduler stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Last checkpoint before exit, abandoned when `deadline` expires.
    ///
    /// The checkpoint itself runs on a blocking thread that cannot be
    /// interrupted. Past the deadline it is told to roll back instead of
    /// committing; it still finishes the fsync it is in, and the runtime
    /// waits for that on exit. One that already reached its commit when
    /// the deadline fired completes normally.
    pub async fn final_checkpoint(&self, deadline: Duration) -> Option<Checkpoint> {
        let abandoned = Arc::new(AtomicBool::new(false));
        match tokio::time::timeout(deadline, self.checkpoint_unless(Arc::clone(&abandoned))).await {
            Ok(Ok(checkpoint)) => {
                info!(id = checkpoint.id, group = %self.group, "final checkpoint committed");
                Some(checkpoint)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "final checkpoint failed");
                None
            }
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "final checkpoint abandoned after shutdown timeout"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_never_moves_back() {
        let tracker = WatermarkTracker::new("in", Watermark::new());
        tracker.advance(0, 5);
        tracker.advance(0, 2);
        assert_eq!(tracker.snapshot().next_offset(0), 6);
    }

    #[tokio::test]
    async fn checkpoint_records_tracked_watermarks_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let store = state.open_store("counts").unwrap();
        let cursor = Arc::new(WatermarkTracker::new("streams-input", Watermark::new()));

        let mut scheduler = CheckpointScheduler::new(state.clone(), "g", Duration::from_secs(60));
        scheduler.register_store(Arc::clone(&store));
        scheduler.track(Arc::clone(&cursor));
        let mut committed = scheduler.subscribe();

        store.put(b"a", b"1", 1).unwrap();
        cursor.advance(0, 0);
        let checkpoint = scheduler.checkpoint().await.unwrap();

        assert_eq!(checkpoint.watermark("streams-input").next_offset(0), 1);
        assert!(committed.has_changed().unwrap());
        assert_eq!(committed.borrow_and_update().as_ref().map(|c| c.id), Some(1));
        assert_eq!(state.last_checkpoint("g").unwrap(), Some(checkpoint));
    }

    #[tokio::test]
    async fn final_checkpoint_past_deadline_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let store = state.open_store("counts").unwrap();
        let cursor = Arc::new(WatermarkTracker::new("streams-input", Watermark::new()));

        let mut scheduler = CheckpointScheduler::new(state.clone(), "g", Duration::from_secs(60));
        scheduler.register_store(Arc::clone(&store));
        scheduler.track(Arc::clone(&cursor));
        let committed = scheduler.subscribe();

        store.put(b"a", b"1", 1).unwrap();
        cursor.advance(0, 0);

        // Stall the checkpoint while it reads the watermarks.
        let held = cursor.watermark.lock().unwrap();
        let started = std::time::Instant::now();
        assert!(scheduler.final_checkpoint(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(held);

        // Blocks until the stalled checkpoint released the store writer.
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.put(b"b", b"1", 1).unwrap();

        assert!(state.last_checkpoint("g").unwrap().is_none());
        assert!(committed.borrow().is_none());
        assert!(std::fs::metadata(state.changelog_path("counts")).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn run_checkpoints_periodically_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let scheduler = Arc::new(CheckpointScheduler::new(
            state.clone(),
            "g",
            Duration::from_millis(10),
        ));
        let (stop, shutdown) = watch::channel(false);

        let runner = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { runner.run(shutdown).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let last = state.last_checkpoint("g").unwrap().unwrap();
        assert!(last.id >= 2);
    }
}
