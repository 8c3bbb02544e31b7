//! StateDir — the redb database and changelog files of one processing group.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use rill_core::Watermark;
use tracing::{debug, info};

use crate::changelog::Changelog;
use crate::error::{StateError, StateResult};
use crate::store::KeyValueStore;
use crate::tables::*;
use crate::types::{Checkpoint, TableEntry};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Handle to a state directory. `Clone` + `Send` + `Sync`.
#[derive(Clone)]
pub struct StateDir {
    root: PathBuf,
    db: Arc<Database>,
    max_entries: Option<usize>,
}

impl StateDir {
    /// Open (or create) the state directory at `root`.
    pub fn open(root: &Path) -> StateResult<Self> {
        std::fs::create_dir_all(root).map_err(map_err!(Open))?;
        let db_path = root.join("state.redb");
        let db = Database::create(&db_path).map_err(map_err!(Open))?;
        let dir = Self {
            root: root.to_path_buf(),
            db: Arc::new(db),
            max_entries: None,
        };
        dir.ensure_tables()?;
        debug!(path = ?db_path, "state directory opened");
        Ok(dir)
    }

    /// Limit the number of keys each store opened from here may hold.
    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Path of the changelog backing store `name`.
    pub fn changelog_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.changelog"))
    }

    /// Open store `name`, recovering it from its snapshot and changelog.
    pub fn open_store(&self, name: &str) -> StateResult<Arc<KeyValueStore>> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(StateError::InvalidName(name.to_string()));
        }

        let snapshot = self.load_snapshot(name)?;
        let snapshot_len = snapshot.len();
        let changelog = Changelog::open(&self.changelog_path(name))?;
        let store = Arc::new(KeyValueStore::new(
            name,
            snapshot,
            changelog,
            self.max_entries,
        ));

        let restored = store.recover()?;
        info!(
            store = %name,
            snapshot = snapshot_len,
            replayed = restored.applied,
            "state store recovered"
        );
        Ok(store)
    }

    fn load_snapshot(&self, name: &str) -> StateResult<BTreeMap<Vec<u8>, TableEntry>> {
        let prefix = format!("{name}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let mut entries = BTreeMap::new();
        for item in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = item.map_err(map_err!(Read))?;
            let Some(hex_key) = key.value().strip_prefix(&prefix) else {
                break;
            };
            let raw_key = hex::decode(hex_key).map_err(map_err!(Deserialize))?;
            entries.insert(raw_key, TableEntry::decode(value.value())?);
        }
        Ok(entries)
    }

    /// Latest durable checkpoint of `group`.
    pub fn last_checkpoint(&self, group: &str) -> StateResult<Option<Checkpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        match table.get(group).map_err(map_err!(Read))? {
            Some(guard) => {
                let checkpoint: Checkpoint =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    /// Flush `stores` and persist their dirty entries together with the
    /// watermarks returned by `watermarks`, atomically.
    ///
    /// Every store's writer is held for the whole call, in slice order, so
    /// no `put` lands between the flush and the snapshot. `watermarks` is
    /// evaluated after the writers are locked; any record counted in it has
    /// all of its puts inside the snapshot.
    pub fn checkpoint<F>(
        &self,
        group: &str,
        stores: &[Arc<KeyValueStore>],
        watermarks: F,
    ) -> StateResult<Checkpoint>
    where
        F: FnOnce() -> BTreeMap<String, Watermark>,
    {
        self.checkpoint_unless(group, stores, watermarks, &AtomicBool::new(false))
    }

    /// [`StateDir::checkpoint`], dropped without committing when `abandoned`
    /// is set by the time the redb transaction is ready.
    ///
    /// An abandoned checkpoint leaves the previous checkpoint, the
    /// changelogs and the dirty sets untouched and returns
    /// [`StateError::CheckpointAbandoned`].
    pub fn checkpoint_unless<F>(
        &self,
        group: &str,
        stores: &[Arc<KeyValueStore>],
        watermarks: F,
        abandoned: &AtomicBool,
    ) -> StateResult<Checkpoint>
    where
        F: FnOnce() -> BTreeMap<String, Watermark>,
    {
        let mut writers = Vec::with_capacity(stores.len());
        for store in stores {
            writers.push(store.lock_writer()?);
        }
        for writer in writers.iter_mut() {
            writer.changelog.sync()?;
        }
        let watermarks = watermarks();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let checkpoint;
        let mut written = 0usize;
        {
            let mut entries = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            for (store, writer) in stores.iter().zip(writers.iter()) {
                let current = store.read_entries()?;
                for key in &writer.dirty {
                    if let Some(entry) = current.get(key) {
                        let table_key = format!("{}/{}", store.name(), hex::encode(key));
                        entries
                            .insert(table_key.as_str(), entry.encode().as_slice())
                            .map_err(map_err!(Write))?;
                        written += 1;
                    }
                }
            }

            let mut checkpoints = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
            let previous_id = match checkpoints.get(group).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice::<Checkpoint>(guard.value())
                        .map_err(map_err!(Deserialize))?
                        .id
                }
                None => 0,
            };
            checkpoint = Checkpoint {
                id: previous_id + 1,
                group: group.to_string(),
                watermarks,
                stores: stores.iter().map(|s| s.name().to_string()).collect(),
                created_at: epoch_millis(),
            };
            let value = serde_json::to_vec(&checkpoint).map_err(map_err!(Serialize))?;
            checkpoints
                .insert(group, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        if abandoned.load(Ordering::SeqCst) {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(%group, "checkpoint abandoned before commit");
            return Err(StateError::CheckpointAbandoned(group.to_string()));
        }
        txn.commit().map_err(map_err!(Transaction))?;

        // The snapshot now covers every frame; replaying them again would be
        // harmless, so a crash before this point needs no special handling.
        for writer in writers.iter_mut() {
            writer.changelog.truncate(0)?;
            writer.dirty.clear();
        }

        debug!(
            %group,
            id = checkpoint.id,
            entries = written,
            "checkpoint committed"
        );
        Ok(checkpoint)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
