//! KeyValueStore — a single named local state store.
//!
//! Readers go through a short `RwLock` on the in-memory map. Writers are
//! serialized by the writer mutex, which also guards the changelog; a
//! checkpoint takes the same mutex, so it never interleaves with a `put`.
//!
//! The map sits behind an `Arc`: [`KeyValueStore::iter`] shares it, and a
//! `put` while an iterator is alive copies the map once before writing.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use tracing::{debug, warn};

use crate::changelog::{Changelog, ChangelogReader, ChangelogRecord};
use crate::error::{StateError, StateResult};
use crate::types::{RestoreSummary, TableEntry};

/// Writer-side state, only touched while holding the writer mutex.
pub(crate) struct StoreWriter {
    pub(crate) changelog: Changelog,
    /// Keys mutated since the last checkpoint.
    pub(crate) dirty: BTreeSet<Vec<u8>>,
}

/// Ownership-exclusive key/value store with changelog-backed recovery.
pub struct KeyValueStore {
    name: String,
    entries: RwLock<Arc<BTreeMap<Vec<u8>, TableEntry>>>,
    writer: Mutex<StoreWriter>,
    max_entries: Option<usize>,
}

impl KeyValueStore {
    pub(crate) fn new(
        name: &str,
        snapshot: BTreeMap<Vec<u8>, TableEntry>,
        changelog: Changelog,
        max_entries: Option<usize>,
    ) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(StoreWriter {
                changelog,
                dirty: BTreeSet::new(),
            }),
            max_entries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest entry for `key`, if any.
    pub fn get(&self, key: &[u8]) -> StateResult<Option<TableEntry>> {
        Ok(self.read_entries()?.get(key).cloned())
    }

    /// Write `value` for `key` at `version`.
    ///
    /// Returns `false` (and writes nothing) when the stored entry already
    /// has a higher version. An equal version overwrites, which keeps
    /// redelivered records harmless for tables.
    pub fn put(&self, key: &[u8], value: &[u8], version: u64) -> StateResult<bool> {
        let mut writer = self.lock_writer()?;

        {
            let entries = self.read_entries()?;
            match entries.get(key) {
                Some(existing) if version < existing.version => {
                    debug!(store = %self.name, version, current = existing.version, "stale put ignored");
                    return Ok(false);
                }
                Some(_) => {}
                None => match self.max_entries {
                    Some(max) if entries.len() >= max => {
                        return Err(StateError::StoreFull(format!(
                            "store `{}` reached its limit of {max} entries",
                            self.name
                        )));
                    }
                    _ => {}
                },
            }
        }

        writer.changelog.append(&ChangelogRecord {
            key: key.to_vec(),
            value: value.to_vec(),
            version,
        })?;
        writer.dirty.insert(key.to_vec());

        let mut entries = self
            .entries
            .write()
            .map_err(|_| StateError::Poisoned("store entries"))?;
        Arc::make_mut(&mut *entries).insert(
            key.to_vec(),
            TableEntry {
                value: value.to_vec(),
                version,
            },
        );
        Ok(true)
    }

    /// Iterate over a consistent snapshot of the store in key order.
    ///
    /// Each call starts a fresh pass over the contents at call time. The
    /// iterator holds no lock and yields entries one by one.
    pub fn iter(&self) -> StateResult<Entries> {
        Ok(Entries {
            snapshot: Arc::clone(&*self.read_entries()?),
            after: None,
        })
    }

    pub fn len(&self) -> StateResult<usize> {
        Ok(self.read_entries()?.len())
    }

    pub fn is_empty(&self) -> StateResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Make every prior `put` durable.
    pub fn flush(&self) -> StateResult<()> {
        let mut writer = self.lock_writer()?;
        writer.changelog.sync()?;
        debug!(store = %self.name, position = writer.changelog.position(), "store flushed");
        Ok(())
    }

    /// Replay the changelog at `path` into this store, last version wins.
    ///
    /// Frames are applied without being re-appended. Replaying the same
    /// changelog any number of times leaves the same contents. When the
    /// file ends mid-frame every complete frame is applied and
    /// [`StateError::CorruptChangelog`] is returned.
    pub fn restore(&self, path: &Path) -> StateResult<RestoreSummary> {
        let mut writer = self.lock_writer()?;
        let mut summary = RestoreSummary::default();
        let mut reader = ChangelogReader::open(path)?;

        let mut guard = self
            .entries
            .write()
            .map_err(|_| StateError::Poisoned("store entries"))?;
        let entries = Arc::make_mut(&mut *guard);

        for frame in reader.by_ref() {
            let (_, record) = frame?;
            let fresh = entries
                .get(&record.key)
                .is_none_or(|existing| record.version >= existing.version);
            if fresh {
                writer.dirty.insert(record.key.clone());
                entries.insert(
                    record.key,
                    TableEntry {
                        value: record.value,
                        version: record.version,
                    },
                );
                summary.applied += 1;
            } else {
                summary.stale += 1;
            }
        }

        summary.position = reader.position();
        Ok(summary)
    }

    /// Restore from this store's own changelog, cutting a torn tail.
    pub(crate) fn recover(&self) -> StateResult<RestoreSummary> {
        let path = self.lock_writer()?.changelog.path().to_path_buf();
        match self.restore(&path) {
            Ok(summary) => Ok(summary),
            Err(StateError::CorruptChangelog {
                position, applied, ..
            }) => {
                warn!(
                    store = %self.name,
                    path = %path.display(),
                    position,
                    applied,
                    "changelog truncated mid-record, resuming from last complete record"
                );
                self.lock_writer()?.changelog.truncate(position)?;
                Ok(RestoreSummary {
                    applied,
                    stale: 0,
                    position,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn lock_writer(&self) -> StateResult<MutexGuard<'_, StoreWriter>> {
        self.writer
            .lock()
            .map_err(|_| StateError::Poisoned("store writer"))
    }

    pub(crate) fn read_entries(
        &self,
    ) -> StateResult<RwLockReadGuard<'_, Arc<BTreeMap<Vec<u8>, TableEntry>>>> {
        self.entries
            .read()
            .map_err(|_| StateError::Poisoned("store entries"))
    }
}

/// Iterator returned by [`KeyValueStore::iter`].
pub struct Entries {
    snapshot: Arc<BTreeMap<Vec<u8>, TableEntry>>,
    /// Last key yielded.
    after: Option<Vec<u8>>,
}

impl Iterator for Entries {
    type Item = (Vec<u8>, TableEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let lower = match &self.after {
            Some(key) => Bound::Excluded(key.as_slice()),
            None => Bound::Unbounded,
        };
        let (key, entry) = self
            .snapshot
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()?;
        let item = (key.clone(), entry.clone());
        self.after = Some(item.0.clone());
        Some(item)
    }
}

impl std::fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("name", &self.name)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateDir;

    fn open(dir: &tempfile::TempDir, name: &str) -> std::sync::Arc<KeyValueStore> {
        StateDir::open(dir.path()).unwrap().open_store(name).unwrap()
    }

    #[test]
    fn put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "fruits");

        assert!(store.put(b"7", b"seven", 0).unwrap());
        let entry = store.get(b"7").unwrap().unwrap();
        assert_eq!(entry.value, b"seven");
        assert!(store.get(b"8").unwrap().is_none());
    }

    #[test]
    fn put_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "fruits");

        store.put(b"7", b"seven", 1).unwrap();
        store.put(b"7", b"SEVEN", 2).unwrap();
        assert_eq!(store.get(b"7").unwrap().unwrap().value, b"SEVEN");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn stale_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "fruits");

        store.put(b"7", b"new", 5).unwrap();
        assert!(!store.put(b"7", b"old", 4).unwrap());
        assert_eq!(store.get(b"7").unwrap().unwrap().value, b"new");
        // Same version overwrites.
        assert!(store.put(b"7", b"again", 5).unwrap());
    }

    #[test]
    fn iter_is_ordered_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "counts");
        store.put(b"b", b"2", 1).unwrap();
        store.put(b"a", b"1", 1).unwrap();

        let first: Vec<_> = store.iter().unwrap().map(|(k, _)| k).collect();
        assert_eq!(first, vec![b"a".to_vec(), b"b".to_vec()]);

        // A put after the first pass shows up in the next one.
        store.put(b"c", b"3", 1).unwrap();
        assert_eq!(store.iter().unwrap().count(), 3);
    }

    #[test]
    fn iter_keeps_its_snapshot_across_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "counts");
        store.put(b"a", b"1", 1).unwrap();
        store.put(b"c", b"1", 1).unwrap();

        let mut pass = store.iter().unwrap();
        assert_eq!(pass.next().unwrap().0, b"a".to_vec());
        store.put(b"b", b"1", 1).unwrap();
        store.put(b"c", b"2", 2).unwrap();

        let (key, entry) = pass.next().unwrap();
        assert_eq!((key, entry.value), (b"c".to_vec(), b"1".to_vec()));
        assert!(pass.next().is_none());
        assert_eq!(store.get(b"c").unwrap().unwrap().value, b"2");
    }

    #[test]
    fn max_entries_rejects_new_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateDir::open(dir.path())
            .unwrap()
            .with_max_entries(Some(1))
            .open_store("counts")
            .unwrap();

        store.put(b"a", b"1", 1).unwrap();
        store.put(b"a", b"2", 2).unwrap();
        let err = store.put(b"b", b"1", 1).unwrap_err();
        assert!(matches!(err, StateError::StoreFull(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn restore_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("external.changelog");
        {
            let mut log = Changelog::open(&path).unwrap();
            for (key, value, version) in [("a", "1", 1), ("b", "1", 1), ("a", "2", 2)] {
                log.append(&ChangelogRecord {
                    key: key.as_bytes().to_vec(),
                    value: value.as_bytes().to_vec(),
                    version,
                })
                .unwrap();
            }
            log.sync().unwrap();
        }

        let store = open(&dir, "replica");
        let once = store.restore(&path).unwrap();
        assert_eq!(once.applied, 3);
        let after_once: Vec<_> = store.iter().unwrap().collect();

        let twice = store.restore(&path).unwrap();
        let after_twice: Vec<_> = store.iter().unwrap().collect();
        assert_eq!(after_once, after_twice);
        // The first frame for `a` is older than what is stored now.
        assert_eq!(twice.stale, 1);
        assert_eq!(store.get(b"a").unwrap().unwrap().value, b"2");
    }
}
