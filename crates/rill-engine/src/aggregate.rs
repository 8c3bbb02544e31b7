//! Per-key running count.

use rill_core::Record;
use rill_state::TypedStore;

use crate::error::EngineResult;

/// Counts records per key in a local store.
///
/// Each new count is written with `version = count`, so counts for a key
/// only ever grow.
pub struct CountAggregator<K> {
    counts: TypedStore<K, u64>,
}

impl<K> CountAggregator<K> {
    pub fn new(counts: TypedStore<K, u64>) -> Self {
        Self { counts }
    }

    /// Increment the count for the record's key and return the new total
    /// keyed the same way.
    pub fn apply<V>(&mut self, record: Record<K, V>) -> EngineResult<Record<K, u64>> {
        let count = self.count(&record.key)? + 1;
        self.counts.put(&record.key, &count, count)?;
        Ok(record.with_value(count))
    }

    /// Current count for `key` (0 when never seen).
    pub fn count(&self, key: &K) -> EngineResult<u64> {
        Ok(self.counts.get(key)?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{U64Codec, Utf8Codec};
    use rill_state::StateDir;

    #[test]
    fn counts_grow_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let store = state.open_store("in-counts").unwrap();
        let mut counter = CountAggregator::new(TypedStore::new(store, Utf8Codec, U64Codec));

        let emitted: Vec<u64> = ["a", "a", "b", "a"]
            .iter()
            .enumerate()
            .map(|(offset, key)| {
                counter
                    .apply(Record::new(key.to_string(), (), 0, offset as u64, 0))
                    .unwrap()
                    .value
            })
            .collect();

        assert_eq!(emitted, vec![1, 2, 1, 3]);
        assert_eq!(counter.count(&"a".to_string()).unwrap(), 3);
        assert_eq!(counter.count(&"c".to_string()).unwrap(), 0);
    }

    #[test]
    fn counts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = StateDir::open(dir.path()).unwrap();
            let store = state.open_store("in-counts").unwrap();
            let mut counter = CountAggregator::new(TypedStore::new(store.clone(), Utf8Codec, U64Codec));
            counter.apply(Record::new("a".to_string(), (), 0, 0, 0)).unwrap();
            counter.apply(Record::new("a".to_string(), (), 0, 1, 0)).unwrap();
            store.flush().unwrap();
        }

        let state = StateDir::open(dir.path()).unwrap();
        let store = state.open_store("in-counts").unwrap();
        let mut counter = CountAggregator::new(TypedStore::new(store, Utf8Codec, U64Codec));
        let next = counter.apply(Record::new("a".to_string(), (), 0, 2, 0)).unwrap();
        assert_eq!(next.value, 3);
    }
}
