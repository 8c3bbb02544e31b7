//! Stream-to-global-table inner join.

use rill_core::Record;
use tracing::trace;

use crate::error::{EngineError, EngineResult};
use crate::replicator::GlobalTable;

type Extractor<K, V, LK> = Box<dyn Fn(&K, &V) -> Result<LK, String> + Send + Sync>;
type Combiner<V, TV, O> = Box<dyn Fn(&V, &TV) -> O + Send + Sync>;

/// Enriches stream records with the matching global table entry.
///
/// The lookup key is derived from each record by `extract`. Records with
/// no table entry are dropped; matches are combined and keep the stream
/// record's key.
pub struct JoinOperator<K, V, LK, TV, O> {
    table: GlobalTable<LK, TV>,
    extract: Extractor<K, V, LK>,
    combine: Combiner<V, TV, O>,
}

impl<K, V, LK, TV, O> JoinOperator<K, V, LK, TV, O> {
    pub fn new(
        table: GlobalTable<LK, TV>,
        extract: impl Fn(&K, &V) -> Result<LK, String> + Send + Sync + 'static,
        combine: impl Fn(&V, &TV) -> O + Send + Sync + 'static,
    ) -> Self {
        Self {
            table,
            extract: Box::new(extract),
            combine: Box::new(combine),
        }
    }

    /// Join one record against the current table contents.
    ///
    /// A lookup key that cannot be extracted fails the record with
    /// [`EngineError::MalformedRecord`].
    pub fn apply(&self, record: Record<K, V>) -> EngineResult<Option<Record<K, O>>> {
        let lookup = (self.extract)(&record.key, &record.value).map_err(|reason| {
            EngineError::MalformedRecord {
                partition: record.partition,
                offset: record.offset,
                reason,
            }
        })?;

        match self.table.get(&lookup)? {
            Some(entry) => {
                let joined = (self.combine)(&record.value, &entry);
                Ok(Some(record.with_value(joined)))
            }
            None => {
                trace!(partition = record.partition, offset = record.offset, "no table entry, dropped");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{U64Codec, Utf8Codec};
    use rill_state::{StateDir, TypedStore};

    fn join(state: &StateDir) -> JoinOperator<String, u64, u64, String, String> {
        let table = TypedStore::new(state.open_store("fruits-global").unwrap(), U64Codec, Utf8Codec);
        table.put(&7, &"seven".to_string(), 0).unwrap();
        JoinOperator::new(table, |_, v: &u64| Ok(*v), |_, t: &String| t.clone())
    }

    #[test]
    fn match_takes_table_value_and_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let op = join(&state);

        let out = op
            .apply(Record::new("k1".to_string(), 7, 0, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(out.key, "k1");
        assert_eq!(out.value, "seven");
    }

    #[test]
    fn miss_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let op = join(&state);

        assert!(op.apply(Record::new("k1".to_string(), 9, 0, 1, 0)).unwrap().is_none());
    }

    #[test]
    fn extraction_failure_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let table = TypedStore::new(state.open_store("fruits-global").unwrap(), U64Codec, Utf8Codec);
        let op = JoinOperator::new(
            table,
            |_, v: &String| v.parse::<u64>().map_err(|e| e.to_string()),
            |_, t: &String| t.clone(),
        );

        let err = op
            .apply(Record::new("k1".to_string(), "x".to_string(), 2, 11, 0))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MalformedRecord { partition: 2, offset: 11, .. }
        ));
    }
}
