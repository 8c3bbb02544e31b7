//! Filtered, projected table view over a keyed stream.

use rill_core::Record;
use rill_state::TypedStore;
use tracing::trace;

use crate::error::EngineResult;

type Predicate<K, V> = Box<dyn Fn(&K, &V) -> bool + Send + Sync>;
type Projection<V, P> = Box<dyn Fn(&V) -> P + Send + Sync>;

/// Keeps the latest projected value per key for records that pass a
/// predicate.
///
/// Records failing the predicate are dropped without a tombstone, so the
/// last stored value for their key stays in the table.
pub struct TableMaterializer<K, V, P> {
    table: TypedStore<K, P>,
    predicate: Predicate<K, V>,
    projection: Projection<V, P>,
    export: bool,
}

impl<K, V, P> TableMaterializer<K, V, P> {
    pub fn new(
        table: TypedStore<K, P>,
        predicate: impl Fn(&K, &V) -> bool + Send + Sync + 'static,
        projection: impl Fn(&V) -> P + Send + Sync + 'static,
    ) -> Self {
        Self {
            table,
            predicate: Box::new(predicate),
            projection: Box::new(projection),
            export: true,
        }
    }

    /// Emit a change record for every applied update (on by default).
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    pub fn table(&self) -> &TypedStore<K, P> {
        &self.table
    }

    /// Apply one record. Returns the change to export, if any.
    ///
    /// The entry is written with `version = offset`; a record older than
    /// the stored entry changes nothing and emits nothing.
    pub fn apply(&self, record: Record<K, V>) -> EngineResult<Option<Record<K, P>>> {
        if !(self.predicate)(&record.key, &record.value) {
            trace!(partition = record.partition, offset = record.offset, "filtered out of table");
            return Ok(None);
        }

        let projected = (self.projection)(&record.value);
        let applied = self.table.put(&record.key, &projected, record.offset)?;
        if applied && self.export {
            Ok(Some(record.with_value(projected)))
        } else {
            Ok(None)
        }
    }
}
