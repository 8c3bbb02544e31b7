//! Stateless per-record transform chain.
//!
//! A [`Pipeline`] is an ordered list of steps applied to one record at a
//! time: filters drop records, value maps and key selectors rewrite them,
//! and observers see them without changing anything.

use std::sync::Arc;

use rill_core::Record;
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Side-effect hook invoked with a step label and the record passing by.
pub type Observer<K, V> = Arc<dyn Fn(&str, &Record<K, V>) + Send + Sync>;

type Predicate<K, V> = Box<dyn Fn(&K, &V) -> bool + Send + Sync>;
type ValueMapper<K, V> = Box<dyn Fn(&K, &V) -> Result<V, String> + Send + Sync>;
type KeySelector<K, V> = Box<dyn Fn(&K, &V) -> K + Send + Sync>;

enum Step<K, V> {
    Filter(Predicate<K, V>),
    MapValue(ValueMapper<K, V>),
    SelectKey(KeySelector<K, V>),
    Observe { label: String, observer: Observer<K, V> },
}

/// Ordered chain of stateless steps over `Record<K, V>`.
pub struct Pipeline<K, V> {
    steps: Vec<Step<K, V>>,
}

impl<K, V> Default for Pipeline<K, V> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<K, V> Pipeline<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep records for which `predicate` holds.
    pub fn filter(mut self, predicate: impl Fn(&K, &V) -> bool + Send + Sync + 'static) -> Self {
        self.steps.push(Step::Filter(Box::new(predicate)));
        self
    }

    /// Rewrite the value. An `Err` fails the record with
    /// [`EngineError::Transform`].
    pub fn map_value(
        mut self,
        mapper: impl Fn(&K, &V) -> Result<V, String> + Send + Sync + 'static,
    ) -> Self {
        self.steps.push(Step::MapValue(Box::new(mapper)));
        self
    }

    /// Rekey the record.
    pub fn select_key(mut self, selector: impl Fn(&K, &V) -> K + Send + Sync + 'static) -> Self {
        self.steps.push(Step::SelectKey(Box::new(selector)));
        self
    }

    /// Call `observer` with `label` for every record reaching this step.
    pub fn observe(mut self, label: &str, observer: Observer<K, V>) -> Self {
        self.steps.push(Step::Observe {
            label: label.to_string(),
            observer,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run `record` through every step. `Ok(None)` means a filter dropped it.
    pub fn apply(&self, mut record: Record<K, V>) -> EngineResult<Option<Record<K, V>>> {
        for step in &self.steps {
            match step {
                Step::Filter(predicate) => {
                    if !predicate(&record.key, &record.value) {
                        return Ok(None);
                    }
                }
                Step::MapValue(mapper) => {
                    record.value = mapper(&record.key, &record.value).map_err(|reason| {
                        EngineError::Transform {
                            partition: record.partition,
                            offset: record.offset,
                            reason,
                        }
                    })?;
                }
                Step::SelectKey(selector) => {
                    record.key = selector(&record.key, &record.value);
                }
                Step::Observe { label, observer } => observer(label, &record),
            }
        }
        Ok(Some(record))
    }
}

/// Observer that logs each record at info level.
pub fn tracing_observer<K, V>() -> Observer<K, V>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    Arc::new(|label: &str, record: &Record<K, V>| {
        info!(
            step = %label,
            key = ?record.key,
            value = ?record.value,
            partition = record.partition,
            offset = record.offset,
            "record observed"
        );
    })
}

/// Observer that does nothing.
pub fn noop_observer<K, V>() -> Observer<K, V> {
    Arc::new(|_: &str, _: &Record<K, V>| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn record(key: &str, value: &str, offset: u64) -> Record<String, String> {
        Record::new(key.to_string(), value.to_string(), 0, offset, 0)
    }

    #[test]
    fn filter_then_map() {
        let pipeline = Pipeline::<String, String>::new()
            .filter(|_, v| v.contains("good-"))
            .map_value(|_, v| Ok(v.to_uppercase()));

        let out = pipeline.apply(record("k1", "good-7", 0)).unwrap().unwrap();
        assert_eq!(out.value, "GOOD-7");
        assert!(pipeline.apply(record("k1", "bad-7", 1)).unwrap().is_none());
    }

    #[test]
    fn map_failure_carries_position() {
        let pipeline = Pipeline::<String, String>::new()
            .map_value(|_, v| v.parse::<u64>().map(|n| n.to_string()).map_err(|e| e.to_string()));

        let err = pipeline.apply(record("k", "seven", 4)).unwrap_err();
        assert!(matches!(err, EngineError::Transform { offset: 4, .. }));
        assert!(err.is_record_error());
    }

    #[test]
    fn observers_see_records_in_step_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Observer<String, String> = Arc::new(move |label, r| {
            sink.lock().unwrap().push(format!("{label}:{}", r.value));
        });

        let pipeline = Pipeline::new()
            .observe("In >>", Arc::clone(&observer))
            .filter(|_, v: &String| v.starts_with('a'))
            .select_key(|_, v| v.clone())
            .observe("Out <<", observer);

        pipeline.apply(record("k", "apple", 0)).unwrap();
        pipeline.apply(record("k", "pear", 1)).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["In >>:apple", "Out <<:apple", "In >>:pear"]
        );
    }

    #[test]
    fn empty_pipeline_passes_through() {
        let pipeline = Pipeline::<String, String>::new();
        assert!(pipeline.is_empty());
        let out = pipeline.apply(record("k", "v", 0)).unwrap();
        assert_eq!(out, Some(record("k", "v", 0)));
    }
}
