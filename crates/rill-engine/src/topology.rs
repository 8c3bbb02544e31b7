//! The three processing topologies run by the engine.
//!
//! Each topology decodes raw input records, runs them through a
//! [`Pipeline`] and one stateful operator, and encodes what should be
//! published to the output topic.

use rill_core::{Codec, GroupBy, JsonCodec, RawRecord, Record, U64Codec, Utf8Codec};
use serde_json::Value;
use rill_state::TypedStore;

use crate::aggregate::CountAggregator;
use crate::error::{EngineError, EngineResult};
use crate::join::JoinOperator;
use crate::materializer::TableMaterializer;
use crate::pipeline::{Observer, Pipeline};
use crate::replicator::GlobalTable;

/// A record-at-a-time processor from input records to output records.
pub trait Topology: Send {
    fn name(&self) -> &'static str;

    /// Process one input record, returning the records to publish.
    fn process(&mut self, record: RawRecord) -> EngineResult<Vec<RawRecord>>;
}

impl<T: Topology + ?Sized> Topology for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn process(&mut self, record: RawRecord) -> EngineResult<Vec<RawRecord>> {
        (**self).process(record)
    }
}

/// Part of `value` after its first `-`, or all of it when there is none.
pub fn after_first_dash(value: &str) -> &str {
    value.split_once('-').map_or(value, |(_, rest)| rest)
}

fn decode_utf8(record: RawRecord) -> EngineResult<Record<String, String>> {
    let malformed = |reason: String| EngineError::MalformedRecord {
        partition: record.partition,
        offset: record.offset,
        reason,
    };
    let key = Utf8Codec
        .decode(&record.key)
        .map_err(|e| malformed(format!("key: {e}")))?;
    let value = Utf8Codec
        .decode(&record.value)
        .map_err(|e| malformed(format!("value: {e}")))?;
    Ok(record.with_key(key).with_value(value))
}

fn encode_utf8(record: Record<String, String>) -> RawRecord {
    let key = record.key.clone().into_bytes();
    let value = record.value.clone().into_bytes();
    record.with_key(key).with_value(value)
}

fn prefix_filter(prefix: &str) -> impl Fn(&String, &String) -> bool + Send + Sync + 'static {
    let prefix = prefix.to_string();
    move |_, value| value.contains(prefix.as_str())
}

/// Enrich `"<prefix><id>"` records with the global table entry for `id`.
pub struct EnrichTopology {
    pipeline: Pipeline<String, String>,
    join: JoinOperator<String, String, u64, String, String>,
    observer: Observer<String, String>,
}

impl EnrichTopology {
    pub fn new(
        table: GlobalTable<u64, String>,
        filter_prefix: &str,
        observer: Observer<String, String>,
    ) -> Self {
        let pipeline = Pipeline::new()
            .observe("In >>", observer.clone())
            .filter(prefix_filter(filter_prefix));
        let join = JoinOperator::new(
            table,
            |_, value: &String| {
                let id = after_first_dash(value);
                id.parse::<u64>()
                    .map_err(|e| format!("lookup key `{id}`: {e}"))
            },
            |_, reference: &String| reference.clone(),
        );
        Self {
            pipeline,
            join,
            observer,
        }
    }
}

impl Topology for EnrichTopology {
    fn name(&self) -> &'static str {
        "join"
    }

    fn process(&mut self, record: RawRecord) -> EngineResult<Vec<RawRecord>> {
        let Some(record) = self.pipeline.apply(decode_utf8(record)?)? else {
            return Ok(Vec::new());
        };
        match self.join.apply(record)? {
            Some(joined) => {
                (self.observer)("Out <<", &joined);
                Ok(vec![encode_utf8(joined)])
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Materialize `"<prefix>..."` records into a table of their suffixes and
/// export every change.
pub struct TableTopology {
    pipeline: Pipeline<String, String>,
    materializer: TableMaterializer<String, String, String>,
    observer: Observer<String, String>,
}

impl TableTopology {
    pub fn new(
        table: TypedStore<String, String>,
        filter_prefix: &str,
        observer: Observer<String, String>,
    ) -> Self {
        Self {
            pipeline: Pipeline::new().observe("In >>", observer.clone()),
            materializer: TableMaterializer::new(
                table,
                prefix_filter(filter_prefix),
                |value: &String| after_first_dash(value).to_string(),
            ),
            observer,
        }
    }
}

impl Topology for TableTopology {
    fn name(&self) -> &'static str {
        "table"
    }

    fn process(&mut self, record: RawRecord) -> EngineResult<Vec<RawRecord>> {
        let Some(record) = self.pipeline.apply(decode_utf8(record)?)? else {
            return Ok(Vec::new());
        };
        match self.materializer.apply(record)? {
            Some(change) => {
                (self.observer)("Out <<", &change);
                Ok(vec![encode_utf8(change)])
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Text of `field` in the JSON object `value`; strings are taken as is,
/// other JSON values in their JSON form.
fn json_field(events: &JsonCodec<Value>, value: &str, field: &str) -> Result<String, String> {
    let event = events
        .decode(value.as_bytes())
        .map_err(|e| format!("not a JSON event: {e}"))?;
    match event.get(field) {
        Some(Value::String(text)) => Ok(text.clone()),
        None | Some(Value::Null) => Err(format!("event has no `{field}`")),
        Some(other) => Ok(other.to_string()),
    }
}

/// Count `"<prefix>..."` records per key, per value suffix with
/// [`GroupBy::Value`], or per JSON field with [`GroupBy::JsonField`].
/// Counts are published as big-endian `u64`.
pub struct CountTopology {
    pipeline: Pipeline<String, String>,
    counter: CountAggregator<String>,
    observer: Observer<String, String>,
}

impl CountTopology {
    pub fn new(
        counts: TypedStore<String, u64>,
        filter_prefix: &str,
        group_by: GroupBy,
        json_field_name: &str,
        observer: Observer<String, String>,
    ) -> Self {
        let pipeline = Pipeline::new()
            .observe("In >>", observer.clone())
            .filter(prefix_filter(filter_prefix));
        let pipeline = match group_by {
            GroupBy::Key => pipeline,
            GroupBy::Value => pipeline.select_key(|_, value| after_first_dash(value).to_string()),
            GroupBy::JsonField => {
                let field = json_field_name.to_string();
                let events = JsonCodec::<Value>::new();
                pipeline
                    .map_value(move |_, value| json_field(&events, value, &field))
                    .select_key(|_, value| value.clone())
            }
        };
        Self {
            pipeline,
            counter: CountAggregator::new(counts),
            observer,
        }
    }
}

impl Topology for CountTopology {
    fn name(&self) -> &'static str {
        "count"
    }

    fn process(&mut self, record: RawRecord) -> EngineResult<Vec<RawRecord>> {
        let Some(record) = self.pipeline.apply(decode_utf8(record)?)? else {
            return Ok(Vec::new());
        };
        let counted = self.counter.apply(record)?;
        let shown = counted.clone().with_value(counted.value.to_string());
        (self.observer)("Out <<", &shown);

        let value = U64Codec.encode(&counted.value);
        let key = counted.key.clone().into_bytes();
        Ok(vec![counted.with_key(key).with_value(value)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::noop_observer;
    use rill_state::StateDir;

    fn raw(key: &str, value: &str, offset: u64) -> RawRecord {
        RawRecord::new(key.into(), value.into(), 0, offset, 0)
    }

    fn pairs(records: Vec<RawRecord>) -> Vec<(String, String)> {
        records
            .into_iter()
            .map(|r| {
                (
                    String::from_utf8(r.key).unwrap(),
                    String::from_utf8(r.value).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn after_first_dash_cases() {
        assert_eq!(after_first_dash("good-42"), "42");
        assert_eq!(after_first_dash("good-4-2"), "4-2");
        assert_eq!(after_first_dash("plain"), "plain");
        assert_eq!(after_first_dash("good-"), "");
    }

    #[test]
    fn enrich_joins_on_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let table = TypedStore::new(state.open_store("fruits-global").unwrap(), U64Codec, Utf8Codec);
        table.put(&7, &"seven".to_string(), 0).unwrap();
        let mut topology = EnrichTopology::new(table, "good-", noop_observer());

        let out = topology.process(raw("k1", "good-7", 0)).unwrap();
        assert_eq!(pairs(out), vec![("k1".to_string(), "seven".to_string())]);
        assert!(topology.process(raw("k1", "good-9", 1)).unwrap().is_empty());
        assert!(topology.process(raw("k1", "bad-7", 2)).unwrap().is_empty());

        let err = topology.process(raw("k1", "good-seven", 3)).unwrap_err();
        assert!(matches!(err, EngineError::MalformedRecord { offset: 3, .. }));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let table = TypedStore::new(state.open_store("t").unwrap(), Utf8Codec, Utf8Codec);
        let mut topology = TableTopology::new(table, "good-", noop_observer());

        let record = RawRecord::new(b"k".to_vec(), vec![0xff, 0xfe], 0, 0, 0);
        let err = topology.process(record).unwrap_err();
        assert!(err.is_record_error());
    }

    #[test]
    fn table_exports_projected_changes() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let table = TypedStore::new(state.open_store("in-table").unwrap(), Utf8Codec, Utf8Codec);
        let mut topology = TableTopology::new(table.clone(), "good-", noop_observer());

        let out = topology.process(raw("k", "good-42", 0)).unwrap();
        assert_eq!(pairs(out), vec![("k".to_string(), "42".to_string())]);
        assert!(topology.process(raw("j", "bad-42", 1)).unwrap().is_empty());
        assert!(table.get(&"j".to_string()).unwrap().is_none());
    }

    #[test]
    fn count_by_value_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let counts = TypedStore::new(state.open_store("in-counts").unwrap(), Utf8Codec, U64Codec);
        let mut topology =
            CountTopology::new(counts, "good-", GroupBy::Value, "event_type", noop_observer());

        let mut emitted = Vec::new();
        for (offset, (key, value)) in [("k1", "good-x"), ("k2", "good-x"), ("k3", "good-y")]
            .into_iter()
            .enumerate()
        {
            for out in topology.process(raw(key, value, offset as u64)).unwrap() {
                emitted.push((
                    String::from_utf8(out.key).unwrap(),
                    U64Codec.decode(&out.value).unwrap(),
                ));
            }
        }
        assert_eq!(
            emitted,
            vec![
                ("x".to_string(), 1),
                ("x".to_string(), 2),
                ("y".to_string(), 1)
            ]
        );
    }

    #[test]
    fn count_by_json_field() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let counts = TypedStore::new(state.open_store("events-counts").unwrap(), Utf8Codec, U64Codec);
        let mut topology =
            CountTopology::new(counts.clone(), "", GroupBy::JsonField, "event_type", noop_observer());

        let events = [
            r#"{"event_type":"click","user_id":1}"#,
            r#"{"event_type":"page_view","user_id":2}"#,
            r#"{"event_type":"click","user_id":3}"#,
        ];
        let mut emitted = Vec::new();
        for (offset, event) in events.into_iter().enumerate() {
            for out in topology.process(raw("u", event, offset as u64)).unwrap() {
                emitted.push((
                    String::from_utf8(out.key).unwrap(),
                    U64Codec.decode(&out.value).unwrap(),
                ));
            }
        }
        assert_eq!(
            emitted,
            vec![
                ("click".to_string(), 1),
                ("page_view".to_string(), 1),
                ("click".to_string(), 2)
            ]
        );

        let err = topology.process(raw("u", "not json", 3)).unwrap_err();
        assert!(matches!(err, EngineError::Transform { offset: 3, .. }));
        let err = topology.process(raw("u", r#"{"user_id":4}"#, 4)).unwrap_err();
        assert!(err.is_record_error());
        assert_eq!(counts.get(&"click".to_string()).unwrap(), Some(2));
    }
}
