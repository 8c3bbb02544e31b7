//! Record model shared by sources, operators, and sinks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single record read from (or written to) a partitioned log.
///
/// `offset` is the position of the record inside `partition`. Records with
/// the same key always come from the same partition, so offsets are
/// comparable per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<K, V> {
    pub key: K,
    pub value: V,
    pub partition: u32,
    pub offset: u64,
    /// Milliseconds since the unix epoch, as stamped by the producer.
    pub timestamp: u64,
}

/// Byte-level record as exchanged with sources and sinks.
pub type RawRecord = Record<Vec<u8>, Vec<u8>>;

impl<K, V> Record<K, V> {
    pub fn new(key: K, value: V, partition: u32, offset: u64, timestamp: u64) -> Self {
        Self {
            key,
            value,
            partition,
            offset,
            timestamp,
        }
    }

    /// Replace the value, keeping key and position.
    pub fn with_value<W>(self, value: W) -> Record<K, W> {
        Record {
            key: self.key,
            value,
            partition: self.partition,
            offset: self.offset,
            timestamp: self.timestamp,
        }
    }

    /// Replace the key, keeping value and position.
    pub fn with_key<J>(self, key: J) -> Record<J, V> {
        Record {
            key,
            value: self.value,
            partition: self.partition,
            offset: self.offset,
            timestamp: self.timestamp,
        }
    }
}

/// Per-partition read position: the next offset to consume.
///
/// A watermark of `{0: 12}` means every record of partition 0 below offset
/// 12 has been processed and its effects are covered by a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub partitions: BTreeMap<u32, u64>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` in `partition` has been fully processed.
    ///
    /// Never moves a partition backwards.
    pub fn advance(&mut self, partition: u32, offset: u64) {
        let next = offset + 1;
        let slot = self.partitions.entry(partition).or_insert(0);
        if next > *slot {
            *slot = next;
        }
    }

    /// Next offset to read for `partition` (0 when never advanced).
    pub fn next_offset(&self, partition: u32) -> u64 {
        self.partitions.get(&partition).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_advances_per_partition() {
        let mut wm = Watermark::new();
        wm.advance(0, 4);
        wm.advance(1, 0);
        assert_eq!(wm.next_offset(0), 5);
        assert_eq!(wm.next_offset(1), 1);
        assert_eq!(wm.next_offset(7), 0);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut wm = Watermark::new();
        wm.advance(0, 9);
        wm.advance(0, 3);
        assert_eq!(wm.next_offset(0), 10);
    }

    #[test]
    fn record_rekey_keeps_position() {
        let record = Record::new("k1".to_string(), "good-7".to_string(), 2, 41, 1000);
        let rekeyed = record.with_key(7u64);
        assert_eq!(rekeyed.key, 7);
        assert_eq!(rekeyed.partition, 2);
        assert_eq!(rekeyed.offset, 41);
    }
}
