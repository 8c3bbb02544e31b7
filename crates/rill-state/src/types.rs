//! Domain types for the rill state stores.

use std::collections::BTreeMap;

use rill_core::Watermark;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Latest value of a key together with the version that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub value: Vec<u8>,
    /// Monotonic per key: a source offset for tables, the count for
    /// aggregates.
    pub version: u64,
}

impl TableEntry {
    /// Encode as the redb snapshot column: version (8 bytes BE) then value.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.value.len());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> StateResult<Self> {
        if bytes.len() < 8 {
            return Err(StateError::Deserialize(format!(
                "snapshot entry of {} bytes",
                bytes.len()
            )));
        }
        let (version, value) = bytes.split_at(8);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(version);
        Ok(Self {
            value: value.to_vec(),
            version: u64::from_be_bytes(raw),
        })
    }
}

/// A durable checkpoint: the store snapshot and the source watermarks were
/// committed in the same redb transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic per group; doubles as the store snapshot id.
    pub id: u64,
    pub group: String,
    /// Topic name → next offset per partition.
    pub watermarks: BTreeMap<String, Watermark>,
    /// Stores whose dirty entries were captured by this checkpoint.
    pub stores: Vec<String>,
    /// Unix timestamp (milliseconds) when the checkpoint committed.
    pub created_at: u64,
}

impl Checkpoint {
    pub fn watermark(&self, topic: &str) -> Watermark {
        self.watermarks.get(topic).cloned().unwrap_or_default()
    }
}

/// Outcome of replaying a changelog into a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Frames that replaced (or created) an entry.
    pub applied: u64,
    /// Frames older than the entry already present.
    pub stale: u64,
    /// Byte position just past the last complete frame.
    pub position: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_snapshot_encoding() {
        let entry = TableEntry {
            value: b"seven".to_vec(),
            version: 3,
        };
        let bytes = entry.encode();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(TableEntry::decode(&bytes).unwrap(), entry);
        assert!(TableEntry::decode(&[1, 2]).is_err());
    }

    #[test]
    fn missing_topic_watermark_is_empty() {
        let checkpoint = Checkpoint {
            id: 1,
            group: "g".to_string(),
            watermarks: BTreeMap::new(),
            stores: Vec::new(),
            created_at: 0,
        };
        assert!(checkpoint.watermark("streams-input").is_empty());
    }
}
