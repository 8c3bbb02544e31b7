//! redb table definitions for the rill state directory.
//!
//! Both tables use `&str` keys and `&[u8]` values.

use redb::TableDefinition;

/// Checkpointed store entries keyed by `{store}/{hex(key)}`.
///
/// Values are the 8-byte big-endian version followed by the raw value.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Latest checkpoint per processing group, JSON-serialized, keyed by group id.
pub const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");
