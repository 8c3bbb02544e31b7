//! rill-state — local, crash-recoverable key/value stores.
//!
//! # Architecture
//!
//! Every store lives inside a [`StateDir`]: one redb database holding the
//! checkpointed snapshot of all stores plus the checkpoint records, and one
//! append-only changelog file per store.
//!
//! ```text
//! StateDir (<state-directory>/<group>/)
//!   ├── state.redb          snapshot entries `{store}/{hex key}` + checkpoints
//!   ├── <store>.changelog   frames appended by every put since the last checkpoint
//!   └── ...
//! ```
//!
//! A `put` appends to the changelog and then updates the in-memory map that
//! readers see. `flush` fsyncs the changelog. A checkpoint copies the dirty
//! entries of every store and the source watermarks into redb in a single
//! write transaction, then truncates the changelogs. Opening a store loads
//! its snapshot and replays its changelog on top (last version wins), so a
//! crash at any point loses no flushed mutation.

pub mod changelog;
pub mod error;
pub mod state_dir;
pub mod store;
pub mod tables;
pub mod typed;
pub mod types;

pub use changelog::{Changelog, ChangelogReader, ChangelogRecord};
pub use error::{StateError, StateResult};
pub use state_dir::StateDir;
pub use store::{Entries, KeyValueStore};
pub use typed::TypedStore;
pub use types::*;
