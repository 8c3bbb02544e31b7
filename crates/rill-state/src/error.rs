//! Error types for the rill state stores.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("changelog {path}: {source}")]
    Changelog {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The changelog ends in the middle of a frame. Every complete frame
    /// before `position` was read successfully.
    #[error("changelog {path} truncated mid-record at byte {position} after {applied} records")]
    CorruptChangelog {
        path: PathBuf,
        position: u64,
        applied: u64,
    },

    /// Local storage is exhausted; continuing would silently drop state.
    #[error("state store full: {0}")]
    StoreFull(String),

    /// The caller gave up on the checkpoint before it committed.
    #[error("checkpoint of group `{0}` abandoned before commit")]
    CheckpointAbandoned(String),

    #[error("invalid store name: {0:?}")]
    InvalidName(String),

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),

    #[error("codec error: {0}")]
    Codec(#[from] rill_core::CodecError),
}

impl StateError {
    /// Wrap an I/O error on a changelog, classifying disk exhaustion.
    pub(crate) fn changelog(path: &std::path::Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::StorageFull {
            StateError::StoreFull(format!("{}: {source}", path.display()))
        } else {
            StateError::Changelog {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Whether the process must stop rather than continue with this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StateError::CorruptChangelog { .. }
                | StateError::Codec(_)
                | StateError::CheckpointAbandoned(_)
        )
    }
}
