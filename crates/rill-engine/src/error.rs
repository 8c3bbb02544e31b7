//! Engine error types.

use rill_core::ConfigError;
use rill_state::StateError;
use thiserror::Error;

/// Errors raised by the processing engine.
///
/// Per-record errors ([`EngineError::is_record_error`]) are isolated to the
/// offending record; everything else stops the processing task.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source or sink unreachable; retried with backoff.
    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("malformed record at {partition}:{offset}: {reason}")]
    MalformedRecord {
        partition: u32,
        offset: u64,
        reason: String,
    },

    #[error("transform failed at {partition}:{offset}: {reason}")]
    Transform {
        partition: u32,
        offset: u64,
        reason: String,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A source or sink that cannot be opened or rejects writes for good.
    #[error("{topic}: {reason}")]
    Connector { topic: String, reason: String },

    #[error("task failed: {0}")]
    Task(String),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Errors confined to a single record: skip it and keep going.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            EngineError::MalformedRecord { .. }
                | EngineError::Transform { .. }
                | EngineError::State(StateError::Codec(_))
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    pub(crate) fn connector(topic: &str, reason: impl std::fmt::Display) -> Self {
        EngineError::Connector {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let malformed = EngineError::MalformedRecord {
            partition: 0,
            offset: 3,
            reason: "no number".to_string(),
        };
        assert!(malformed.is_record_error());
        assert!(!malformed.is_transient());

        let full = EngineError::State(StateError::StoreFull("disk".to_string()));
        assert!(!full.is_record_error());

        assert!(EngineError::Transient("refused".to_string()).is_transient());
    }
}
