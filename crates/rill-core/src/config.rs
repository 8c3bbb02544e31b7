//! rill.toml configuration parser.
//!
//! The file is read once at startup into a [`ConfigFile`] (every key
//! optional), command-line overrides are merged on top, and the result is
//! validated into an immutable [`RillConfig`] that components receive by
//! reference.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(2500);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_FILTER_PREFIX: &str = "good-";
pub const DEFAULT_COUNT_JSON_FIELD: &str = "event_type";

/// Errors detected while loading configuration. All of them are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required option `{0}`")]
    Missing(&'static str),

    #[error("invalid duration for `{key}`: {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// How the count topology chooses its group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupBy {
    /// Count per record key.
    #[default]
    Key,
    /// Count per projected value (the part after the filter prefix).
    Value,
    /// Count per value of one field of a JSON record value, see
    /// `count-json-field`.
    JsonField,
}

/// Raw on-disk configuration; every key is optional so that CLI flags can
/// fill the gaps before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    pub processing_group_id: Option<String>,
    pub state_directory: Option<PathBuf>,
    pub log_directory: Option<PathBuf>,
    pub input_topic_name: Option<String>,
    pub output_topic_name: Option<String>,
    pub reference_topic_name: Option<String>,
    pub error_topic_name: Option<String>,
    pub filter_prefix: Option<String>,
    pub checkpoint_interval: Option<String>,
    pub poll_timeout: Option<String>,
    pub shutdown_timeout: Option<String>,
    pub state_max_entries: Option<usize>,
    pub partitions: Option<u32>,
    pub observe: Option<bool>,
    pub count_group_by: Option<GroupBy>,
    pub count_json_field: Option<String>,
}

impl ConfigFile {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay every option set in `other` on top of `self`.
    pub fn merge(mut self, other: ConfigFile) -> Self {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            processing_group_id,
            state_directory,
            log_directory,
            input_topic_name,
            output_topic_name,
            reference_topic_name,
            error_topic_name,
            filter_prefix,
            checkpoint_interval,
            poll_timeout,
            shutdown_timeout,
            state_max_entries,
            partitions,
            observe,
            count_group_by,
            count_json_field,
        );
        self
    }
}

/// Validated, immutable runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RillConfig {
    /// Identity of this processing group; names the checkpoint record.
    pub processing_group_id: String,
    pub state_directory: PathBuf,
    /// Root of the file-backed topic log.
    pub log_directory: PathBuf,
    pub input_topic: String,
    pub output_topic: String,
    pub reference_topic: Option<String>,
    /// Where malformed records are routed; logged and skipped when unset.
    pub error_topic: Option<String>,
    pub filter_prefix: String,
    pub checkpoint_interval: Duration,
    pub poll_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub state_max_entries: Option<usize>,
    pub partitions: u32,
    /// Log every record entering and leaving the pipeline.
    pub observe: bool,
    pub count_group_by: GroupBy,
    /// Field read by [`GroupBy::JsonField`].
    pub count_json_field: String,
}

impl RillConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::try_from(ConfigFile::from_file(path)?)
    }

    /// The reference topic, required by the join topology.
    pub fn require_reference_topic(&self) -> Result<&str, ConfigError> {
        self.reference_topic
            .as_deref()
            .ok_or(ConfigError::Missing("reference-topic-name"))
    }

    /// Directory holding this group's stores and checkpoint database.
    pub fn group_state_dir(&self) -> PathBuf {
        self.state_directory.join(&self.processing_group_id)
    }
}

impl TryFrom<ConfigFile> for RillConfig {
    type Error = ConfigError;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        let processing_group_id = non_empty(file.processing_group_id, "processing-group-id")?;
        let state_directory = file
            .state_directory
            .ok_or(ConfigError::Missing("state-directory"))?;
        let log_directory = file
            .log_directory
            .unwrap_or_else(|| state_directory.join("log"));
        let input_topic = non_empty(file.input_topic_name, "input-topic-name")?;
        let output_topic = non_empty(file.output_topic_name, "output-topic-name")?;

        let partitions = file.partitions.unwrap_or(1);
        if partitions == 0 {
            return Err(ConfigError::Invalid {
                key: "partitions",
                reason: "must be at least 1".to_string(),
            });
        }
        if file.state_max_entries == Some(0) {
            return Err(ConfigError::Invalid {
                key: "state-max-entries",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            processing_group_id,
            state_directory,
            log_directory,
            input_topic,
            output_topic,
            reference_topic: file.reference_topic_name.filter(|t| !t.is_empty()),
            error_topic: file.error_topic_name.filter(|t| !t.is_empty()),
            filter_prefix: file
                .filter_prefix
                .unwrap_or_else(|| DEFAULT_FILTER_PREFIX.to_string()),
            checkpoint_interval: duration_or(
                file.checkpoint_interval,
                "checkpoint-interval",
                DEFAULT_CHECKPOINT_INTERVAL,
            )?,
            poll_timeout: duration_or(file.poll_timeout, "poll-timeout", DEFAULT_POLL_TIMEOUT)?,
            shutdown_timeout: duration_or(
                file.shutdown_timeout,
                "shutdown-timeout",
                DEFAULT_SHUTDOWN_TIMEOUT,
            )?,
            state_max_entries: file.state_max_entries,
            partitions,
            observe: file.observe.unwrap_or(false),
            count_group_by: file.count_group_by.unwrap_or_default(),
            count_json_field: match file.count_json_field {
                None => DEFAULT_COUNT_JSON_FIELD.to_string(),
                Some(field) if field.trim().is_empty() => {
                    return Err(ConfigError::Invalid {
                        key: "count-json-field",
                        reason: "must not be empty".to_string(),
                    });
                }
                Some(field) => field,
            },
        })
    }
}

fn non_empty(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn duration_or(
    value: Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => {
            parse_duration(&raw).ok_or(ConfigError::InvalidDuration { key, value: raw })
        }
    }
}

/// Parse a duration string like "2500ms", "5s", "1m". A bare number is
/// milliseconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_millis)
    }
}
