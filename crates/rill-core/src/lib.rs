//! rill-core — shared types for the rill stream-processing runtime.
//!
//! Holds the record model exchanged between sources, operators and sinks,
//! the pluggable value codecs, and the immutable runtime configuration.

pub mod codec;
pub mod config;
pub mod record;

pub use codec::{Codec, CodecError, JsonCodec, U64Codec, Utf8Codec};
pub use config::{ConfigError, ConfigFile, GroupBy, RillConfig};
pub use record::{RawRecord, Record, Watermark};
