//! rilld — the rill daemon.
//!
//! Runs one processing group against the file-backed topic log, and
//! offers small helpers to write to and read from that log.
//!
//! # Usage
//!
//! ```text
//! rilld join  --config rill.toml
//! rilld table --config rill.toml --observe
//! rilld count --config rill.toml --group-by value
//! rilld count --config events.toml --group-by json-field --filter-prefix ''
//! rilld produce --config rill.toml --topic streams-input k1=good-7 k2=good-9
//! rilld produce --config rill.toml --topic fruits --key-format u64 7=seven
//! rilld consume --config rill.toml --topic streams-output --follow
//! rilld status  --config rill.toml
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rill_core::{ConfigFile, GroupBy};
use rill_engine::{FileBackend, Mode};

mod commands;

#[derive(Parser)]
#[command(name = "rilld", about = "rill stream-processing daemon", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Enrich the input topic from the reference topic's global table.
    Join(RunArgs),
    /// Materialize the input topic into a filtered, projected table.
    Table(RunArgs),
    /// Count input records per key.
    Count(RunArgs),
    /// Append records to a topic of the log.
    Produce(ProduceArgs),
    /// Print the records of a topic.
    Consume(ConsumeArgs),
    /// Show the last checkpoint of the processing group.
    Status(RunArgs),
}

/// Configuration file plus command-line overrides.
#[derive(Args, Clone, Default)]
pub(crate) struct RunArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    group_id: Option<String>,

    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Root of the file-backed topic log (default: <state-dir>/log).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    input_topic: Option<String>,

    #[arg(long)]
    output_topic: Option<String>,

    #[arg(long)]
    reference_topic: Option<String>,

    /// Topic receiving records that fail to parse or transform.
    #[arg(long)]
    error_topic: Option<String>,

    #[arg(long)]
    filter_prefix: Option<String>,

    /// e.g. "2500ms", "5s".
    #[arg(long)]
    checkpoint_interval: Option<String>,

    #[arg(long)]
    partitions: Option<u32>,

    /// Log every record entering and leaving the pipeline.
    #[arg(long)]
    observe: bool,

    /// What the count topology groups by.
    #[arg(long, value_enum)]
    group_by: Option<GroupByArg>,

    /// JSON field counted with `--group-by json-field` (default: event_type).
    #[arg(long)]
    json_field: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupByArg {
    Key,
    Value,
    JsonField,
}

impl RunArgs {
    /// The config file (if any) with every flag given here applied on top.
    pub(crate) fn config_file(&self) -> anyhow::Result<ConfigFile> {
        let file = match &self.config {
            Some(path) => ConfigFile::from_file(path)?,
            None => ConfigFile::default(),
        };
        let overrides = ConfigFile {
            processing_group_id: self.group_id.clone(),
            state_directory: self.state_dir.clone(),
            log_directory: self.log_dir.clone(),
            input_topic_name: self.input_topic.clone(),
            output_topic_name: self.output_topic.clone(),
            reference_topic_name: self.reference_topic.clone(),
            error_topic_name: self.error_topic.clone(),
            filter_prefix: self.filter_prefix.clone(),
            checkpoint_interval: self.checkpoint_interval.clone(),
            partitions: self.partitions,
            observe: self.observe.then_some(true),
            count_group_by: self.group_by.map(|g| match g {
                GroupByArg::Key => GroupBy::Key,
                GroupByArg::Value => GroupBy::Value,
                GroupByArg::JsonField => GroupBy::JsonField,
            }),
            count_json_field: self.json_field.clone(),
            ..Default::default()
        };
        Ok(file.merge(overrides))
    }
}

/// Location of the topic log, from flags or a configuration file.
#[derive(Args)]
pub(crate) struct LogArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root of the file-backed topic log.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    partitions: Option<u32>,
}

impl LogArgs {
    /// File backend for the log; offsets are committed under `group`.
    pub(crate) fn backend(&self, group: &str) -> anyhow::Result<FileBackend> {
        let file = match &self.config {
            Some(path) => ConfigFile::from_file(path)?,
            None => ConfigFile::default(),
        };
        let root = self
            .log_dir
            .clone()
            .or(file.log_directory)
            .or_else(|| file.state_directory.map(|dir| dir.join("log")))
            .ok_or_else(|| anyhow::anyhow!("--log-dir or a config file with state-directory is required"))?;
        let partitions = self.partitions.or(file.partitions).unwrap_or(1);
        anyhow::ensure!(partitions > 0, "partitions must be at least 1");
        Ok(FileBackend::new(&root, partitions, group))
    }
}

/// How keys or values are written and printed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Format {
    /// UTF-8 text.
    String,
    /// Big-endian unsigned 64-bit integer.
    U64,
}

#[derive(Args)]
pub(crate) struct ProduceArgs {
    #[command(flatten)]
    pub(crate) log: LogArgs,

    #[arg(short, long)]
    pub(crate) topic: String,

    #[arg(long, value_enum, default_value = "string")]
    pub(crate) key_format: Format,

    /// `key=value` pairs; read one per line from stdin when omitted.
    pub(crate) records: Vec<String>,
}

#[derive(Args)]
pub(crate) struct ConsumeArgs {
    #[command(flatten)]
    pub(crate) log: LogArgs,

    #[arg(short, long)]
    pub(crate) topic: String,

    #[arg(long, value_enum, default_value = "string")]
    pub(crate) key_format: Format,

    #[arg(long, value_enum, default_value = "string")]
    pub(crate) value_format: Format,

    /// Keep waiting for new records until interrupted.
    #[arg(short, long)]
    pub(crate) follow: bool,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,rilld=debug,rill=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Join(args) => commands::run::run(&args, Mode::Join).await,
        Command::Table(args) => commands::run::run(&args, Mode::Table).await,
        Command::Count(args) => commands::run::run(&args, Mode::Count).await,
        Command::Produce(args) => commands::produce::produce(&args).await,
        Command::Consume(args) => commands::consume::consume(&args).await,
        Command::Status(args) => commands::run::status(&args),
    }
}
