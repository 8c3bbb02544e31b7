//! `rilld produce` — append `key=value` records to a topic.

use anyhow::{Context, bail};
use rill_core::{Codec, U64Codec};
use rill_engine::{Backend, RecordSink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::{Format, ProduceArgs};

pub async fn produce(args: &ProduceArgs) -> anyhow::Result<()> {
    let backend = args.log.backend("rilld-produce")?;
    let mut sink = backend.sink(&args.topic)?;

    let mut lines = args.records.clone();
    if lines.is_empty() {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = stdin.next_line().await? {
            lines.push(line);
        }
    }

    let mut produced = 0u64;
    for line in lines.iter().filter(|l| !l.trim().is_empty()) {
        let (key, value) = parse_pair(line)?;
        let key = encode_key(key, args.key_format)?;
        sink.publish(&key, value.as_bytes())
            .await
            .with_context(|| format!("publishing `{line}` to {}", args.topic))?;
        produced += 1;
    }

    info!(topic = %args.topic, records = produced, "records produced");
    Ok(())
}

/// Split `key=value` at the first `=`.
fn parse_pair(line: &str) -> anyhow::Result<(&str, &str)> {
    match line.split_once('=') {
        Some((key, value)) => Ok((key.trim(), value)),
        None => bail!("expected key=value, got `{line}`"),
    }
}

fn encode_key(key: &str, format: Format) -> anyhow::Result<Vec<u8>> {
    match format {
        Format::String => Ok(key.as_bytes().to_vec()),
        Format::U64 => {
            let id: u64 = key
                .parse()
                .with_context(|| format!("key `{key}` is not an unsigned integer"))?;
            Ok(U64Codec.encode(&id))
        }
    }
}
