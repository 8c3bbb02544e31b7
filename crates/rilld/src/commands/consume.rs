//! `rilld consume` — print the records of a topic.

use std::time::Duration;

use rill_core::{Codec, RawRecord, U64Codec};
use rill_engine::{Backend, RecordSource};
use tracing::info;

use crate::{ConsumeArgs, Format};

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub async fn consume(args: &ConsumeArgs) -> anyhow::Result<()> {
    let backend = args.log.backend("rilld-consume")?;
    let mut source = backend.source(&args.topic)?;
    let mut printed = 0u64;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            batch = source.pull(POLL_TIMEOUT) => {
                let batch = batch?;
                if batch.is_empty() && !args.follow {
                    break;
                }
                for record in &batch {
                    println!("{}", render(record, args.key_format, args.value_format));
                }
                printed += batch.len() as u64;
            }
        }
    }

    info!(topic = %args.topic, records = printed, "consume finished");
    Ok(())
}

/// `partition:offset<TAB>key<TAB>value`.
fn render(record: &RawRecord, key_format: Format, value_format: Format) -> String {
    format!(
        "{}:{}\t{}\t{}",
        record.partition,
        record.offset,
        show(&record.key, key_format),
        show(&record.value, value_format)
    )
}

fn show(bytes: &[u8], format: Format) -> String {
    match format {
        Format::String => String::from_utf8_lossy(bytes).into_owned(),
        Format::U64 => match U64Codec.decode(bytes) {
            Ok(n) => n.to_string(),
            Err(_) => format!("<{} bytes>", bytes.len()),
        },
    }
}
