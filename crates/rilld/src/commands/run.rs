//! `rilld join|table|count|status` — run or inspect a processing group.

use anyhow::Context;
use rill_core::RillConfig;
use rill_engine::{FileBackend, Mode};
use rill_state::StateDir;
use tracing::{info, warn};

use crate::RunArgs;

/// Run `mode` until Ctrl-C (or SIGTERM) and a final checkpoint.
pub async fn run(args: &RunArgs, mode: Mode) -> anyhow::Result<()> {
    let config = RillConfig::try_from(args.config_file()?).context("invalid configuration")?;
    info!(
        mode = mode.name(),
        group = %config.processing_group_id,
        input = %config.input_topic,
        output = %config.output_topic,
        state = %config.state_directory.display(),
        log = %config.log_directory.display(),
        "rilld starting"
    );

    let backend = FileBackend::new(
        &config.log_directory,
        config.partitions,
        &config.processing_group_id,
    );
    let summary = rill_engine::run(&config, mode, &backend, shutdown_signal())
        .await
        .with_context(|| {
            format!(
                "{} processing group `{}` failed",
                mode.name(),
                config.processing_group_id
            )
        })?;

    info!(
        processed = summary.task.processed,
        emitted = summary.task.emitted,
        failed = summary.task.failed,
        checkpoint = summary.checkpoint.as_ref().map(|c| c.id),
        "rilld stopped"
    );
    Ok(())
}

/// Print the last checkpoint of the configured group as JSON.
pub fn status(args: &RunArgs) -> anyhow::Result<()> {
    let config = RillConfig::try_from(args.config_file()?).context("invalid configuration")?;
    let state = StateDir::open(&config.group_state_dir())
        .with_context(|| format!("opening state of `{}`", config.processing_group_id))?;
    match state.last_checkpoint(&config.processing_group_id)? {
        Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
        None => println!("no checkpoint for group `{}`", config.processing_group_id),
    }
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
