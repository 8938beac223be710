mod config;
mod merge;

use std::sync::Arc;

use anyhow::{bail, Context};
use autosave_core::{HostEvent, HostSignals, Record, SaveStatus, StateObserver};
use autosave_engine::{Session, SessionBuilder};
use autosave_http::HttpRemoteStore;
use autosave_local::LocalFileStore;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config, MergeStrategy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (stderr, so stdout stays for command output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    info!("Starting autosave-cli for key {}", config.key);
    info!("  Remote: {}", config.remote_url);
    info!("  Data dir: {}", config.data_dir().display());

    let http_client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let mut remote = HttpRemoteStore::with_client(http_client, config.remote_url.clone());
    if let Some(token) = &config.api_token {
        remote = remote.with_token(token.clone());
    }
    let remote = Arc::new(remote);
    let store = Arc::new(LocalFileStore::new(config.data_dir()));

    let builder = Session::builder(config.key.clone(), remote.clone(), store)
        .config(config.autosave_config());

    match config.command {
        Command::Edit { merge } => edit(builder, &remote, &config.key, merge).await,
        Command::Recover => recover(builder.online(false)).await,
        Command::Replay => replay(builder).await,
    }
}

/// Stream records from stdin into an autosave session until EOF or Ctrl-C.
async fn edit(
    builder: SessionBuilder,
    remote: &HttpRemoteStore,
    key: &str,
    merge: MergeStrategy,
) -> anyhow::Result<()> {
    let signals = HostSignals::new();
    let log_states: Arc<dyn StateObserver> = Arc::new(|status: &SaveStatus| {
        info!(
            state = %status.state,
            pending = status.has_pending_changes,
            queued = status.queued_items,
            "Save state changed"
        );
    });
    let mut builder = builder.signals(&signals).observer(log_states);
    if let Some(resolver) = merge::resolver_for(merge) {
        builder = builder.resolver(resolver);
    }

    match remote.fetch(key).await {
        Ok(Some((record, version))) => {
            info!("Opened remote record {} (version {:?})", key, version);
            builder = builder.baseline(record, version);
        }
        Ok(None) => info!("No remote record for {} yet", key),
        Err(e) => {
            warn!("Remote store unreachable, starting offline: {}", e);
            builder = builder.online(false);
        }
    }

    let session = builder.build();
    session.initialize().await.context("Failed to restore session")?;
    if session.has_pending_changes() {
        warn!("Recovered unsaved changes from an earlier session");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => {}
            ":save" => match session.manual_save().await {
                Ok(outcome) => info!("Manual save: {}", outcome),
                Err(e) => warn!("Manual save failed: {}", e),
            },
            ":status" => print_status(&session.status())?,
            ":offline" => {
                signals.emit(HostEvent::Offline);
            }
            ":online" => {
                signals.emit(HostEvent::Online);
            }
            _ => match serde_json::from_str::<Record>(line) {
                Ok(record) => {
                    session.update_data(record).await?;
                }
                Err(e) => warn!("Skipping line that is not JSON: {}", e),
            },
        }
    }

    if let Some(case) = session.conflict() {
        println!("{}", serde_json::to_string_pretty(&case)?);
        bail!("Unresolved conflict with remote version {:?}", case.remote_version);
    }

    if session.has_pending_changes() {
        let outcome = session
            .manual_save()
            .await
            .context("Final save failed; changes stay in the recovery snapshot")?;
        info!("Final save: {}", outcome);
    }

    print_status(&session.status())?;
    session.cleanup();
    Ok(())
}

/// Show what an earlier session left behind, without contacting the remote.
async fn recover(builder: SessionBuilder) -> anyhow::Result<()> {
    let session = builder.build();
    session.initialize().await.context("Failed to read local state")?;

    match session.get_recovery_data() {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => info!("No recovery snapshot"),
    }

    let queued = session.queued_items().await;
    for item in &queued {
        info!(
            "Queued {} from {} ({} failed attempts)",
            item.id, item.enqueued_at, item.attempt_count
        );
    }
    info!("{} saves queued", queued.len());
    Ok(())
}

async fn replay(builder: SessionBuilder) -> anyhow::Result<()> {
    let session = builder.build();
    session.initialize().await.context("Failed to read local state")?;

    let report = session.retry_failed_saves().await?;
    info!("Replayed {} saves, {} remaining", report.replayed, report.remaining);
    print_status(&session.status())?;

    if let Some(stalled) = report.stalled {
        bail!("Sync stalled at {}: {}", stalled.item_id, stalled.error);
    }
    Ok(())
}

fn print_status(status: &SaveStatus) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(status)?);
    Ok(())
}
