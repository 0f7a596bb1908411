use std::io::{self, Write};

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walcast_config::{to_backpressure, to_stream_settings, SinkKind, WalcastConfig};
use walcast_core::{format_lsn, ChangeEvent, CheckpointStore, Dispatcher};
use walcast_pg::{connect_control, ConnectionTarget, ReplicationConnection, ReplicationSession};

use crate::cli::RunArgs;

pub async fn cmd_run(mut config: WalcastConfig, args: RunArgs) -> Result<()> {
    apply_overrides(&mut config, args);

    let settings = to_stream_settings(&config).context("Invalid configuration")?;
    let connection_string = config.postgres.connection_string.clone();

    info!(
        prefix = %settings.slot_prefix,
        plugin = %settings.plugin,
        "Starting walcast replication"
    );

    let target = ConnectionTarget::parse(&connection_string).context("Invalid connection string")?;
    let control = connect_control(&connection_string)
        .await
        .context("Failed to connect to Postgres")?;
    let transport = ReplicationConnection::connect(&target)
        .await
        .context("Failed to open replication connection")?;

    let (dispatcher, consumer) = match config.dispatch.sink {
        SinkKind::Log => (Dispatcher::log(), None),
        SinkKind::Json => {
            let (dispatcher, receiver) = Dispatcher::channel(
                config.dispatch.queue_capacity,
                to_backpressure(&config.dispatch),
            );
            (dispatcher, Some(spawn_json_writer(receiver)))
        }
    };

    let mut session = ReplicationSession::new(settings, control, transport, dispatcher);
    if let Some(path) = &config.checkpoint.path {
        session = session.with_checkpoint(CheckpointStore::new(path));
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            signal_token.cancel();
        }
    });

    let result = session.run(cancel).await;

    // The session owned the sender; the writer drains what is queued and exits.
    if let Some(consumer) = consumer {
        if let Err(e) = consumer.await {
            warn!(error = %e, "JSON writer task failed");
        }
    }

    let summary = result.context("Replication session failed")?;

    eprintln!();
    eprintln!("{} {}", "Session finished:".green().bold(), summary.slot_name);
    eprintln!("  messages        {}", summary.messages);
    eprintln!("  events          {}", summary.events);
    if summary.dropped > 0 {
        eprintln!("  dropped         {}", summary.dropped.to_string().yellow());
    }
    if summary.skipped > 0 {
        eprintln!("  skipped         {}", summary.skipped.to_string().yellow());
    }
    eprintln!("  status updates  {}", summary.status_updates);
    eprintln!("  flushed LSN     {}", format_lsn(summary.flushed_lsn));

    Ok(())
}

/// Fold command-line flags into the loaded config.
fn apply_overrides(config: &mut WalcastConfig, args: RunArgs) {
    if let Some(prefix) = args.slot_prefix {
        config.slot.prefix = prefix;
    }
    if let Some(slot) = args.slot {
        config.slot.name = Some(slot);
    }
    if let Some(sink) = args.sink {
        config.dispatch.sink = sink.into();
    }
    if let Some(lsn) = args.start_lsn {
        config.stream.start_lsn = Some(lsn);
    }
}

/// Print every event as one JSON line on stdout. Stops when the session
/// drops its sender or stdout goes away.
fn spawn_json_writer(mut receiver: mpsc::Receiver<ChangeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize change event");
                    continue;
                }
            };

            let mut stdout = io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
                warn!(error = %e, "Stopped writing events to stdout");
                return;
            }
        }
    })
}
