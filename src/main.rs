use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use smtp_dup::config::{Config, find_config_file};
use smtp_dup::relay::{BackupPool, RelayBackend, RelayDispatcher, SmtpRelay};
use smtp_dup::{ServerHandle, SmtpServer, logging};

/// SMTP relay that copies every accepted message to backup upstreams
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file (default: $SMTP_DUP_CONFIG, ./config.toml,
    /// /etc/smtp-dup/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init();

    let config_path = find_config_file(args.config)?;
    let mut config = Config::load(&config_path)?;
    config.apply_env()?;
    let destinations = config.validate()?;
    info!(
        config = %config_path.display(),
        primary = %destinations.primary,
        backups = destinations.backups.len(),
        trigger = ?config.relay.trigger,
        "Configuration loaded"
    );

    let transport = Arc::new(SmtpRelay::new(
        &config.smtp.domain,
        config.relay.tls,
        config.relay_timeout(),
    ));
    let pool = Arc::new(
        BackupPool::new(config.relay.backup_workers, config.relay.backup_queue)
            .context("Failed to start backup workers")?,
    );
    let dispatcher = Arc::new(RelayDispatcher::new(
        destinations,
        transport,
        Arc::clone(&pool),
    ));

    let server = SmtpServer::new(
        &config.smtp.domain,
        RelayBackend::new(dispatcher, config.relay.trigger),
    )
    .with_limits(config.server_limits());

    let listener = TcpListener::bind(&config.smtp.listen)
        .with_context(|| format!("Failed to listen on {}", config.smtp.listen))?;
    let local_addr = listener.local_addr()?;

    spawn_signal_watcher(server.handle(), local_addr)?;
    server.start_with_listener(listener)?;

    let report = pool.shutdown(config.shutdown_grace());
    if report.drained {
        info!(
            jobs = report.completed,
            delivered = report.stats.delivered,
            failed = report.stats.failed,
            dropped = report.stats.dropped,
            "Backup deliveries drained"
        );
    } else {
        warn!(
            jobs = report.completed,
            abandoned = report.abandoned,
            delivered = report.stats.delivered,
            failed = report.stats.failed,
            dropped = report.stats.dropped,
            "Shutdown grace period expired"
        );
    }

    Ok(())
}

/// Stop the accept loop on Ctrl-C or SIGTERM
fn spawn_signal_watcher(handle: ServerHandle, addr: SocketAddr) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Err(e) = runtime.block_on(wait_for_shutdown()) {
                error!(error = %e, "Signal handling failed, shutting down");
            }
            handle.stop(addr);
        })
        .context("Failed to spawn signal watcher")?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            info!("Terminate signal received, shutting down");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("CTRL+C entered, shutting down");
    Ok(())
}
