//! Daemon entry point: CLI parsing, tracing, signals, exit codes.

use std::process::ExitCode;
use std::time::Duration;

use alder::Service;
use alder::ServiceConfig;
use alder_db::PgStore;
use alder_etcd::EtcdConfig;
use alder_etcd::EtcdSync;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bidirectional synchronization between etcd and PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "alder")]
#[command(version)]
#[command(about = "Bidirectional synchronization between etcd and PostgreSQL")]
struct Args {
    /// PostgreSQL connection string (postgres://...).
    #[arg(short = 'p', long, env = "ALDER_POSTGRES_DSN")]
    postgres_dsn: String,

    /// etcd connection string (etcd://host1:port1[,host2:port2]/prefix).
    #[arg(short = 'e', long, env = "ALDER_ETCD_DSN")]
    etcd_dsn: String,

    /// Polling interval for the PostgreSQL-to-etcd direction.
    #[arg(long, env = "ALDER_POLLING_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    polling_interval: Duration,

    /// Log level when RUST_LOG is unset: debug|info|warn|error.
    #[arg(short = 'l', long, env = "ALDER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Validate configuration and connectivity, then exit.
    #[arg(long)]
    dry_run: bool,
}

/// Initialize tracing with environment-based filtering; the CLI level is
/// the fallback when RUST_LOG is unset.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => error!("failed to install Ctrl+C handler: {}", err),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let etcd_config = EtcdConfig::parse(&args.etcd_dsn).context("invalid etcd DSN")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let store = match PgStore::connect_with_retry(&cancel, &args.postgres_dsn).await {
        Ok(store) => store,
        Err(_) if cancel.is_cancelled() => return Ok(()),
        Err(err) => return Err(err).context("failed to connect to PostgreSQL after retries"),
    };
    let etcd = match EtcdSync::connect_with_retry(&cancel, &etcd_config).await {
        Ok(etcd) => etcd,
        Err(_) if cancel.is_cancelled() => return Ok(()),
        Err(err) => return Err(err).context("failed to connect to etcd after retries"),
    };

    if args.dry_run {
        info!(
            prefix = %etcd_config.prefix,
            polling_interval_ms = args.polling_interval.as_millis() as u64,
            "dry run: configuration validated, both endpoints reachable"
        );
        return Ok(());
    }

    let service = Service::new(
        store,
        etcd,
        ServiceConfig {
            polling_interval: args.polling_interval,
        },
    );
    service.run(cancel).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "alder starting");

    match run(args).await {
        Ok(()) => {
            info!("graceful shutdown completed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "synchronization failed");
            ExitCode::FAILURE
        }
    }
}
