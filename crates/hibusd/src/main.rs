//! hibusd: the hiBus broker daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hibus::{Broker, BrokerConfig, UnixSocketServer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hibusd", version, about = "Local message bus broker")]
struct Args {
    /// Path of the Unix socket to listen on.
    #[arg(long, env = "HIBUS_SOCKET", default_value = hibus::config::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Host name reported to clients.
    #[arg(long, env = "HIBUS_HOST_NAME", default_value = "localhost")]
    host_name: String,

    #[arg(long, env = "HIBUS_MAX_CLIENTS", default_value_t = hibus::registry::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// Largest accepted frame payload, in bytes.
    #[arg(long, env = "HIBUS_MAX_FRAME_SIZE", default_value_t = hibus::wire::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// Seconds a new connection has to authenticate.
    #[arg(long, env = "HIBUS_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    handshake_timeout: u64,

    /// Seconds a call may stay unanswered when the caller sets no timeout.
    #[arg(long, env = "HIBUS_CALL_TIMEOUT", default_value_t = 30)]
    call_timeout: u64,

    #[arg(long, env = "HIBUS_MAX_CALL_TIMEOUT", default_value_t = 300)]
    max_call_timeout: u64,

    /// Milliseconds between sweeps for expired handshakes and calls.
    #[arg(long, env = "HIBUS_SWEEP_INTERVAL_MS", default_value_t = 1000)]
    sweep_interval_ms: u64,
}

impl Args {
    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::new()
            .with_socket_path(&self.socket)
            .with_host_name(&self.host_name)
            .with_max_clients(self.max_clients)
            .with_max_frame_size(self.max_frame_size)
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout))
            .with_call_timeout(Duration::from_secs(self.call_timeout))
            .with_max_call_timeout(Duration::from_secs(self.max_call_timeout))
            .with_sweep_interval(Duration::from_millis(self.sweep_interval_ms.max(1)))
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("HIBUS_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("hibus={level},hibusd={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.broker_config();

    let server = UnixSocketServer::bind(&config.socket_path, config.max_frame_size)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    tracing::info!(
        socket = %server.path().display(),
        host_name = %config.host_name,
        max_clients = config.max_clients,
        "hibusd listening"
    );

    let broker = Arc::new(Broker::new(config));
    let shutdown = CancellationToken::new();
    let sweeper = broker.spawn_sweeper(shutdown.clone());
    let mut serving = tokio::spawn(server.serve(Arc::clone(&broker), shutdown.clone()));

    let outcome = tokio::select! {
        signal = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            signal
        }
        served = &mut serving => {
            served.context("server task panicked")?.context("server stopped")?;
            Ok(())
        }
    };

    shutdown.cancel();
    if !serving.is_finished() {
        let _ = serving.await;
    }
    let _ = sweeper.await;
    tracing::info!(nr_endpoints = broker.nr_endpoints(), "hibusd stopped");
    outcome
}
