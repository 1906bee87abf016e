//! Transport core demo server.
//!
//! Runs the transport on a TCP listener with an echo handler and drains
//! connections on SIGINT/SIGTERM.
//!
//! ```text
//!   TCP accept ──▶ limiter ──▶ Connection ──▶ registry
//!                                  │
//!        socket ◀══ byte pump ══▶ duplex pipe ◀══▶ EchoHandler
//!                                  │
//!   SIGTERM ──▶ Shutdown ──▶ walk_and_close(T1) ──▶ walk_and_abort(T2)
//! ```

use std::path::PathBuf;

use clap::Parser;

use transport_core::config::{load_config, TransportConfig};
use transport_core::echo::EchoHandler;
use transport_core::lifecycle::signals;
use transport_core::net::TcpReactor;
use transport_core::observability::{logging, metrics};
use transport_core::{Shutdown, Transport};

#[derive(Parser)]
#[command(name = "transport-core")]
#[command(about = "Echo server on the connection and transport core", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TransportConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        transport_core::config::validate_config(&config)
            .map_err(transport_core::config::ConfigError::Validation)?;
    }

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.listener.io_threads > 0 {
        runtime.worker_threads(config.listener.io_threads);
    }
    runtime.build()?.block_on(run(config))
}

async fn run(config: TransportConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(&config.observability)?;

    tracing::info!("transport-core v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        close_timeout_secs = config.shutdown.close_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let reactor = TcpReactor::bind(&config.listener).await?;
    let transport = Transport::new(reactor, EchoHandler, config)?;

    let shutdown = Shutdown::new();
    let run = transport.run(shutdown.subscribe());
    tokio::pin!(run);
    let finished = tokio::select! {
        result = &mut run => Some(result?),
        _ = signals::wait_for_signal() => None,
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            shutdown.trigger();
            run.await?
        }
    };

    tracing::info!(outcome = outcome.as_str(), "Shutdown complete");
    Ok(())
}
