//! pilotd - autonomous coding-agent orchestration daemon.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use pilot_core::Config;
use pilotd::Daemon;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "pilotd", about = "Autonomous coding-agent orchestration daemon", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "PILOTD_CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = match Daemon::new(config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        };

        let run = daemon.run();
        tokio::pin!(run);

        let interrupted = tokio::select! {
            result = &mut run => {
                if let Err(e) = result {
                    error!("daemon error: {}", e);
                }
                false
            }
            () = wait_for_signal() => true,
        };

        if interrupted {
            daemon.shutdown();
            // Let the worker cancel and settle in-flight jobs.
            if let Err(e) = run.await {
                error!("daemon error during shutdown: {}", e);
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => tracing::info!("received SIGINT, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received interrupt, initiating graceful shutdown");
}
