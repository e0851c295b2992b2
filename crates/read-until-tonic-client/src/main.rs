#![doc = include_str!("../README.md")]

mod client;

use clap::Parser;
use client::analysis::{self, WorkerReport};
use client::config::{AppConfig, CliArgs};
use client::telemetry::{TelemetryProviders, init_telemetry, observe_session};
use client::transport::GrpcTransport;
use core::time::Duration;
use read_until::Client;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = AppConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let transport = GrpcTransport::new(&config.connection)?;
    let client = Arc::new(Client::new(config.client.clone(), transport)?);

    let session = Arc::downgrade(&client);
    observe_session(move || {
        session
            .upgrade()
            .map(|client| client.metrics())
            .unwrap_or_default()
    });

    client.start()?;

    let token = CancellationToken::new();
    let workers = analysis::spawn_workers(&client, &config.analysis, &token);

    run_until_shutdown(&client, config.run_time).await;
    shutdown(client, workers, token, config.shutdown_timeout, providers).await
}

fn log_startup_info(_config: &AppConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Connecting to {} with full config: {:#?}",
            _config.connection.server_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Connecting to {} for channels {}-{} with {} analysis workers",
            _config.connection.server_addr,
            _config.client.setup.first_channel,
            _config.client.setup.last_channel,
            _config.analysis.workers
        );
    }
}

/// Resolves on Ctrl+C, SIGTERM, the end of the configured run time, or the
/// client closing on its own after a fatal error.
async fn run_until_shutdown(client: &Client<GrpcTransport>, run_time: Option<Duration>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    let elapsed = async {
        match run_time {
            Some(run_time) => tokio::time::sleep(run_time).await,
            None => std::future::pending::<()>().await,
        }
    };

    let mut state = client.subscribe_state();
    let closed = async {
        let _ = state.wait_for(|state| state.is_terminal()).await;
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
        () = elapsed => {
            #[cfg(feature = "tracing")]
            tracing::info!("Run time elapsed");
        },
        () = closed => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Stream closed");
        },
    }
}

async fn shutdown(
    client: Arc<Client<GrpcTransport>>,
    workers: Vec<tokio::task::JoinHandle<WorkerReport>>,
    token: CancellationToken,
    timeout: Duration,
    providers: TelemetryProviders,
) -> anyhow::Result<()> {
    #[cfg(feature = "tracing")]
    tracing::info!("Shutting down...");

    // 1. Stop the stream, flushing queued actions first
    let _outcome = client.stop(timeout).await;
    #[cfg(feature = "tracing")]
    tracing::info!("Client stopped: {_outcome:?}");

    // 2. Workers exit once the client is no longer running
    token.cancel();
    for worker in workers {
        match worker.await {
            Ok(_report) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Worker exited: {_report:?}");
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Worker did not exit cleanly: {_e}");
            }
        }
    }

    let _metrics = client.metrics();
    #[cfg(feature = "tracing")]
    tracing::info!("Final session metrics: {_metrics:#?}");

    let fatal = client.fatal_error();

    // 3. Flush telemetry
    providers.shutdown();

    match fatal {
        Some(err) => Err(anyhow::Error::new(err).context("read-until session failed")),
        None => Ok(()),
    }
}
