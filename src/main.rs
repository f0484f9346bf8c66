use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use veriq::api::run_api;
use veriq::config::{EngineCommand, QueueConfig};
use veriq::dispatch::ProcessEngine;
use veriq::queue::FileJobLog;
use veriq::report::SummaryPdfRenderer;
use veriq::schema::PermissiveSchemaRegistry;
use veriq::service::EngineQueue;
use veriq::store::JsonStateStore;

#[derive(Parser, Debug)]
#[command(name = "veriq")]
#[command(version)]
#[command(about = "Durable test-engine queue for AI model governance portals")]
struct Args {
    /// Port for the submission API
    #[arg(long, default_value = "8600")]
    port: u16,

    /// Number of dispatcher workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Directory for the state journal and queue log
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for generated report artifacts
    #[arg(long, default_value = "reports")]
    report_dir: PathBuf,

    /// External test-engine executable
    #[arg(long, default_value = "test-engine")]
    engine: String,

    /// Requeue budget for engine start rejections
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Seconds to wait for in-flight jobs on shutdown
    #[arg(long, default_value = "30")]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = QueueConfig::default()
        .with_workers(args.workers)
        .with_max_retries(args.max_retries)
        .with_shutdown_grace(Duration::from_secs(args.shutdown_grace_secs))
        .with_data_dir(args.data_dir.clone())
        .with_report_dir(args.report_dir.clone());

    let store = Arc::new(JsonStateStore::open(config.data_dir.join("jobs.jsonl")).await?);
    let log = Arc::new(
        FileJobLog::open_with_capacity(config.data_dir.join("queue.jsonl"), config.max_pending)
            .await?,
    );
    let engine = Arc::new(ProcessEngine::new(EngineCommand {
        program: args.engine,
        base_args: Vec::new(),
    }));

    tracing::info!(
        port = args.port,
        workers = config.workers,
        data_dir = %config.data_dir.display(),
        report_dir = %config.report_dir.display(),
        "Starting veriq"
    );

    let queue = EngineQueue::start(
        config,
        store,
        log,
        engine,
        Arc::new(PermissiveSchemaRegistry),
        Arc::new(SummaryPdfRenderer),
    )
    .await?;

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let api_queue = queue.clone();
    tokio::spawn(async move {
        run_api(addr, api_queue).await;
    });

    shutdown_signal().await?;
    queue.shutdown().await?;

    Ok(())
}

/// Resolves once SIGTERM or SIGINT arrives; the queue drains afterwards.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received, draining the engine queue"),
        _ = sigint.recv() => tracing::info!("SIGINT received, draining the engine queue"),
    }
    Ok(())
}
