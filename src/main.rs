//! partsmith — Smart Upload pipeline for music-score documents.
//!
//! `partsmith start` runs the worker process: pipeline queues, the
//! scheduler tick, and the health endpoints. `partsmith enqueue` uploads
//! local PDFs as a new batch (a running worker picks them up on its next
//! tick); `partsmith status` prints a batch summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use partsmith::document::lopdf_engine::LopdfEngine;
use partsmith::llm::dispatcher::Dispatcher;
use partsmith::llm::rate_limit::RateLimiter;
use partsmith::ops::{self, OperatorConfig};
use partsmith::pipeline::engine::PipelineEngine;
use partsmith::pipeline::queue::{QueueConfig, QueueSet};
use partsmith::storage::batches::{BatchStore, NewUpload};
use partsmith::storage::fs::FsBlobStore;
use partsmith::storage::settings::SettingsStore;
use partsmith::storage::{db, BlobStore};

#[derive(Debug, Parser)]
#[command(name = "partsmith", version, about = "Smart Upload pipeline for music scores")]
struct Cli {
    /// Data directory (database, blobs, logs). Defaults to the platform
    /// data dir.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker process.
    Start {
        /// Port for /health and /ready.
        #[arg(long, default_value_t = 8091)]
        health_port: u16,
    },
    /// Upload local PDFs as a new batch.
    Enqueue {
        /// PDF files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// User the batch is attributed to.
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Print a batch summary.
    Status {
        /// Batch UUID.
        batch_id: Uuid,
    },
}

fn resolve_data_dir(arg: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = arg {
        return Ok(dir);
    }
    directories::ProjectDirs::from("app", "eccb", "partsmith")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .context("cannot resolve a data directory; pass --data-dir")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir)?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    match cli.command {
        Command::Start { health_port } => start(data_dir, health_port).await,
        Command::Enqueue { files, user } => enqueue(data_dir, files, &user).await,
        Command::Status { batch_id } => status(data_dir, batch_id).await,
    }
}

async fn start(data_dir: PathBuf, health_port: u16) -> Result<()> {
    let _logging = partsmith::logging::init_worker(&data_dir.join("logs"))?;
    info!(data_dir = %data_dir.display(), "partsmith starting");

    let pool = db::connect(&data_dir.join("partsmith.db").to_string_lossy()).await?;
    let store = BatchStore::new(pool.clone());
    let settings = SettingsStore::new(pool);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(data_dir.join("blobs")));

    // Initial RPM from settings; the dispatcher re-applies the
    // configured limit before every acquisition.
    let initial_config = {
        let snapshot = settings.load_all().await?;
        partsmith::config::RuntimeConfig::from_settings(&snapshot)
    };
    let limiter = Arc::new(RateLimiter::new(initial_config.rate_limit_rpm));
    let dispatcher = Arc::new(Dispatcher::new(reqwest::Client::new(), limiter));

    let engine = PipelineEngine::new(
        store,
        blobs,
        Arc::new(LopdfEngine::new()),
        dispatcher,
        settings,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let queues = Arc::new(QueueSet::start(
        engine.clone(),
        QueueConfig::default(),
        shutdown_rx.clone(),
    ));

    let operator_config = OperatorConfig {
        health_port,
        ..OperatorConfig::default()
    };
    let health_handle =
        ops::serve_health(health_port, Arc::clone(&queues), shutdown_rx.clone()).await?;
    let scheduler_handle = tokio::spawn(ops::run_scheduler(
        Arc::clone(&engine),
        Arc::clone(&queues),
        operator_config,
        shutdown_rx,
    ));

    info!("partsmith ready");
    ops::shutdown_signal().await;
    info!("shutdown signal received");

    // Ordered shutdown: scheduler and listener first, then drain the
    // workers, then close the queues.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    let _ = health_handle.await;
    queues.close().await;

    info!("partsmith stopped");
    Ok(())
}

async fn enqueue(data_dir: PathBuf, files: Vec<PathBuf>, user: &str) -> Result<()> {
    let _logging = partsmith::logging::init_cli();
    let pool = db::connect(&data_dir.join("partsmith.db").to_string_lossy()).await?;
    let store = BatchStore::new(pool);
    let blobs = FsBlobStore::new(data_dir.join("blobs"));

    let session = Uuid::new_v4();
    let mut uploads = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("file has no name")?;
        let storage_key = format!("smart-upload/{session}/{file_name}");
        blobs
            .upload(&storage_key, &bytes, "application/pdf")
            .await
            .with_context(|| format!("failed to store {}", path.display()))?;
        uploads.push(NewUpload {
            file_name,
            mime_type: "application/pdf".to_owned(),
            storage_key,
        });
    }

    let (batch, items) = store.create_batch(user, &uploads).await?;
    println!("batch {} created with {} item(s)", batch.id, items.len());
    println!("a running `partsmith start` worker will pick it up on its next tick");
    Ok(())
}

async fn status(data_dir: PathBuf, batch_id: Uuid) -> Result<()> {
    let _logging = partsmith::logging::init_cli();
    let pool = db::connect(&data_dir.join("partsmith.db").to_string_lossy()).await?;
    let store = BatchStore::new(pool);

    let batch = store.get_batch(batch_id).await?;
    println!(
        "batch {} [{}] {}/{} processed, {} ok, {} failed",
        batch.id,
        batch.status,
        batch.processed_files,
        batch.total_files,
        batch.success_files,
        batch.failed_files
    );
    if let Some(summary) = &batch.error_summary {
        println!("errors: {summary}");
    }
    for item in store.items_for_batch(batch_id).await? {
        let step = item
            .current_step
            .map_or_else(|| "-".to_owned(), |s| s.to_string());
        let confidence = item
            .final_confidence
            .map_or_else(|| "-".to_owned(), |c| format!("{c:.0}"));
        println!(
            "  {} {} [{} / {}] confidence={} review={}",
            item.id, item.file_name, item.status, step, confidence, item.requires_human_review
        );
    }
    Ok(())
}
