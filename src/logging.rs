//! Tracing initialisation for the two ways partsmith runs.
//!
//! The long-lived worker (`partsmith start`) writes flattened JSONL to
//! `{logs_dir}/worker.log.YYYY-MM-DD` (daily rotation) so operator
//! tooling can filter on the structured fields the pipeline attaches
//! (`queue`, `job`, `attempt`, `item_id`, `batch_id`, `stage`), next to
//! a compact console stream. One-shot subcommands (`enqueue`, `status`)
//! log to stderr only.
//!
//! The default filter quiets sqlx, hyper, and reqwest so stage-level
//! events (job dispatch, LLM attempts, cleanup) stay readable at `info`.
//! Override with `RUST_LOG` as usual.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive for the process lifetime.
/// Dropping it flushes pending entries and closes the worker log; the
/// CLI variant carries no file writer.
#[must_use]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

fn base_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn,reqwest=warn"))
}

/// Initialise logging for the worker process.
///
/// Two layers share one filter: a JSONL file layer with events flattened
/// to top-level keys (`jq`-friendly, no span nesting, no ANSI) and a
/// compact stderr layer without targets for humans watching the worker.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_worker(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!("cannot create logs directory {}: {e}", logs_dir.display())
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "worker.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_ansi(false)
        .with_writer(file_writer);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(base_filter())
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _file: Some(guard) })
}

/// Initialise stderr-only logging for one-shot subcommands. No file
/// layer, no rotation.
pub fn init_cli() -> LoggingGuard {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(base_filter())
        .with_writer(io::stderr)
        .init();
    LoggingGuard { _file: None }
}
