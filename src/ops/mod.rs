//! Operator runtime: health endpoints, the scheduler tick, and ordered
//! shutdown.
//!
//! Runs as background Tokio tasks next to the worker queues. The
//! scheduler ticks at a configurable interval; each tick enqueues
//! never-started items, requeues dead second-pass jobs, and evaluates
//! the cron-scheduled maintenance sweep. Shutdown order on
//! SIGTERM/SIGINT: stop scheduler ticks, stop the HTTP listener, drain
//! workers (in-flight jobs finish), close queues.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pipeline::engine::PipelineEngine;
use crate::pipeline::queue::QueueSet;
use crate::pipeline::JobPayload;
use crate::types::PassStatus;

/// Operator runtime tuning.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Port for `/health` and `/ready`.
    pub health_port: u16,
    /// Scheduler tick interval.
    pub tick_interval: Duration,
    /// How long a second pass may sit `QUEUED`/`IN_PROGRESS` before the
    /// reaper requeues it.
    pub reap_after: Duration,
    /// Cron expression (with seconds field) for the maintenance sweep.
    pub sweep_cron: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            health_port: 8091,
            tick_interval: Duration::from_secs(60),
            reap_after: Duration::from_secs(600),
            sweep_cron: "0 0 3 * * *".to_owned(),
        }
    }
}

// ── Health endpoints ────────────────────────────────────────────

struct OpsState {
    queues: Arc<QueueSet>,
    started: Instant,
}

/// Serve `/health` and `/ready` until the shutdown signal fires.
///
/// # Errors
///
/// Returns an error when the listener cannot bind.
pub async fn serve_health(
    port: u16,
    queues: Arc<QueueSet>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let state = Arc::new(OpsState {
        queues,
        started: Instant::now(),
    });
    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoints listening");

    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "health server error");
        }
        info!("health server stopped");
    });
    Ok(handle)
}

async fn health(State(state): State<Arc<OpsState>>) -> (StatusCode, Json<Value>) {
    let workers: serde_json::Map<String, Value> = state
        .queues
        .worker_status()
        .into_iter()
        .map(|(name, running)| {
            (
                name.to_owned(),
                json!({"status": if running { "running" } else { "stopped" }}),
            )
        })
        .collect();
    let queues: serde_json::Map<String, Value> = state
        .queues
        .stats()
        .into_iter()
        .map(|(name, stats)| {
            (
                name.as_str().to_owned(),
                serde_json::to_value(stats).unwrap_or(Value::Null),
            )
        })
        .collect();

    let healthy = state.queues.all_workers_running();
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.started.elapsed().as_secs(),
        "workers": workers,
        "queues": queues,
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn ready(State(state): State<Arc<OpsState>>) -> (StatusCode, Json<Value>) {
    let ready = state.queues.all_workers_running();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "ready": ready })))
}

// ── Scheduler ───────────────────────────────────────────────────

/// Run the periodic scheduler until shutdown.
///
/// Each tick: enqueue items that were uploaded but never started,
/// requeue second passes that died mid-flight, and fire the maintenance
/// sweep when its cron schedule comes due.
pub async fn run_scheduler(
    engine: Arc<PipelineEngine>,
    queues: Arc<QueueSet>,
    config: OperatorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = config.tick_interval.as_secs(),
        "scheduler started"
    );
    let mut interval = tokio::time::interval(config.tick_interval);
    let mut last_sweep: Option<DateTime<Utc>> = None;
    // Skip the immediate first tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_tick(&engine, &queues, &config, &mut last_sweep).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("scheduler stopped");
}

async fn run_tick(
    engine: &PipelineEngine,
    queues: &QueueSet,
    config: &OperatorConfig,
    last_sweep: &mut Option<DateTime<Utc>>,
) {
    // Never-started items (uploaded by the CLI or a crashed process).
    match engine.store().unstarted_items().await {
        Ok(items) => {
            for item in items {
                info!(item_id = %item.id, "enqueueing unstarted item");
                queues.enqueue(JobPayload::ExtractText { item_id: item.id });
            }
        }
        Err(e) => warn!(error = %e, "failed to scan unstarted items"),
    }

    // Dead second-pass jobs.
    let reap_window =
        chrono::Duration::from_std(config.reap_after).unwrap_or_else(|_| chrono::Duration::zero());
    let reap_cutoff = Utc::now()
        .checked_sub_signed(reap_window)
        .unwrap_or_else(Utc::now);
    match engine.store().stale_second_pass_items(reap_cutoff).await {
        Ok(items) => {
            for item in items {
                warn!(item_id = %item.id, "requeueing dead second-pass job");
                if engine
                    .store()
                    .set_second_pass_status(item.id, PassStatus::Queued)
                    .await
                    .is_ok()
                {
                    queues.enqueue(JobPayload::SecondPass { item_id: item.id });
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to scan stale second passes"),
    }

    // Cron-scheduled maintenance sweep.
    if sweep_due(&config.sweep_cron, last_sweep, Utc::now()) {
        *last_sweep = Some(Utc::now());
        run_sweep(queues);
    }
}

/// Whether the sweep's cron schedule has a trigger between the last run
/// and now.
fn sweep_due(cron_expr: &str, last_run: &Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let schedule = match cron::Schedule::from_str(cron_expr) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(cron = cron_expr, error = %e, "invalid sweep cron expression");
            return false;
        }
    };
    let after = last_run.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    schedule.after(&after).take(1).any(|next| next <= now)
}

/// The sweep itself: surface queue pressure and recent failures in the
/// logs for the operator.
fn run_sweep(queues: &QueueSet) {
    for (name, stats) in queues.stats() {
        info!(
            queue = name.as_str(),
            queued = stats.queued,
            active = stats.active,
            completed = stats.completed,
            failed = stats.failed,
            retried = stats.retried,
            "maintenance sweep: queue stats"
        );
    }
    for record in queues.recent_failures() {
        warn!(
            job = record.job,
            attempts = record.attempts,
            error = record.error.as_deref().unwrap_or("unknown"),
            "maintenance sweep: recent failure"
        );
    }
}

/// Resolve on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
