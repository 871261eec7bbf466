//! The pipeline engine: job dispatch, failure recording, and batch
//! lifecycle entry points.
//!
//! The engine is the [`JobHandler`] behind both queues. Each job gets a
//! fresh config snapshot (so settings changes apply between jobs, not
//! mid-stage), dispatches to its stage handler, and reports follow-up
//! jobs back to the queue. Stage errors are recorded on the item row
//! before they propagate; exhausted jobs branch to cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, Cancellation};
use crate::config::RuntimeConfig;
use crate::document::DocumentEngine;
use crate::llm::dispatcher::Dispatcher;
use crate::storage::batches::BatchStore;
use crate::storage::settings::SettingsStore;
use crate::storage::BlobStore;
use crate::types::ItemStatus;

use super::queue::JobHandler;
use super::stages::{self, StageContext};
use super::{CleanupReason, JobPayload, PipelineError};

// ── Cancellation registry ───────────────────────────────────────

/// Per-batch cancellation tokens shared by every in-flight handler.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<Uuid, (CancelHandle, Cancellation)>>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cancellation token for a batch, created on first use.
    pub fn token(&self, batch_id: Uuid) -> Cancellation {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (_, token) = inner.entry(batch_id).or_insert_with(CancelHandle::new);
        token.clone()
    }

    /// Fire cancellation for a batch.
    pub fn cancel(&self, batch_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (handle, _) = inner.entry(batch_id).or_insert_with(CancelHandle::new);
        handle.cancel();
    }

    /// Drop a batch's entry once it is fully terminal.
    pub fn forget(&self, batch_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.remove(&batch_id);
    }
}

// ── Engine ──────────────────────────────────────────────────────

/// Stage-keyed job dispatcher over the persistent item state.
pub struct PipelineEngine {
    store: BatchStore,
    blobs: Arc<dyn BlobStore>,
    documents: Arc<dyn DocumentEngine>,
    dispatcher: Arc<Dispatcher>,
    settings: SettingsStore,
    cancels: Arc<CancelRegistry>,
}

impl PipelineEngine {
    /// Wire up the engine.
    pub fn new(
        store: BatchStore,
        blobs: Arc<dyn BlobStore>,
        documents: Arc<dyn DocumentEngine>,
        dispatcher: Arc<Dispatcher>,
        settings: SettingsStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            blobs,
            documents,
            dispatcher,
            settings,
            cancels: Arc::new(CancelRegistry::new()),
        })
    }

    /// The batch/item store.
    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    /// The cancellation registry (shared with the operator runtime).
    pub fn cancels(&self) -> Arc<CancelRegistry> {
        Arc::clone(&self.cancels)
    }

    /// Snapshot the settings table into a typed config.
    pub async fn load_config(&self) -> Result<RuntimeConfig, PipelineError> {
        let snapshot = self.settings.load_all().await?;
        Ok(RuntimeConfig::from_settings(&snapshot))
    }

    /// Kick off a created batch: one `EXTRACT_TEXT` job per item.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] on database failure.
    pub async fn start_batch(&self, batch_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
        let items = self.store.items_for_batch(batch_id).await?;
        let jobs: Vec<JobPayload> = items
            .iter()
            .filter(|item| item.status == ItemStatus::Created)
            .map(|item| JobPayload::ExtractText { item_id: item.id })
            .collect();
        info!(batch_id = %batch_id, jobs = jobs.len(), "batch started");
        Ok(jobs)
    }

    /// Cancel a batch: fire the cancellation token (in-flight handlers
    /// observe it at their next suspension point), mark the batch, and
    /// return a cleanup job per non-terminal item.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] on database failure.
    pub async fn request_cancel(&self, batch_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
        self.cancels.cancel(batch_id);
        self.store.mark_batch_cancelled(batch_id).await?;

        let items = self.store.items_for_batch(batch_id).await?;
        let jobs: Vec<JobPayload> = items
            .iter()
            .filter(|item| {
                !matches!(
                    item.status,
                    ItemStatus::Complete | ItemStatus::Failed | ItemStatus::Cancelled
                )
            })
            .map(|item| JobPayload::Cleanup {
                item_id: item.id,
                reason: CleanupReason::Cancelled,
            })
            .collect();
        info!(batch_id = %batch_id, cleanups = jobs.len(), "batch cancel requested");
        Ok(jobs)
    }

    /// Build the per-job stage context with a fresh config snapshot.
    async fn context(&self) -> Result<StageContext, PipelineError> {
        Ok(StageContext {
            store: self.store.clone(),
            blobs: Arc::clone(&self.blobs),
            documents: Arc::clone(&self.documents),
            dispatcher: Arc::clone(&self.dispatcher),
            config: self.load_config().await?,
            cancels: Arc::clone(&self.cancels),
        })
    }

    /// Record a stage error on the item row so operators can see what
    /// the queue is retrying. Best effort.
    async fn record_attempt_error(&self, item_id: Uuid, err: &PipelineError) {
        let details = serde_json::json!({ "kind": err.kind() });
        if let Err(store_err) = self
            .store
            .set_item_error(item_id, &err.to_string(), Some(&details))
            .await
        {
            warn!(item_id = %item_id, error = %store_err, "failed to record stage error");
        }
    }
}

#[async_trait]
impl JobHandler for PipelineEngine {
    async fn handle(&self, job: &JobPayload) -> Result<Vec<JobPayload>, PipelineError> {
        let ctx = self.context().await?;
        let result = match job {
            JobPayload::ExtractText { item_id } => stages::extract_text::run(&ctx, *item_id).await,
            JobPayload::LlmExtractMetadata { item_id } => {
                stages::metadata::run(&ctx, *item_id).await
            }
            JobPayload::ClassifyAndPlanSplit { item_id } => {
                stages::classify::run(&ctx, *item_id).await
            }
            JobPayload::SplitPdf { item_id } => stages::split::run(&ctx, *item_id).await,
            JobPayload::SecondPass { item_id } => stages::second_pass::run(&ctx, *item_id).await,
            JobPayload::Adjudicate { item_id } => stages::adjudicate::run(&ctx, *item_id).await,
            JobPayload::Finalize { item_id } => stages::finalize::run(&ctx, *item_id).await,
            JobPayload::Ingest { batch_id } => stages::ingest::run(&ctx, *batch_id).await,
            JobPayload::Cleanup { item_id, reason } => {
                stages::cleanup::run(&ctx, *item_id, *reason).await
            }
        };

        if let Err(err) = &result {
            if !matches!(err, PipelineError::Cancelled) {
                if let Some(item_id) = job.item_id() {
                    self.record_attempt_error(item_id, err).await;
                }
            }
        }
        result
    }

    async fn on_exhausted(&self, job: &JobPayload, err: &PipelineError) -> Vec<JobPayload> {
        // A dead cleanup job must not spawn another cleanup job.
        if matches!(job, JobPayload::Cleanup { .. }) {
            error!(job = job.job_name(), error = %err, "cleanup job exhausted");
            return Vec::new();
        }

        let Some(item_id) = job.item_id() else {
            // Ingest failure leaves items reviewable; nothing to clean.
            error!(job = job.job_name(), error = %err, "batch job exhausted");
            return Vec::new();
        };

        if matches!(err, PipelineError::Cancelled) {
            return vec![JobPayload::Cleanup {
                item_id,
                reason: CleanupReason::Cancelled,
            }];
        }

        let details = serde_json::json!({ "kind": err.kind() });
        if let Err(store_err) = self
            .store
            .mark_item_failed(item_id, &err.to_string(), Some(&details))
            .await
        {
            error!(item_id = %item_id, error = %store_err, "failed to mark item failed");
        }
        vec![JobPayload::Cleanup {
            item_id,
            reason: CleanupReason::Failed,
        }]
    }
}
