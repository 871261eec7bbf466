//! Stage handlers: one module per pipeline stage, all driven through a
//! shared [`StageContext`].
//!
//! Handlers are idempotent functions of `(item, stage input)`: each one
//! reads the item first, no-ops (or re-emits its follow-up) when the
//! persistent state already reflects its transition, and issues all of
//! its writes through a single transactional store call.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::config::RuntimeConfig;
use crate::document::DocumentEngine;
use crate::llm::dispatcher::Dispatcher;
use crate::llm::provider::ModelRole;
use crate::llm::{DocumentInput, ImageInput, LlmResponse, VisionRequest};
use crate::storage::batches::BatchStore;
use crate::storage::BlobStore;
use crate::types::UploadItem;

use super::engine::CancelRegistry;
use super::{verify, PipelineError};

pub mod adjudicate;
pub mod classify;
pub mod cleanup;
pub mod extract_text;
pub mod finalize;
pub mod ingest;
pub mod metadata;
pub mod second_pass;
pub mod split;

// ── Default prompts (overridable via settings) ──────────────────

/// System prompt for the first-pass vision extraction.
pub const DEFAULT_VISION_PROMPT: &str = "\
You are a music librarian cataloguing scanned sheet music. Examine the \
document and return a single JSON object with these fields: title, \
composer, arranger (or null), fileType (one of FULL_SCORE, \
CONDUCTOR_SCORE, CONDENSED_SCORE, PART, OTHER), isMultiPart (true when \
the document concatenates several instrument parts), confidenceScore \
(0-100), segmentationConfidence (0-100, how sure you are about the page \
boundaries), and cuttingInstructions: an array of objects with partName, \
instrument, section, transposition, partNumber (or null), and pageRange \
as a two-element one-indexed array [firstPage, lastPage]. Every page that \
belongs to a part must be covered by exactly one instruction.";

/// System prompt for the second verification pass.
pub const DEFAULT_VERIFICATION_PROMPT: &str = "\
You are independently verifying another cataloguer's reading of a scanned \
score. Examine the document (and any labelled reference parts) yourself, \
then return the same JSON object shape: title, composer, fileType, \
isMultiPart, confidenceScore, segmentationConfidence, and \
cuttingInstructions with one-indexed pageRange values. Add a \
verificationConfidence field (0-100) for how confident you are in your \
own reading. Do not copy the earlier reading; report what you see.";

/// System prompt for the adjudication pass.
pub const DEFAULT_ADJUDICATOR_PROMPT: &str = "\
Two independent readings of the same scanned score disagree. You are the \
adjudicator. Compare both candidate readings against the sampled pages \
and return a JSON object with: adjudicatedMetadata (the corrected \
reading, same shape as the candidates, one-indexed pageRange values), \
adjudicationNotes (a short explanation of what you kept and why), \
finalConfidence (0-100), and requiresHumanReview (true when neither \
reading can be trusted).";

// ── Context ─────────────────────────────────────────────────────

/// Everything a stage handler needs, assembled per job by the engine.
pub struct StageContext {
    /// Batch/item persistence.
    pub store: BatchStore,
    /// Blob store for originals and parts.
    pub blobs: Arc<dyn BlobStore>,
    /// Black-box document engine.
    pub documents: Arc<dyn DocumentEngine>,
    /// Shared LLM dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// Config snapshot taken when the job started.
    pub config: RuntimeConfig,
    /// Per-batch cancellation registry.
    pub cancels: Arc<CancelRegistry>,
}

impl StageContext {
    /// Cancellation token for the item's batch.
    pub fn cancellation(&self, batch_id: Uuid) -> Cancellation {
        self.cancels.token(batch_id)
    }

    /// Bail out with [`PipelineError::Cancelled`] when the batch has been
    /// cancelled. Called at every suspension point.
    pub fn check_cancel(&self, batch_id: Uuid) -> Result<(), PipelineError> {
        if self.cancellation(batch_id).is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Dispatch a vision request for the given model role.
    pub async fn call_model(
        &self,
        role: ModelRole,
        request: &mut VisionRequest,
        batch_id: Uuid,
    ) -> Result<LlmResponse, PipelineError> {
        self.check_cancel(batch_id)?;
        request.model_params = self.config.model_params(role);
        let adapter = self.config.adapter_config(role);
        let options = self.config.dispatch_options();
        let cancel = self.cancellation(batch_id);
        let response = self
            .dispatcher
            .call_vision_model(&adapter, request, &options, &cancel)
            .await?;
        Ok(response)
    }

    /// The configured system prompt for a role.
    pub fn system_prompt(&self, role: ModelRole) -> String {
        match role {
            ModelRole::Vision => self
                .config
                .vision_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_VISION_PROMPT.to_owned()),
            ModelRole::Verification => self
                .config
                .verification_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_VERIFICATION_PROMPT.to_owned()),
            ModelRole::Adjudicator => self
                .config
                .adjudicator_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_ADJUDICATOR_PROMPT.to_owned()),
        }
    }
}

// ── Shared helpers ──────────────────────────────────────────────

/// Run a CPU-bound document operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, crate::document::DocumentError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Extraction(format!("blocking task failed: {e}")))?
        .map_err(PipelineError::from)
}

/// Download the original document and count its pages.
pub(crate) async fn load_document(
    ctx: &StageContext,
    item: &UploadItem,
) -> Result<(Vec<u8>, i64), PipelineError> {
    let bytes = ctx
        .blobs
        .download(&item.storage_key)
        .await
        .map_err(|e| match e {
            crate::storage::StorageError::NotFound(key) => {
                PipelineError::Extraction(format!("original blob missing: {key}"))
            }
            other => PipelineError::from(other),
        })?;
    let documents = Arc::clone(&ctx.documents);
    let for_count = bytes.clone();
    let total_pages = run_blocking(move || documents.page_count(&for_count)).await?;
    Ok((bytes, total_pages))
}

/// Attach the document to a vision request: as a native PDF when the
/// provider accepts one, otherwise as up to `max_pages` evenly sampled
/// rendered pages.
pub(crate) async fn attach_document(
    ctx: &StageContext,
    request: &mut VisionRequest,
    bytes: &[u8],
    total_pages: i64,
    max_pages: usize,
    file_name: &str,
) -> Result<(), PipelineError> {
    if ctx.config.provider.supports_pdf_input() {
        request.documents.push(DocumentInput {
            file_name: file_name.to_owned(),
            data_base64: BASE64.encode(bytes),
        });
        return Ok(());
    }

    let pages = verify::sample_pages_evenly(total_pages, max_pages);
    let documents = Arc::clone(&ctx.documents);
    let owned = bytes.to_vec();
    let rendered = run_blocking(move || documents.render_pages(&owned, &pages)).await?;
    for page in rendered {
        request.images.push(ImageInput {
            mime_type: page.mime_type,
            data_base64: BASE64.encode(page.data),
        });
    }
    Ok(())
}

/// Advisory progress marker. Never a correctness signal.
pub(crate) fn progress(stage: &str, item_id: Uuid, pct: u8) {
    debug!(stage, item_id = %item_id, pct, "progress");
}
