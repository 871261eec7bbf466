//! `SECOND_PASS_VERIFY`: re-read the original document (plus a sample of
//! the split parts as labelled references) with the verification model,
//! then decide whether the two readings disagree enough to adjudicate.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::document::DocumentError;
use crate::llm::json_extract::extract_json_object;
use crate::llm::provider::ModelRole;
use crate::llm::{ImageInput, LabeledInput, ResponseFormat, VisionRequest};
use crate::pipeline::quality::normalize_confidence;
use crate::pipeline::verify::{
    all_labels_unusable, detect_disagreements, needs_adjudication, sample_parts,
    MAX_VERIFY_PAGES, MAX_VERIFY_PARTS,
};
use crate::types::{ExtractedMetadata, ParsedPart, PassStatus};

use super::super::{JobPayload, PipelineError};
use super::{attach_document, load_document, progress, run_blocking, StageContext};

/// Wire shape of the verification response: the metadata echo plus the
/// model's confidence in its own reading.
#[derive(Debug, Deserialize)]
struct VerificationResponse {
    #[serde(flatten)]
    metadata: ExtractedMetadata,
    #[serde(rename = "verificationConfidence")]
    verification_confidence: Option<f64>,
}

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError`] per the stage taxonomy; a failed pass marks
/// `second_pass_status = FAILED` before propagating.
pub async fn run(ctx: &StageContext, item_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    // A completed pass only re-emits its successor; anything else
    // (queued, in-progress from a dead worker, failed, or a marker lost
    // to a crash) runs the pass.
    if item.second_pass_status == Some(PassStatus::Complete) {
        return Ok(next_jobs(&item.adjudicator_status, item_id));
    }
    let first = item
        .extracted_metadata
        .clone()
        .ok_or_else(|| PipelineError::InvalidState("second pass without metadata".to_owned()))?;
    ctx.check_cancel(item.batch_id)?;
    ctx.store
        .set_second_pass_status(item_id, PassStatus::InProgress)
        .await?;
    progress("second_pass", item_id, 10);

    let (bytes, total_pages) = load_document(ctx, &item).await?;

    let mut request = VisionRequest::new(build_prompt(&first));
    request.system = Some(ctx.system_prompt(ModelRole::Verification));
    request.response_format = ResponseFormat::JsonObject;
    attach_document(
        ctx,
        &mut request,
        &bytes,
        total_pages,
        MAX_VERIFY_PAGES,
        &item.file_name,
    )
    .await?;

    // Up to three already-split parts ride along as labelled references
    // so the model can cross-check the cut boundaries.
    if let Some(parts) = item.parsed_parts.as_deref() {
        request.labeled_inputs = labeled_part_inputs(ctx, parts).await?;
    }
    progress("second_pass", item_id, 30);

    let result = ctx
        .call_model(ModelRole::Verification, &mut request, item.batch_id)
        .await
        .and_then(|response| {
            let value = extract_json_object(&response.content)?;
            serde_json::from_value::<VerificationResponse>(value).map_err(|e| {
                PipelineError::Parse(crate::llm::json_extract::JsonExtractError::Invalid(
                    e.to_string(),
                ))
            })
        });

    let parsed = match result {
        Ok(parsed) => parsed,
        Err(err) => {
            // Record the failed pass so the reaper does not requeue it
            // forever, then let the queue's retry policy take over.
            if !matches!(err, PipelineError::Cancelled) {
                ctx.store
                    .set_second_pass_status(item_id, PassStatus::Failed)
                    .await?;
            }
            return Err(err);
        }
    };
    progress("second_pass", item_id, 70);

    let mut second = parsed.metadata;
    second.confidence_score = normalize_confidence(second.confidence_score);
    second.segmentation_confidence = second.segmentation_confidence.map(normalize_confidence);
    let verification_confidence = parsed.verification_confidence.map(normalize_confidence);

    ctx.check_cancel(item.batch_id)?;
    ctx.store
        .commit_second_pass(item_id, &second, PassStatus::Complete)
        .await?;

    let disagreements = detect_disagreements(&first, &second);
    let labels_unusable = all_labels_unusable(&second, &ctx.config.forbidden_labels);
    let adjudicate = needs_adjudication(&disagreements, verification_confidence, labels_unusable);
    progress("second_pass", item_id, 100);
    info!(
        item_id = %item_id,
        disagreements = disagreements.len(),
        verification_confidence,
        adjudicate,
        "second pass complete"
    );

    if adjudicate {
        ctx.store
            .set_adjudicator_status(item_id, PassStatus::Queued)
            .await?;
        Ok(vec![JobPayload::Adjudicate { item_id }])
    } else {
        Ok(vec![JobPayload::Finalize { item_id }])
    }
}

fn next_jobs(adjudicator_status: &Option<PassStatus>, item_id: Uuid) -> Vec<JobPayload> {
    match adjudicator_status {
        Some(PassStatus::Queued | PassStatus::InProgress) => {
            vec![JobPayload::Adjudicate { item_id }]
        }
        _ => vec![JobPayload::Finalize { item_id }],
    }
}

fn build_prompt(first: &ExtractedMetadata) -> String {
    format!(
        "Verify this earlier reading of the attached document:\n{}\n\n\
         Examine the document yourself and return your own reading.",
        serde_json::to_string_pretty(first).unwrap_or_default()
    )
}

/// Render the first page of up to three sampled parts as labelled
/// reference images. Engines without a rasterizer skip the references
/// rather than failing the pass.
async fn labeled_part_inputs(
    ctx: &StageContext,
    parts: &[ParsedPart],
) -> Result<Vec<LabeledInput>, PipelineError> {
    let mut labeled = Vec::new();
    for part in sample_parts(parts, MAX_VERIFY_PARTS) {
        let part_bytes = match ctx.blobs.download(&part.storage_key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %part.storage_key, error = %err, "part blob unavailable for verification");
                continue;
            }
        };
        let documents = Arc::clone(&ctx.documents);
        let rendered = run_blocking(move || documents.render_pages(&part_bytes, &[0])).await;
        match rendered {
            Ok(pages) => {
                if let Some(page) = pages.into_iter().next() {
                    labeled.push(LabeledInput {
                        label: format!("Split part: {}", part.part_name),
                        image: ImageInput {
                            mime_type: page.mime_type,
                            data_base64: BASE64.encode(page.data),
                        },
                    });
                }
            }
            Err(PipelineError::Document(DocumentError::Unsupported(_))) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(labeled)
}
