//! `ADJUDICATE`: a third model pass that sees both candidate readings
//! and a page sample, and produces the authoritative metadata.

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::llm::json_extract::extract_json_object;
use crate::llm::provider::ModelRole;
use crate::llm::{ResponseFormat, VisionRequest};
use crate::pipeline::quality::normalize_confidence;
use crate::pipeline::validator::{self, ValidateOptions};
use crate::pipeline::verify::MAX_ADJUDICATE_PAGES;
use crate::types::{ExtractedMetadata, PassStatus};

use super::super::{JobPayload, PipelineError};
use super::{attach_document, load_document, progress, StageContext};

/// Wire shape of the adjudicator's verdict.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjudicationResponse {
    adjudicated_metadata: ExtractedMetadata,
    adjudication_notes: Option<String>,
    final_confidence: Option<f64>,
    #[serde(default)]
    requires_human_review: bool,
}

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError`] per the stage taxonomy; a failed pass marks
/// `adjudicator_status = FAILED` before propagating.
pub async fn run(ctx: &StageContext, item_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    if item.adjudicator_status == Some(PassStatus::Complete) {
        return Ok(vec![JobPayload::Finalize { item_id }]);
    }
    let first = item
        .extracted_metadata
        .clone()
        .ok_or_else(|| PipelineError::InvalidState("adjudicate without metadata".to_owned()))?;
    let second = item.second_pass_metadata.clone().ok_or_else(|| {
        PipelineError::InvalidState("adjudicate without a second pass".to_owned())
    })?;
    ctx.check_cancel(item.batch_id)?;
    ctx.store
        .set_adjudicator_status(item_id, PassStatus::InProgress)
        .await?;
    progress("adjudicate", item_id, 10);

    let (bytes, total_pages) = load_document(ctx, &item).await?;

    let mut request = VisionRequest::new(build_prompt(&first, &second));
    request.system = Some(ctx.system_prompt(ModelRole::Adjudicator));
    request.response_format = ResponseFormat::JsonObject;
    attach_document(
        ctx,
        &mut request,
        &bytes,
        total_pages,
        MAX_ADJUDICATE_PAGES,
        &item.file_name,
    )
    .await?;
    progress("adjudicate", item_id, 30);

    let result = ctx
        .call_model(ModelRole::Adjudicator, &mut request, item.batch_id)
        .await
        .and_then(|response| {
            let value = extract_json_object(&response.content)?;
            serde_json::from_value::<AdjudicationResponse>(value).map_err(|e| {
                PipelineError::Parse(crate::llm::json_extract::JsonExtractError::Invalid(
                    e.to_string(),
                ))
            })
        });

    let verdict = match result {
        Ok(verdict) => verdict,
        Err(err) => {
            if !matches!(err, PipelineError::Cancelled) {
                ctx.store
                    .set_adjudicator_status(item_id, PassStatus::Failed)
                    .await?;
            }
            return Err(err);
        }
    };
    progress("adjudicate", item_id, 70);

    let mut adjudicated = verdict.adjudicated_metadata;
    adjudicated.confidence_score = match verdict.final_confidence {
        Some(confidence) => normalize_confidence(confidence),
        None => normalize_confidence(adjudicated.confidence_score),
    };
    adjudicated.segmentation_confidence = adjudicated
        .segmentation_confidence
        .map(normalize_confidence);

    // The item's instruction column always holds the validated,
    // zero-indexed plan; the adjudicator returns one-indexed ranges.
    let validated = validator::validate_instructions(
        &adjudicated.cutting_instructions,
        total_pages,
        &ValidateOptions {
            one_indexed: true,
            detect_gaps: false,
            drop_forbidden: true,
            forbidden_labels: ctx.config.forbidden_labels.clone(),
        },
    );

    ctx.check_cancel(item.batch_id)?;
    // Finalize picks the review flag up and routes the item to a human
    // even when the numbers would otherwise clear the bar.
    ctx.store
        .commit_adjudication(
            item_id,
            &adjudicated,
            &validated.instructions,
            verdict.adjudication_notes.as_deref(),
            verdict.requires_human_review,
        )
        .await?;
    progress("adjudicate", item_id, 100);
    info!(
        item_id = %item_id,
        final_confidence = adjudicated.confidence_score,
        requires_review = verdict.requires_human_review,
        "adjudication complete"
    );

    Ok(vec![JobPayload::Finalize { item_id }])
}

fn build_prompt(first: &ExtractedMetadata, second: &ExtractedMetadata) -> String {
    format!(
        "Candidate reading A (first pass):\n{}\n\nCandidate reading B (verification pass):\n{}\n\n\
         Inspect the sampled pages and adjudicate.",
        serde_json::to_string_pretty(first).unwrap_or_default(),
        serde_json::to_string_pretty(second).unwrap_or_default(),
    )
}
