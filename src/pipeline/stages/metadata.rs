//! `LLM_EXTRACT_METADATA`: first vision pass over the document,
//! producing structured metadata and a draft cutting plan.

use tracing::info;
use uuid::Uuid;

use crate::llm::json_extract::extract_json_object;
use crate::llm::provider::ModelRole;
use crate::llm::{ResponseFormat, VisionRequest};
use crate::pipeline::quality::normalize_confidence;
use crate::types::{ExtractedMetadata, ItemStep};

use super::super::{JobPayload, PipelineError};
use super::{attach_document, load_document, progress, StageContext};

/// Most characters of extracted text included in the prompt.
const MAX_PROMPT_TEXT_CHARS: usize = 4000;

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError::Llm`] for terminal call failures and
/// [`PipelineError::Parse`] when the output is not a JSON object.
pub async fn run(ctx: &StageContext, item_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    match item.current_step {
        Some(ItemStep::TextExtracted) => {}
        Some(ItemStep::MetadataExtracted) => {
            return Ok(vec![JobPayload::ClassifyAndPlanSplit { item_id }]);
        }
        _ => return Ok(Vec::new()),
    }
    ctx.check_cancel(item.batch_id)?;
    progress("llm_extract_metadata", item_id, 10);

    let (bytes, total_pages) = load_document(ctx, &item).await?;

    let mut request = VisionRequest::new(build_prompt(&item.file_name, total_pages, item.ocr_text.as_deref()));
    request.system = Some(ctx.system_prompt(ModelRole::Vision));
    request.response_format = ResponseFormat::JsonObject;
    attach_document(
        ctx,
        &mut request,
        &bytes,
        total_pages,
        crate::pipeline::verify::MAX_VERIFY_PAGES,
        &item.file_name,
    )
    .await?;
    progress("llm_extract_metadata", item_id, 30);

    let response = ctx
        .call_model(ModelRole::Vision, &mut request, item.batch_id)
        .await?;
    progress("llm_extract_metadata", item_id, 70);

    let value = extract_json_object(&response.content)?;
    let mut metadata: ExtractedMetadata = serde_json::from_value(value).map_err(|e| {
        PipelineError::Parse(crate::llm::json_extract::JsonExtractError::Invalid(
            e.to_string(),
        ))
    })?;
    metadata.confidence_score = normalize_confidence(metadata.confidence_score);
    metadata.segmentation_confidence = metadata
        .segmentation_confidence
        .map(normalize_confidence);

    ctx.check_cancel(item.batch_id)?;
    ctx.store.commit_metadata_extracted(item_id, &metadata).await?;
    progress("llm_extract_metadata", item_id, 100);
    info!(
        item_id = %item_id,
        title = %metadata.title,
        confidence = metadata.confidence_score,
        instructions = metadata.cutting_instructions.len(),
        "metadata extracted"
    );

    Ok(vec![JobPayload::ClassifyAndPlanSplit { item_id }])
}

fn build_prompt(file_name: &str, total_pages: i64, ocr_text: Option<&str>) -> String {
    let mut prompt = format!(
        "Catalogue the attached document {file_name:?} ({total_pages} pages)."
    );
    if let Some(text) = ocr_text {
        let excerpt: String = text.chars().take(MAX_PROMPT_TEXT_CHARS).collect();
        if !excerpt.trim().is_empty() {
            prompt.push_str("\n\nText extracted from the document, for cross-reference:\n");
            prompt.push_str(&excerpt);
        }
    }
    prompt
}
