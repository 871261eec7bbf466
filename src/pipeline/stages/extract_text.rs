//! `EXTRACT_TEXT`: download the original into memory, extract its text,
//! persist it, and queue metadata extraction.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::types::ItemStep;

use super::super::{JobPayload, PipelineError};
use super::{load_document, progress, run_blocking, StageContext};

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError::Extraction`] when the blob is missing,
/// unreadable, or yields no text for a non-empty document.
pub async fn run(ctx: &StageContext, item_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    match item.current_step {
        None => {}
        // A prior attempt committed but may have crashed before its
        // successor was enqueued; re-emit it.
        Some(ItemStep::TextExtracted) => {
            return Ok(vec![JobPayload::LlmExtractMetadata { item_id }]);
        }
        Some(_) => return Ok(Vec::new()),
    }
    ctx.check_cancel(item.batch_id)?;
    progress("extract_text", item_id, 10);

    let (bytes, total_pages) = load_document(ctx, &item).await?;
    progress("extract_text", item_id, 30);

    let documents = Arc::clone(&ctx.documents);
    let text = run_blocking(move || documents.extract_text(&bytes)).await?;
    if text.trim().is_empty() && total_pages > 0 {
        return Err(PipelineError::Extraction(format!(
            "no text extracted from {}-page document {:?}",
            total_pages, item.file_name
        )));
    }
    progress("extract_text", item_id, 70);

    ctx.check_cancel(item.batch_id)?;
    ctx.store.commit_text_extracted(item_id, &text).await?;
    progress("extract_text", item_id, 100);
    info!(item_id = %item_id, chars = text.len(), "text extracted");

    Ok(vec![JobPayload::LlmExtractMetadata { item_id }])
}
