//! `INGEST`: commit every autonomously approved item in the batch to the
//! catalog in one transaction.

use tracing::info;
use uuid::Uuid;

use crate::storage::batches::CatalogEntry;
use crate::types::{ItemStatus, UploadItem};

use super::super::{JobPayload, PipelineError};
use super::{progress, StageContext};

/// Run the stage.
///
/// All catalog writes for the batch land in a single transaction: if any
/// item's entries fail to insert, nothing is committed and the batch
/// stays reviewable.
///
/// # Errors
///
/// Returns [`PipelineError::Store`] on database failure (the transaction
/// is rolled back).
pub async fn run(ctx: &StageContext, batch_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let batch = ctx.store.get_batch(batch_id).await?;
    let items = ctx.store.items_for_batch(batch_id).await?;
    ctx.check_cancel(batch_id)?;
    progress("ingest", batch_id, 10);

    let eligible: Vec<&UploadItem> = items.iter().filter(|item| is_eligible(ctx, item)).collect();
    if eligible.is_empty() {
        // Replays after a committed ingest land here: every item is
        // already COMPLETE.
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for item in &eligible {
        let metadata = item.extracted_metadata.as_ref().ok_or_else(|| {
            PipelineError::InvalidState(format!("item {} approved without metadata", item.id))
        })?;
        let parts = item.parsed_parts.as_deref().unwrap_or_default();
        for part in parts {
            entries.push(CatalogEntry {
                id: Uuid::new_v4(),
                item_id: item.id,
                title: metadata.title.clone(),
                composer: metadata.composer.clone(),
                part_name: part.part_name.clone(),
                instrument: part.instrument.clone(),
                storage_key: part.storage_key.clone(),
                page_count: part.page_count,
            });
        }
    }
    progress("ingest", batch_id, 50);

    ctx.check_cancel(batch_id)?;
    ctx.store.ingest_batch(batch_id, &entries).await?;
    progress("ingest", batch_id, 100);
    info!(
        batch_id = %batch_id,
        user_id = %batch.user_id,
        items = eligible.len(),
        entries = entries.len(),
        "batch ingested"
    );

    Ok(Vec::new())
}

/// An item commits autonomously only when every safeguard agrees.
fn is_eligible(ctx: &StageContext, item: &UploadItem) -> bool {
    item.status == ItemStatus::Approved
        && item.auto_approved
        && !item.requires_human_review
        && item
            .final_confidence
            .is_some_and(|c| c >= ctx.config.autonomous_approval_threshold)
        && item.parsed_parts.as_deref().is_some_and(|p| !p.is_empty())
}
