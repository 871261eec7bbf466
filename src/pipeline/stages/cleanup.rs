//! `CLEANUP`: best-effort deletion of processing blobs, then the
//! terminal `CANCELLED`/`FAILED` transition.
//!
//! Blob deletion never fails the stage: a storage error is logged and
//! the item still reaches its terminal state. Orphaned blobs are the
//! operator sweep's problem, not the user's.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{AssignmentRecord, ItemStatus};

use super::super::{CleanupReason, JobPayload, PipelineError};
use super::{progress, StageContext};

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError::Store`] only for database failures; blob
/// deletion is best-effort.
pub async fn run(
    ctx: &StageContext,
    item_id: Uuid,
    reason: CleanupReason,
) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    // Ingested parts are catalog property now; cancelled items were
    // already swept.
    if matches!(item.status, ItemStatus::Complete | ItemStatus::Cancelled) {
        return Ok(Vec::new());
    }
    progress("cleanup", item_id, 10);

    let mut keys: Vec<String> = item.temp_files.clone();
    for part in item.parsed_parts.as_deref().unwrap_or_default() {
        if !keys.contains(&part.storage_key) {
            keys.push(part.storage_key.clone());
        }
    }

    let mut deleted: usize = 0;
    for key in &keys {
        match ctx.blobs.delete(key).await {
            Ok(()) => deleted = deleted.saturating_add(1),
            Err(err) => {
                warn!(item_id = %item_id, key = %key, error = %err, "blob delete failed during cleanup");
            }
        }
    }
    progress("cleanup", item_id, 70);

    let from_status = item.status.to_string();
    let to_status = match reason {
        CleanupReason::Cancelled => {
            ctx.store.mark_item_cancelled(item_id).await?;
            ItemStatus::Cancelled
        }
        CleanupReason::Failed => {
            let message = item
                .error_message
                .clone()
                .unwrap_or_else(|| "processing failed".to_owned());
            ctx.store.mark_item_failed(item_id, &message, None).await?;
            ItemStatus::Failed
        }
    };

    ctx.store
        .record_assignment(&AssignmentRecord {
            assignment_id: item_id,
            action: "CLEANUP".to_owned(),
            from_status: Some(from_status),
            to_status: to_status.to_string(),
            notes: Some(format!("deleted {deleted} of {} blobs", keys.len())),
            performed_by: "pipeline".to_owned(),
            performed_at: Utc::now(),
        })
        .await?;
    progress("cleanup", item_id, 100);
    info!(
        item_id = %item_id,
        reason = ?reason,
        blobs = keys.len(),
        deleted,
        "cleanup complete"
    );

    Ok(Vec::new())
}
