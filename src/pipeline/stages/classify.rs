//! `CLASSIFY_AND_PLAN`: turn the extracted metadata into a validated
//! split plan and decide whether it may proceed without a human.

use tracing::info;
use uuid::Uuid;

use crate::pipeline::validator::{self, ValidateOptions};
use crate::types::{ItemStatus, ItemStep, PassStatus};

use super::super::{JobPayload, PipelineError};
use super::{load_document, progress, StageContext};

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidState`] when the item carries no
/// extracted metadata.
pub async fn run(ctx: &StageContext, item_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    match item.current_step {
        Some(ItemStep::MetadataExtracted) => {}
        Some(ItemStep::SplitPlanned) => return Ok(followups_after_plan(ctx, &item.status, item.is_packet, item_id)),
        _ => return Ok(Vec::new()),
    }
    let metadata = item
        .extracted_metadata
        .clone()
        .ok_or_else(|| PipelineError::InvalidState("classify without metadata".to_owned()))?;
    ctx.check_cancel(item.batch_id)?;
    progress("classify_and_plan", item_id, 10);

    // Below the skip-parse threshold the plan is not worth validating;
    // the item goes straight to a human.
    if metadata.confidence_score < ctx.config.skip_parse_threshold {
        ctx.store
            .commit_split_plan(item_id, &[], false, ItemStatus::NeedsReview, true)
            .await?;
        info!(
            item_id = %item_id,
            confidence = metadata.confidence_score,
            "confidence below skip-parse threshold, routed to review"
        );
        return Ok(Vec::new());
    }

    let (_, total_pages) = load_document(ctx, &item).await?;
    progress("classify_and_plan", item_id, 40);

    let mut raw = metadata.cutting_instructions.clone();
    if raw.is_empty() {
        if let Some(fallback) =
            validator::default_full_score_plan(metadata.file_type, total_pages)
        {
            // The fallback is already zero-indexed; shift it so the
            // one-indexed validation below lands where it should.
            let mut shifted = fallback;
            shifted.page_range.start = shifted.page_range.start.saturating_add(1);
            shifted.page_range.end = shifted.page_range.end.saturating_add(1);
            raw.push(shifted);
        }
    }

    let validated = validator::validate_instructions(
        &raw,
        total_pages,
        &ValidateOptions {
            one_indexed: true,
            detect_gaps: false,
            drop_forbidden: true,
            forbidden_labels: ctx.config.forbidden_labels.clone(),
        },
    );
    let is_packet = validated.instructions.len() >= 2;

    // The overall confidence floor overrides auto-approval: below it an
    // item always gets a human, whatever the approval threshold says.
    let auto = metadata.confidence_score >= ctx.config.auto_approve_threshold
        && metadata.confidence_score >= ctx.config.confidence_threshold
        && !validated.instructions.is_empty();
    let (status, requires_review) = if auto {
        (ItemStatus::Approved, false)
    } else {
        (ItemStatus::NeedsReview, true)
    };

    ctx.check_cancel(item.batch_id)?;
    let advanced = ctx
        .store
        .commit_split_plan(item_id, &validated.instructions, is_packet, status, requires_review)
        .await?;
    progress("classify_and_plan", item_id, 100);
    info!(
        item_id = %item_id,
        parts = validated.instructions.len(),
        is_packet,
        auto_approved = auto,
        issues = validated.issues.len(),
        "split plan stored"
    );

    if !advanced || !auto {
        // Either a replay, or the item now waits for a human decision.
        return Ok(Vec::new());
    }
    let followups = followups_after_plan(ctx, &status, is_packet, item_id);
    if followups
        .iter()
        .any(|job| matches!(job, JobPayload::SecondPass { .. }))
    {
        queue_second_pass(ctx, item_id).await?;
    }
    Ok(followups)
}

/// What runs after an approved plan: packets split first; single parts
/// go to verification (when enabled) or straight to finalize.
fn followups_after_plan(
    ctx: &StageContext,
    status: &ItemStatus,
    is_packet: bool,
    item_id: Uuid,
) -> Vec<JobPayload> {
    if *status != ItemStatus::Approved {
        return Vec::new();
    }
    if is_packet {
        return vec![JobPayload::SplitPdf { item_id }];
    }
    if ctx.config.two_pass_enabled {
        vec![JobPayload::SecondPass { item_id }]
    } else {
        vec![JobPayload::Finalize { item_id }]
    }
}

/// Queue marker set when a second pass is on the way.
pub(crate) async fn queue_second_pass(
    ctx: &StageContext,
    item_id: Uuid,
) -> Result<(), PipelineError> {
    ctx.store
        .set_second_pass_status(item_id, PassStatus::Queued)
        .await?;
    Ok(())
}
