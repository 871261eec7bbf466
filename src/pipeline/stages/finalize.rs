//! `FINALIZE`: gap-fill the plan, run the quality gates, compute the
//! final confidence, and decide between autonomous approval and human
//! review.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::pipeline::quality::{evaluate_quality_gates, GateInput, GatePart};
use crate::pipeline::validator::{self, is_gap_fill, ValidateOptions};
use crate::types::{AssignmentRecord, ItemStatus, ParsedPart, UploadItem};

use super::super::{JobPayload, PipelineError};
use super::{load_document, progress, StageContext};

/// A single uncovered run longer than this forces human review even when
/// the gates otherwise pass.
const MAX_TOLERATED_GAP_PAGES: i64 = 10;

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidState`] when the item has no plan to
/// finalize.
pub async fn run(ctx: &StageContext, item_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    if matches!(
        item.status,
        ItemStatus::Complete | ItemStatus::Failed | ItemStatus::Cancelled
    ) {
        return Ok(Vec::new());
    }
    let metadata = item
        .extracted_metadata
        .clone()
        .ok_or_else(|| PipelineError::InvalidState("finalize without metadata".to_owned()))?;
    let stored_instructions = item.cutting_instructions.clone().unwrap_or_default();
    ctx.check_cancel(item.batch_id)?;
    progress("finalize", item_id, 10);

    let (bytes, total_pages) = load_document(ctx, &item).await?;

    // Stored instructions are already zero-indexed; this pass only fills
    // gaps and reports issues.
    let validated = validator::validate_instructions(
        &stored_instructions,
        total_pages,
        &ValidateOptions {
            one_indexed: false,
            detect_gaps: true,
            drop_forbidden: false,
            forbidden_labels: ctx.config.forbidden_labels.clone(),
        },
    );
    let review_from_gaps = validated
        .gaps
        .iter()
        .any(|gap| gap.len() > MAX_TOLERATED_GAP_PAGES);
    progress("finalize", item_id, 40);

    // Gates look at the real parts: emitted PDFs when the split ran,
    // otherwise the planned cuts (gap fills excluded either way).
    let gate_parts: Vec<GatePart> = match item.parsed_parts.as_deref() {
        Some(parts) if !parts.is_empty() => parts.iter().map(GatePart::from).collect(),
        _ => validated
            .instructions
            .iter()
            .filter(|instruction| !is_gap_fill(instruction))
            .map(GatePart::from)
            .collect(),
    };
    let report = evaluate_quality_gates(&GateInput {
        parts: &gate_parts,
        metadata: &metadata,
        total_pages,
        max_pages_per_part: ctx.config.max_pages_per_part,
        forbidden_labels: &ctx.config.forbidden_labels,
    });

    let final_confidence = report.final_confidence;
    let requires_review = report.failed
        || review_from_gaps
        || item.requires_human_review
        || final_confidence < ctx.config.confidence_threshold
        || final_confidence < ctx.config.autonomous_approval_threshold;
    let auto_approved =
        !requires_review && final_confidence >= ctx.config.auto_approve_threshold;
    let status = if requires_review {
        ItemStatus::NeedsReview
    } else {
        ItemStatus::Approved
    };

    // Single-part items never split; the original document itself is the
    // part the catalog will reference.
    let synthesized = synthesize_single_part(&item, &validated.instructions, bytes.len());

    ctx.check_cancel(item.batch_id)?;
    let advanced = ctx
        .store
        .commit_finalize(
            item_id,
            &validated.instructions,
            synthesized.as_deref(),
            final_confidence,
            requires_review,
            auto_approved,
            status,
        )
        .await?;
    progress("finalize", item_id, 90);

    if advanced {
        ctx.store
            .record_assignment(&AssignmentRecord {
                assignment_id: item_id,
                action: if auto_approved {
                    "AUTO_APPROVED".to_owned()
                } else {
                    "NEEDS_REVIEW".to_owned()
                },
                from_status: Some(item.status.to_string()),
                to_status: status.to_string(),
                notes: if report.reasons.is_empty() {
                    None
                } else {
                    Some(report.reasons.join("; "))
                },
                performed_by: "pipeline".to_owned(),
                performed_at: Utc::now(),
            })
            .await?;
    }
    progress("finalize", item_id, 100);
    info!(
        item_id = %item_id,
        final_confidence,
        requires_review,
        auto_approved,
        gate_failures = report.reasons.len(),
        "finalized"
    );

    if auto_approved && ctx.config.autonomous_mode {
        Ok(vec![JobPayload::Ingest {
            batch_id: item.batch_id,
        }])
    } else {
        Ok(Vec::new())
    }
}

fn synthesize_single_part(
    item: &UploadItem,
    instructions: &[crate::types::CuttingInstruction],
    file_size: usize,
) -> Option<Vec<ParsedPart>> {
    if item.is_packet || item.parsed_parts.as_deref().is_some_and(|p| !p.is_empty()) {
        return None;
    }
    let instruction = instructions.iter().find(|i| !is_gap_fill(i))?;
    Some(vec![ParsedPart {
        part_name: instruction.part_name.clone(),
        instrument: instruction.instrument.clone(),
        section: instruction.section.clone(),
        transposition: instruction.transposition.clone(),
        part_number: instruction.part_number,
        storage_key: item.storage_key.clone(),
        file_name: item.file_name.clone(),
        file_size: u64::try_from(file_size).unwrap_or(u64::MAX),
        page_count: instruction.page_range.len(),
        page_range: instruction.page_range,
    }])
}
