//! `SPLIT_PDF`: cut an approved packet into per-instrument PDFs and
//! upload each one under a deterministic slug-based key.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::pipeline::validator::is_gap_fill;
use crate::types::{part_slug, ItemStatus, ItemStep, ParsedPart, PassStatus};

use super::super::{JobPayload, PipelineError};
use super::{load_document, progress, run_blocking, StageContext};

/// Run the stage.
///
/// # Errors
///
/// Returns [`PipelineError::Cancelled`] when the batch is cancelled at a
/// checkpoint; partially uploaded blobs are recorded as temp files first
/// so cleanup can delete them.
pub async fn run(ctx: &StageContext, item_id: Uuid) -> Result<Vec<JobPayload>, PipelineError> {
    let item = ctx.store.get_item(item_id).await?;
    match (item.status, item.current_step) {
        (ItemStatus::Approved, Some(ItemStep::SplitPlanned)) => {}
        (_, Some(ItemStep::SplitComplete)) => {
            return Ok(next_jobs(ctx, item_id));
        }
        _ => return Ok(Vec::new()),
    }
    let instructions = item
        .cutting_instructions
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|instruction| !is_gap_fill(instruction))
        .collect::<Vec<_>>();
    if instructions.is_empty() {
        return Err(PipelineError::InvalidState(
            "split requested without a cutting plan".to_owned(),
        ));
    }
    ctx.check_cancel(item.batch_id)?;
    progress("split_pdf", item_id, 10);

    let (bytes, _) = load_document(ctx, &item).await?;

    let mut parts: Vec<ParsedPart> = Vec::with_capacity(instructions.len());
    let mut uploaded_keys: Vec<String> = Vec::new();
    let mut slug_uses: HashMap<String, u32> = HashMap::new();
    let total = instructions.len();

    for (index, instruction) in instructions.iter().enumerate() {
        // Cancellation is observed between every split/upload pair, so a
        // cancel mid-batch stops before the next blob is written.
        ctx.check_cancel(item.batch_id)?;

        let documents = Arc::clone(&ctx.documents);
        let source = bytes.clone();
        let range = instruction.page_range;
        let part_bytes = run_blocking(move || documents.split(&source, range)).await?;

        let slug = unique_slug(&instruction.part_name, &mut slug_uses);
        let storage_key = format!("{}/parts/{slug}.pdf", session_prefix(&item));
        let file_name = format!("{slug}.pdf");

        // Record the key before the upload: if the upload half-lands and
        // this attempt dies, cleanup still knows what to delete.
        ctx.store
            .append_temp_files(item_id, &[storage_key.clone()])
            .await?;
        ctx.blobs
            .upload(&storage_key, &part_bytes, "application/pdf")
            .await?;
        uploaded_keys.push(storage_key.clone());

        parts.push(ParsedPart {
            part_name: instruction.part_name.clone(),
            instrument: instruction.instrument.clone(),
            section: instruction.section.clone(),
            transposition: instruction.transposition.clone(),
            part_number: instruction.part_number,
            storage_key,
            file_name,
            file_size: u64::try_from(part_bytes.len()).unwrap_or(u64::MAX),
            page_count: range.len(),
            page_range: range,
        });

        let pct = 10u8.saturating_add(
            u8::try_from(
                index
                    .saturating_add(1)
                    .saturating_mul(80)
                    .checked_div(total)
                    .unwrap_or(0),
            )
            .unwrap_or(80),
        );
        progress("split_pdf", item_id, pct);
    }

    ctx.check_cancel(item.batch_id)?;
    ctx.store
        .commit_split_complete(item_id, &parts, &uploaded_keys)
        .await?;
    progress("split_pdf", item_id, 100);
    info!(item_id = %item_id, parts = parts.len(), "packet split");

    let followups = next_jobs(ctx, item_id);
    if followups
        .iter()
        .any(|job| matches!(job, JobPayload::SecondPass { .. }))
    {
        ctx.store
            .set_second_pass_status(item_id, PassStatus::Queued)
            .await?;
    }
    Ok(followups)
}

fn next_jobs(ctx: &StageContext, item_id: Uuid) -> Vec<JobPayload> {
    if ctx.config.two_pass_enabled {
        vec![JobPayload::SecondPass { item_id }]
    } else {
        vec![JobPayload::Finalize { item_id }]
    }
}

/// The upload session prefix parts are stored under: the original's
/// `smart-upload/{session}` prefix when it has one, the item id
/// otherwise.
fn session_prefix(item: &crate::types::UploadItem) -> String {
    if item.storage_key.starts_with("smart-upload/") {
        if let Some((prefix, _)) = item.storage_key.rsplit_once('/') {
            return prefix.to_owned();
        }
    }
    format!("smart-upload/{}", item.id)
}

/// Slug with a numeric suffix for repeated part names within one item.
fn unique_slug(part_name: &str, uses: &mut HashMap<String, u32>) -> String {
    let base = part_slug(part_name);
    let count = uses.entry(base.clone()).or_insert(0);
    *count = count.saturating_add(1);
    if *count == 1 {
        base
    } else {
        format!("{base}-{count}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_slug_suffixes_duplicates() {
        let mut uses = HashMap::new();
        assert_eq!(unique_slug("Clarinet in Bb", &mut uses), "clarinet-in-bb");
        assert_eq!(unique_slug("Clarinet in Bb", &mut uses), "clarinet-in-bb-2");
        assert_eq!(unique_slug("Clarinet in Bb", &mut uses), "clarinet-in-bb-3");
        assert_eq!(unique_slug("Flute", &mut uses), "flute");
    }
}
