//! Cutting-instruction validation, normalization, and gap filling.
//!
//! All downstream logic is zero-indexed with inclusive `[start, end]`
//! ranges; the wire format (and most LLM output) is one-indexed. The
//! validator is idempotent: running it over its own output (with
//! `one_indexed = false`) changes nothing.

use crate::types::{CuttingInstruction, FileType, PageRange};

/// Largest document that still gets a synthesized whole-document plan
/// when the model returns no instructions for a full score.
const FULL_SCORE_SYNTHESIS_MAX_PAGES: i64 = 30;

/// Validation tuning, set by the calling stage.
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    /// Whether the incoming ranges are one-indexed (LLM wire format).
    pub one_indexed: bool,
    /// Whether to synthesize instructions for uncovered page ranges.
    pub detect_gaps: bool,
    /// Whether forbidden labels drop the instruction (`true`) or only
    /// flag it in `issues` (`false`).
    pub drop_forbidden: bool,
    /// Forbidden labels, lowercased.
    pub forbidden_labels: Vec<String>,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            one_indexed: true,
            detect_gaps: false,
            drop_forbidden: true,
            forbidden_labels: crate::config::DEFAULT_FORBIDDEN_LABELS
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        }
    }
}

/// Validator output.
#[derive(Debug, Clone, Default)]
pub struct Validated {
    /// Normalized, sorted instructions (zero-indexed), gap fills included.
    pub instructions: Vec<CuttingInstruction>,
    /// Uncovered ranges found during gap detection (zero-indexed).
    pub gaps: Vec<PageRange>,
    /// Human-readable diagnostics (drops, clamps, overlaps).
    pub issues: Vec<String>,
}

/// Whether a part label is in the forbidden set (trimmed, lowercased,
/// exact match).
pub fn is_forbidden_label(label: &str, forbidden: &[String]) -> bool {
    let normalized = label.trim().to_lowercase();
    forbidden.iter().any(|f| *f == normalized)
}

/// Validate and normalize a cutting plan against the document size.
pub fn validate_instructions(
    instructions: &[CuttingInstruction],
    total_pages: i64,
    options: &ValidateOptions,
) -> Validated {
    let mut out = Validated::default();
    if total_pages <= 0 {
        out.issues.push("document has no pages".to_owned());
        return out;
    }

    // 1. Indexing normalization + 2. range clamping.
    for instruction in instructions {
        let mut range = instruction.page_range;
        if options.one_indexed {
            range.start = range.start.saturating_sub(1);
            range.end = range.end.saturating_sub(1);
        }

        if range.start > range.end || range.end < 0 || range.start >= total_pages {
            out.issues.push(format!(
                "dropped {:?}: page range [{}, {}] is unusable in a {total_pages}-page document",
                instruction.part_name, range.start, range.end
            ));
            continue;
        }
        if range.start < 0 {
            out.issues.push(format!(
                "clamped {:?} start {} to 0",
                instruction.part_name, range.start
            ));
            range.start = 0;
        }
        if range.end >= total_pages {
            out.issues.push(format!(
                "clamped {:?} end {} to {}",
                instruction.part_name,
                range.end,
                total_pages.saturating_sub(1)
            ));
            range.end = total_pages.saturating_sub(1);
        }

        // 3. Forbidden-label filter.
        if is_forbidden_label(&instruction.part_name, &options.forbidden_labels) {
            out.issues.push(format!(
                "forbidden part label {:?}",
                instruction.part_name
            ));
            if options.drop_forbidden {
                continue;
            }
        }

        let mut kept = instruction.clone();
        kept.page_range = range;
        out.instructions.push(kept);
    }

    // 4. Sort by (start, end).
    out.instructions
        .sort_by_key(|i| (i.page_range.start, i.page_range.end));

    // 5. Gap detection.
    if options.detect_gaps {
        out.gaps = uncovered_ranges(&out.instructions, total_pages);
        for gap in &out.gaps {
            out.instructions.push(gap_instruction(*gap));
        }
        out.instructions
            .sort_by_key(|i| (i.page_range.start, i.page_range.end));
    }

    // 6. Overlap reporting (adjacent ranges are fine, overlaps are not
    // merged, only surfaced).
    for window in out.instructions.windows(2) {
        let (prev, cur) = (&window[0], &window[1]);
        if cur.page_range.start <= prev.page_range.end {
            out.issues.push(format!(
                "overlap: {:?} [{}, {}] and {:?} [{}, {}]",
                prev.part_name,
                prev.page_range.start,
                prev.page_range.end,
                cur.part_name,
                cur.page_range.start,
                cur.page_range.end
            ));
        }
    }

    out
}

/// Maximal contiguous uncovered ranges in `[0, total_pages)`.
fn uncovered_ranges(sorted: &[CuttingInstruction], total_pages: i64) -> Vec<PageRange> {
    let mut gaps = Vec::new();
    let mut cursor: i64 = 0;
    for instruction in sorted {
        let range = instruction.page_range;
        if range.start > cursor {
            gaps.push(PageRange::new(cursor, range.start.saturating_sub(1)));
        }
        cursor = cursor.max(range.end.saturating_add(1));
    }
    if cursor < total_pages {
        gaps.push(PageRange::new(cursor, total_pages.saturating_sub(1)));
    }
    gaps
}

/// The synthesized instruction for an uncovered range. The label is
/// one-indexed because humans read it in the review UI.
fn gap_instruction(gap: PageRange) -> CuttingInstruction {
    CuttingInstruction {
        part_name: format!(
            "Uncovered pages {}-{}",
            gap.start.saturating_add(1),
            gap.end.saturating_add(1)
        ),
        instrument: String::new(),
        section: String::new(),
        transposition: String::new(),
        part_number: None,
        page_range: gap,
    }
}

/// Whether an instruction was synthesized by gap detection.
pub fn is_gap_fill(instruction: &CuttingInstruction) -> bool {
    instruction.part_name.starts_with("Uncovered pages ")
}

/// Fallback plan for a short full score the model returned no
/// instructions for: one instruction covering every page (zero-indexed).
pub fn default_full_score_plan(
    file_type: FileType,
    total_pages: i64,
) -> Option<CuttingInstruction> {
    if file_type != FileType::FullScore || total_pages <= 0 {
        return None;
    }
    if total_pages > FULL_SCORE_SYNTHESIS_MAX_PAGES {
        return None;
    }
    Some(CuttingInstruction {
        part_name: "Full Score".to_owned(),
        instrument: "Score".to_owned(),
        section: "Score".to_owned(),
        transposition: "C".to_owned(),
        part_number: None,
        page_range: PageRange::new(0, total_pages.saturating_sub(1)),
    })
}
