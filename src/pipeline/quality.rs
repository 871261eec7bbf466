//! Deterministic quality gates run before autonomous approval.
//!
//! Gates never call a model; they are pure functions of the part set,
//! metadata, and page counts, so the same item always gets the same
//! verdict. Any failed gate caps the final confidence to 0 and routes the
//! item to human review.

use crate::types::{CuttingInstruction, ExtractedMetadata, PageRange, ParsedPart};

use super::validator::is_forbidden_label;

/// Minimum fraction of the document multi-part plans must cover.
const MIN_COVERAGE: f64 = 0.95;
/// Minimum acceptable segmentation confidence (0-100 scale).
const MIN_SEGMENTATION_CONFIDENCE: f64 = 60.0;

/// A part as the gates see it — either an emitted PDF or a planned cut.
#[derive(Debug, Clone)]
pub struct GatePart {
    /// Part label.
    pub label: String,
    /// Page count.
    pub page_count: i64,
    /// Source pages (zero-indexed, inclusive).
    pub page_range: PageRange,
}

impl From<&ParsedPart> for GatePart {
    fn from(part: &ParsedPart) -> Self {
        Self {
            label: part.part_name.clone(),
            page_count: part.page_count,
            page_range: part.page_range,
        }
    }
}

impl From<&CuttingInstruction> for GatePart {
    fn from(instruction: &CuttingInstruction) -> Self {
        Self {
            label: instruction.part_name.clone(),
            page_count: instruction.page_range.len(),
            page_range: instruction.page_range,
        }
    }
}

/// Input to the gate evaluator.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    /// Parts under evaluation (gap fills excluded).
    pub parts: &'a [GatePart],
    /// Authoritative metadata for the item.
    pub metadata: &'a ExtractedMetadata,
    /// Total pages in the source document.
    pub total_pages: i64,
    /// Largest page count a single part may have.
    pub max_pages_per_part: i64,
    /// Forbidden labels, lowercased.
    pub forbidden_labels: &'a [String],
}

/// Gate verdict.
#[derive(Debug, Clone)]
pub struct GateReport {
    /// Whether any gate failed.
    pub failed: bool,
    /// Human-readable failure reasons for audit and the review UI.
    pub reasons: Vec<String>,
    /// `min(confidence, segmentation)` on the 0-100 scale, 0 when failed.
    pub final_confidence: f64,
}

/// Normalize a confidence value onto the 0-100 scale.
///
/// Models report on either `[0, 1]` or `[0, 100]`; values strictly
/// between 0 and 1 are scaled up. Exactly 0 stays 0 (no information) and
/// exactly 1 is kept as 1-of-100 — the conservative reading, which routes
/// the item to review instead of auto-approving it.
pub fn normalize_confidence(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let scaled = if value > 0.0 && value < 1.0 {
        value * 100.0
    } else {
        value
    };
    scaled.clamp(0.0, 100.0)
}

/// Evaluate every gate and compute the final confidence.
pub fn evaluate_quality_gates(input: &GateInput<'_>) -> GateReport {
    let mut reasons = Vec::new();

    if input.parts.is_empty() {
        reasons.push("no parts were produced".to_owned());
    }

    for part in input.parts {
        if part.page_count > input.max_pages_per_part {
            reasons.push(format!(
                "part {:?} has {} pages (limit {})",
                part.label, part.page_count, input.max_pages_per_part
            ));
        }
        if is_forbidden_label(&part.label, input.forbidden_labels) {
            reasons.push(format!("part label {:?} is not usable", part.label));
        }
    }

    if input.metadata.is_multi_part && input.total_pages > 0 {
        let covered = covered_pages(input.parts, input.total_pages);
        #[allow(clippy::cast_precision_loss)]
        let coverage = covered as f64 / input.total_pages as f64;
        if coverage < MIN_COVERAGE {
            reasons.push(format!(
                "parts cover {covered} of {} pages ({:.0}% < {:.0}%)",
                input.total_pages,
                coverage * 100.0,
                MIN_COVERAGE * 100.0
            ));
        }
    }

    let segmentation = input
        .metadata
        .segmentation_confidence
        .map(normalize_confidence);
    if let Some(segmentation) = segmentation {
        if segmentation < MIN_SEGMENTATION_CONFIDENCE {
            reasons.push(format!(
                "segmentation confidence {segmentation:.0} is below {MIN_SEGMENTATION_CONFIDENCE:.0}"
            ));
        }
    }

    let failed = !reasons.is_empty();
    let mut final_confidence = normalize_confidence(input.metadata.confidence_score);
    if let Some(segmentation) = segmentation {
        final_confidence = final_confidence.min(segmentation);
    }
    if failed {
        final_confidence = 0.0;
    }

    GateReport {
        failed,
        reasons,
        final_confidence,
    }
}

/// Count distinct pages covered by the parts (overlaps counted once).
fn covered_pages(parts: &[GatePart], total_pages: i64) -> i64 {
    let mut ranges: Vec<PageRange> = parts.iter().map(|p| p.page_range).collect();
    ranges.sort_by_key(|r| (r.start, r.end));

    let mut covered: i64 = 0;
    let mut cursor: i64 = 0;
    for range in ranges {
        let start = range.start.max(cursor).max(0);
        let end = range.end.min(total_pages.saturating_sub(1));
        if end >= start {
            covered = covered.saturating_add(end.saturating_sub(start).saturating_add(1));
            cursor = end.saturating_add(1);
        } else {
            cursor = cursor.max(range.end.saturating_add(1));
        }
    }
    covered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FORBIDDEN_LABELS;
    use crate::types::FileType;

    fn forbidden() -> Vec<String> {
        DEFAULT_FORBIDDEN_LABELS.iter().map(|s| (*s).to_owned()).collect()
    }

    fn part(label: &str, start: i64, end: i64) -> GatePart {
        GatePart {
            label: label.to_owned(),
            page_count: PageRange::new(start, end).len(),
            page_range: PageRange::new(start, end),
        }
    }

    fn metadata(confidence: f64, multi: bool, segmentation: Option<f64>) -> ExtractedMetadata {
        ExtractedMetadata {
            title: "Suite".to_owned(),
            composer: "Holst".to_owned(),
            file_type: FileType::FullScore,
            is_multi_part: multi,
            confidence_score: confidence,
            segmentation_confidence: segmentation,
            ..ExtractedMetadata::default()
        }
    }

    #[test]
    fn test_all_gates_pass() {
        let parts = vec![part("Flute", 0, 3), part("Oboe", 4, 7), part("Horn", 8, 11)];
        let meta = metadata(92.0, true, Some(88.0));
        let forbidden = forbidden();
        let report = evaluate_quality_gates(&GateInput {
            parts: &parts,
            metadata: &meta,
            total_pages: 12,
            max_pages_per_part: 12,
            forbidden_labels: &forbidden,
        });
        assert!(!report.failed, "reasons: {:?}", report.reasons);
        assert!((report.final_confidence - 88.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_parts_fail() {
        let meta = metadata(99.0, false, None);
        let forbidden = forbidden();
        let report = evaluate_quality_gates(&GateInput {
            parts: &[],
            metadata: &meta,
            total_pages: 4,
            max_pages_per_part: 12,
            forbidden_labels: &forbidden,
        });
        assert!(report.failed);
        assert!(report.final_confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_oversized_part_fails() {
        let parts = vec![part("Flute", 0, 14)];
        let meta = metadata(95.0, false, None);
        let forbidden = forbidden();
        let report = evaluate_quality_gates(&GateInput {
            parts: &parts,
            metadata: &meta,
            total_pages: 20,
            max_pages_per_part: 12,
            forbidden_labels: &forbidden,
        });
        assert!(report.failed);
        assert!(report.reasons[0].contains("15 pages"));
    }

    #[test]
    fn test_low_coverage_fails_for_multi_part() {
        // 7 of 10 pages covered: 70% < 95%.
        let parts = vec![part("Flute", 0, 2), part("Oboe", 6, 9)];
        let meta = metadata(92.0, true, None);
        let forbidden = forbidden();
        let report = evaluate_quality_gates(&GateInput {
            parts: &parts,
            metadata: &meta,
            total_pages: 10,
            max_pages_per_part: 12,
            forbidden_labels: &forbidden,
        });
        assert!(report.failed);
        assert!(report.final_confidence.abs() < f64::EPSILON);
        assert!(report.reasons.iter().any(|r| r.contains("cover 7 of 10")));
    }

    #[test]
    fn test_single_part_skips_coverage_gate() {
        let parts = vec![part("Piano", 0, 3)];
        let meta = metadata(92.0, false, None);
        let forbidden = forbidden();
        let report = evaluate_quality_gates(&GateInput {
            parts: &parts,
            metadata: &meta,
            total_pages: 40,
            max_pages_per_part: 12,
            forbidden_labels: &forbidden,
        });
        assert!(!report.failed, "reasons: {:?}", report.reasons);
        assert!((report.final_confidence - 92.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_low_segmentation_confidence_fails() {
        let parts = vec![part("Flute", 0, 3)];
        let meta = metadata(90.0, false, Some(45.0));
        let forbidden = forbidden();
        let report = evaluate_quality_gates(&GateInput {
            parts: &parts,
            metadata: &meta,
            total_pages: 4,
            max_pages_per_part: 12,
            forbidden_labels: &forbidden,
        });
        assert!(report.failed);
        assert!(report.final_confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_final_confidence_is_min_of_both() {
        let parts = vec![part("Flute", 0, 3)];
        let meta = metadata(90.0, false, Some(0.75));
        let forbidden = forbidden();
        let report = evaluate_quality_gates(&GateInput {
            parts: &parts,
            metadata: &meta,
            total_pages: 4,
            max_pages_per_part: 12,
            forbidden_labels: &forbidden,
        });
        assert!(!report.failed);
        assert!((report.final_confidence - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_normalize_confidence_heuristic() {
        assert!((normalize_confidence(0.9) - 90.0).abs() < f64::EPSILON);
        assert!((normalize_confidence(90.0) - 90.0).abs() < f64::EPSILON);
        assert!(normalize_confidence(0.0).abs() < f64::EPSILON);
        // Exactly 1 reads as 1-of-100, not 100.
        assert!((normalize_confidence(1.0) - 1.0).abs() < f64::EPSILON);
        assert!((normalize_confidence(250.0) - 100.0).abs() < f64::EPSILON);
        assert!(normalize_confidence(f64::NAN).abs() < f64::EPSILON);
    }
}
