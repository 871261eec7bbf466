//! Second-pass verification support: disagreement detection, page and
//! part sampling, and the adjudication trigger.

use rand::seq::index::sample;

use crate::types::{ExtractedMetadata, ParsedPart};

use super::quality::normalize_confidence;
use super::validator::is_forbidden_label;

/// Verification confidence below which the adjudicator runs even without
/// a disagreement.
pub const ADJUDICATION_CONFIDENCE_THRESHOLD: f64 = 85.0;

/// Most pages submitted to the verification model when the provider
/// cannot take the native PDF.
pub const MAX_VERIFY_PAGES: usize = 100;

/// Most already-split parts attached as labeled references.
pub const MAX_VERIFY_PARTS: usize = 3;

/// Most pages submitted to the adjudicator.
pub const MAX_ADJUDICATE_PAGES: usize = 20;

/// The canonical instrument-set fingerprint: lowercased instruments,
/// sorted, comma-joined. Two plans with the same fingerprint name the
/// same instruments regardless of order.
pub fn instrument_set(metadata: &ExtractedMetadata) -> String {
    let mut instruments: Vec<String> = metadata
        .cutting_instructions
        .iter()
        .map(|i| i.instrument.trim().to_lowercase())
        .filter(|i| !i.is_empty())
        .collect();
    instruments.sort();
    instruments.dedup();
    instruments.join(",")
}

/// Critical disagreements between the first and second pass.
///
/// A disagreement is critical iff the trimmed, case-insensitive title or
/// composer differ, or the instrument-set fingerprints differ.
pub fn detect_disagreements(
    first: &ExtractedMetadata,
    second: &ExtractedMetadata,
) -> Vec<String> {
    let mut disagreements = Vec::new();

    let normalize = |s: &str| s.trim().to_lowercase();
    if normalize(&first.title) != normalize(&second.title) {
        disagreements.push(format!(
            "title: {:?} vs {:?}",
            first.title, second.title
        ));
    }
    if normalize(&first.composer) != normalize(&second.composer) {
        disagreements.push(format!(
            "composer: {:?} vs {:?}",
            first.composer, second.composer
        ));
    }
    let (first_set, second_set) = (instrument_set(first), instrument_set(second));
    if first_set != second_set {
        disagreements.push(format!(
            "instruments: [{first_set}] vs [{second_set}]"
        ));
    }

    disagreements
}

/// Whether the pass produced no usable part labels at all.
pub fn all_labels_unusable(metadata: &ExtractedMetadata, forbidden: &[String]) -> bool {
    metadata
        .cutting_instructions
        .iter()
        .all(|i| is_forbidden_label(&i.part_name, forbidden))
}

/// Whether adjudication must run.
pub fn needs_adjudication(
    disagreements: &[String],
    verification_confidence: Option<f64>,
    labels_unusable: bool,
) -> bool {
    if !disagreements.is_empty() || labels_unusable {
        return true;
    }
    match verification_confidence.map(normalize_confidence) {
        Some(confidence) => confidence < ADJUDICATION_CONFIDENCE_THRESHOLD,
        None => true,
    }
}

/// Pick up to `max` zero-indexed pages spread evenly across the document,
/// first page always included.
pub fn sample_pages_evenly(total_pages: i64, max: usize) -> Vec<i64> {
    if total_pages <= 0 || max == 0 {
        return Vec::new();
    }
    let max = i64::try_from(max).unwrap_or(i64::MAX);
    if total_pages <= max {
        return (0..total_pages).collect();
    }
    let mut pages = Vec::new();
    for i in 0..max {
        // floor(i * total / max) is strictly increasing for total > max.
        let page = i
            .checked_mul(total_pages)
            .and_then(|product| product.checked_div(max))
            .unwrap_or(i64::MAX);
        if pages.last() != Some(&page) {
            pages.push(page);
        }
    }
    pages
}

/// Pick up to `max` parts at random, original order preserved.
pub fn sample_parts(parts: &[ParsedPart], max: usize) -> Vec<&ParsedPart> {
    if parts.len() <= max {
        return parts.iter().collect();
    }
    let mut rng = rand::thread_rng();
    let mut indices: Vec<usize> = sample(&mut rng, parts.len(), max).into_vec();
    indices.sort_unstable();
    indices.into_iter().filter_map(|i| parts.get(i)).collect()
}
