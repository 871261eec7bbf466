//! Core domain types for the Smart Upload pipeline.
//!
//! A [`Batch`] groups uploaded files; each file is an [`UploadItem`] that
//! advances through the pipeline stages. The vision model produces
//! [`ExtractedMetadata`] with a page-level cutting plan
//! ([`CuttingInstruction`]); the splitter emits one [`ParsedPart`] per
//! instrument. Wire-facing types use camelCase to match the LLM JSON
//! contract and the admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Batch ───────────────────────────────────────────────────────

/// Lifecycle status of an upload batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Batch created, no items queued yet.
    Created,
    /// At least one item is in flight.
    Processing,
    /// All items processed; at least one needs a human decision.
    NeedsReview,
    /// Every item completed (ingested or approved).
    Complete,
    /// At least one item failed terminally.
    Failed,
    /// Batch cancelled by the user; cleanup has run.
    Cancelled,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("CREATED"),
            Self::Processing => f.write_str("PROCESSING"),
            Self::NeedsReview => f.write_str("NEEDS_REVIEW"),
            Self::Complete => f.write_str("COMPLETE"),
            Self::Failed => f.write_str("FAILED"),
            Self::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "PROCESSING" => Ok(Self::Processing),
            "NEEDS_REVIEW" => Ok(Self::NeedsReview),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(anyhow::anyhow!("unknown batch status: {other:?}")),
        }
    }
}

/// A user-initiated grouping of uploaded files.
///
/// Invariants: `success_files + failed_files <= total_files`;
/// `Complete` requires `processed_files == total_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Batch UUID.
    pub id: Uuid,
    /// Owning user identifier.
    pub user_id: String,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// Number of files uploaded into the batch.
    pub total_files: i64,
    /// Items that have reached a terminal or review state.
    pub processed_files: i64,
    /// Items that completed successfully.
    pub success_files: i64,
    /// Items that failed terminally.
    pub failed_files: i64,
    /// Aggregated error text shown to the user, if any item failed.
    pub error_summary: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

// ── Item ────────────────────────────────────────────────────────

/// Lifecycle status of a single uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Uploaded, not yet picked up.
    Created,
    /// A stage handler is (or will be) working on it.
    Processing,
    /// Halted awaiting a human decision.
    NeedsReview,
    /// Approved (by a human or autonomously); split may proceed.
    Approved,
    /// Terminal success.
    Complete,
    /// Terminal failure.
    Failed,
    /// Cancelled; cleanup has run.
    Cancelled,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("CREATED"),
            Self::Processing => f.write_str("PROCESSING"),
            Self::NeedsReview => f.write_str("NEEDS_REVIEW"),
            Self::Approved => f.write_str("APPROVED"),
            Self::Complete => f.write_str("COMPLETE"),
            Self::Failed => f.write_str("FAILED"),
            Self::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "PROCESSING" => Ok(Self::Processing),
            "NEEDS_REVIEW" => Ok(Self::NeedsReview),
            "APPROVED" => Ok(Self::Approved),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(anyhow::anyhow!("unknown item status: {other:?}")),
        }
    }
}

/// Furthest pipeline milestone an item has committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStep {
    /// OCR text persisted.
    TextExtracted,
    /// Vision-model metadata persisted.
    MetadataExtracted,
    /// Cutting plan persisted; awaiting approval.
    SplitPlanned,
    /// All parts split and uploaded.
    SplitComplete,
    /// Catalog entries committed.
    Ingested,
}

impl std::fmt::Display for ItemStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextExtracted => f.write_str("TEXT_EXTRACTED"),
            Self::MetadataExtracted => f.write_str("METADATA_EXTRACTED"),
            Self::SplitPlanned => f.write_str("SPLIT_PLANNED"),
            Self::SplitComplete => f.write_str("SPLIT_COMPLETE"),
            Self::Ingested => f.write_str("INGESTED"),
        }
    }
}

impl std::str::FromStr for ItemStep {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT_EXTRACTED" => Ok(Self::TextExtracted),
            "METADATA_EXTRACTED" => Ok(Self::MetadataExtracted),
            "SPLIT_PLANNED" => Ok(Self::SplitPlanned),
            "SPLIT_COMPLETE" => Ok(Self::SplitComplete),
            "INGESTED" => Ok(Self::Ingested),
            other => Err(anyhow::anyhow!("unknown item step: {other:?}")),
        }
    }
}

/// Status of an auxiliary LLM pass (second-pass verify, adjudication).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassStatus {
    /// Enqueued, not started.
    Queued,
    /// A worker picked it up.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

impl std::fmt::Display for PassStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => f.write_str("QUEUED"),
            Self::InProgress => f.write_str("IN_PROGRESS"),
            Self::Complete => f.write_str("COMPLETE"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

impl std::str::FromStr for PassStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown pass status: {other:?}")),
        }
    }
}

/// One uploaded file within a batch, with all pipeline state embedded.
///
/// Invariants: `Approved`/`Complete` packets have non-empty `parsed_parts`;
/// `auto_approved` implies `!requires_human_review` and a final confidence
/// at or above the auto-approve threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    /// Item UUID.
    pub id: Uuid,
    /// Owning batch.
    pub batch_id: Uuid,
    /// Original upload file name.
    pub file_name: String,
    /// MIME type as uploaded (normally `application/pdf`).
    pub mime_type: String,
    /// Blob-store key of the original document.
    pub storage_key: String,
    /// Lifecycle status.
    pub status: ItemStatus,
    /// Furthest committed milestone, if any.
    pub current_step: Option<ItemStep>,
    /// Extracted document text, if the extract stage has run.
    pub ocr_text: Option<String>,
    /// First-pass vision metadata, if extracted.
    pub extracted_metadata: Option<ExtractedMetadata>,
    /// Validated cutting plan, if planned.
    pub cutting_instructions: Option<Vec<CuttingInstruction>>,
    /// Split output parts, if the split stage has run.
    pub parsed_parts: Option<Vec<ParsedPart>>,
    /// Second-pass verification metadata, if that pass ran.
    pub second_pass_metadata: Option<ExtractedMetadata>,
    /// Second-pass verification status, if queued.
    pub second_pass_status: Option<PassStatus>,
    /// Adjudication status, if triggered.
    pub adjudicator_status: Option<PassStatus>,
    /// Free-text notes from the adjudicator, if it ran.
    pub adjudication_notes: Option<String>,
    /// Final confidence in `[0, 100]` after finalize.
    pub final_confidence: Option<f64>,
    /// Whether the item was approved without a human.
    pub auto_approved: bool,
    /// Whether a human must look at this item before ingest.
    pub requires_human_review: bool,
    /// Whether the source document contains multiple concatenated parts.
    pub is_packet: bool,
    /// User-visible error text on failure.
    pub error_message: Option<String>,
    /// Structured error detail (JSON) for operators.
    pub error_details: Option<serde_json::Value>,
    /// Blob keys written during processing, deleted by cleanup.
    pub temp_files: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

// ── Metadata & cutting plan ─────────────────────────────────────

/// Document classification produced by the vision model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    /// Full ensemble score.
    FullScore,
    /// Conductor's score.
    ConductorScore,
    /// Condensed score.
    CondensedScore,
    /// A single instrument part.
    Part,
    /// Anything else (program notes, cover sheets, ...).
    Other,
}

impl FileType {
    /// Whether this classification denotes some form of score.
    pub fn is_score(self) -> bool {
        matches!(
            self,
            Self::FullScore | Self::ConductorScore | Self::CondensedScore
        )
    }
}

impl Default for FileType {
    fn default() -> Self {
        Self::Other
    }
}

/// An inclusive page interval.
///
/// Serialized as a two-element array `[start, end]`. The wire format is
/// one-indexed; the validator normalizes to zero-indexed for all internal
/// logic. Fields are signed so junk model output (`0`, negatives) survives
/// deserialization and is rejected by validation rather than by serde.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i64; 2]", into = "[i64; 2]")]
pub struct PageRange {
    /// First page of the interval.
    pub start: i64,
    /// Last page of the interval (inclusive).
    pub end: i64,
}

impl PageRange {
    /// Construct a range.
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of pages covered, 0 for inverted ranges.
    pub fn len(&self) -> i64 {
        if self.end < self.start {
            0
        } else {
            self.end.saturating_sub(self.start).saturating_add(1)
        }
    }

    /// Whether the range covers no pages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<[i64; 2]> for PageRange {
    fn from(v: [i64; 2]) -> Self {
        Self {
            start: v[0],
            end: v[1],
        }
    }
}

impl From<PageRange> for [i64; 2] {
    fn from(r: PageRange) -> Self {
        [r.start, r.end]
    }
}

/// A record telling the splitter which page range becomes which part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuttingInstruction {
    /// Display label for the part (e.g. "Clarinet in Bb 1").
    pub part_name: String,
    /// Instrument name (e.g. "Clarinet").
    #[serde(default)]
    pub instrument: String,
    /// Ensemble section (e.g. "Woodwinds").
    #[serde(default)]
    pub section: String,
    /// Transposition (e.g. "Bb", "C").
    #[serde(default)]
    pub transposition: String,
    /// Part number within the instrument (1 for "Clarinet 1").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_number: Option<u32>,
    /// Pages this part occupies.
    pub page_range: PageRange,
}

/// Structured metadata extracted by the vision model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedMetadata {
    /// Work title.
    pub title: String,
    /// Composer name.
    pub composer: String,
    /// Arranger, when credited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arranger: Option<String>,
    /// Opus or catalog number, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opus: Option<String>,
    /// Document classification.
    pub file_type: FileType,
    /// Whether the document concatenates multiple parts.
    pub is_multi_part: bool,
    /// Overall extraction confidence in `[0, 100]` (or `[0, 1]`, normalized
    /// downstream).
    pub confidence_score: f64,
    /// Confidence in the cutting plan specifically, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmentation_confidence: Option<f64>,
    /// Page-level cutting plan.
    pub cutting_instructions: Vec<CuttingInstruction>,
    /// Free-text observations from the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ── Parsed parts ────────────────────────────────────────────────

/// An emitted per-instrument PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPart {
    /// Display label for the part.
    pub part_name: String,
    /// Instrument name.
    pub instrument: String,
    /// Ensemble section.
    pub section: String,
    /// Transposition.
    pub transposition: String,
    /// Part number within the instrument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_number: Option<u32>,
    /// Blob-store key of the emitted PDF.
    pub storage_key: String,
    /// File name of the emitted PDF.
    pub file_name: String,
    /// Emitted file size in bytes.
    pub file_size: u64,
    /// Number of pages in the emitted PDF.
    pub page_count: i64,
    /// Source pages (zero-indexed, inclusive).
    pub page_range: PageRange,
}

// ── Audit records ───────────────────────────────────────────────

/// Audit record emitted on pipeline transitions, in the same shape the
/// librarian assignment sidecar uses for its history trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    /// Aggregate the action applies to (the upload item).
    pub assignment_id: Uuid,
    /// What happened (e.g. "AUTO_APPROVED", "INGESTED", "CLEANUP").
    pub action: String,
    /// Status before the action, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,
    /// Status after the action.
    pub to_status: String,
    /// Free-text context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Actor ("pipeline", or a user id).
    pub performed_by: String,
    /// When the action happened.
    pub performed_at: DateTime<Utc>,
}

// ── Helpers ─────────────────────────────────────────────────────

/// Derive a storage-key slug from a part name: lowercased, alphanumerics
/// kept, every other run of characters collapsed to a single dash.
///
/// Returns `"part"` for names with no usable characters so keys never end
/// up empty.
pub fn part_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "part".to_owned()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_slug_basic() {
        assert_eq!(part_slug("Clarinet in Bb 1"), "clarinet-in-bb-1");
        assert_eq!(part_slug("  Flute/Piccolo  "), "flute-piccolo");
        assert_eq!(part_slug("Horn (F) #2"), "horn-f-2");
    }

    #[test]
    fn test_part_slug_degenerate() {
        assert_eq!(part_slug(""), "part");
        assert_eq!(part_slug("***"), "part");
        assert_eq!(part_slug("---a---"), "a");
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            BatchStatus::Created,
            BatchStatus::Processing,
            BatchStatus::NeedsReview,
            BatchStatus::Complete,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
        ] {
            let tag = status.to_string();
            let parsed: BatchStatus = tag.parse().expect("round trip");
            assert_eq!(parsed, status);
        }
        let step: ItemStep = "SPLIT_PLANNED".parse().expect("parse");
        assert_eq!(step, ItemStep::SplitPlanned);
        assert!("NOT_A_STATUS".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn test_page_range_serde_is_two_element_array() {
        let r = PageRange::new(2, 5);
        let json = serde_json::to_string(&r).expect("serialize");
        assert_eq!(json, "[2,5]");
        let back: PageRange = serde_json::from_str("[1,4]").expect("deserialize");
        assert_eq!(back, PageRange::new(1, 4));
    }

    #[test]
    fn test_page_range_len() {
        assert_eq!(PageRange::new(0, 0).len(), 1);
        assert_eq!(PageRange::new(2, 5).len(), 4);
        assert_eq!(PageRange::new(5, 2).len(), 0);
        assert!(PageRange::new(5, 2).is_empty());
    }

    #[test]
    fn test_metadata_lenient_deserialization() {
        // Missing fields default rather than failing the whole parse.
        let json = r#"{"title":"Sonata","composer":"Bach","confidenceScore":92}"#;
        let m: ExtractedMetadata = serde_json::from_str(json).expect("parse");
        assert_eq!(m.title, "Sonata");
        assert_eq!(m.file_type, FileType::Other);
        assert!(!m.is_multi_part);
        assert!(m.cutting_instructions.is_empty());
        assert!(m.segmentation_confidence.is_none());
    }

    #[test]
    fn test_cutting_instruction_wire_shape() {
        let json = r#"{
            "partName": "Flute",
            "instrument": "Flute",
            "section": "Woodwinds",
            "transposition": "C",
            "pageRange": [1, 4]
        }"#;
        let ci: CuttingInstruction = serde_json::from_str(json).expect("parse");
        assert_eq!(ci.part_name, "Flute");
        assert_eq!(ci.page_range, PageRange::new(1, 4));
        assert!(ci.part_number.is_none());
    }
}
