//! The Smart Upload pipeline: stage-keyed jobs, validation, quality
//! gates, and the engine that advances items through their lifecycle.
//!
//! ```text
//! EXTRACT_TEXT -> LLM_EXTRACT_METADATA -> CLASSIFY_AND_PLAN
//!  -> [SPLIT_PDF] -> [SECOND_PASS_VERIFY] -> [ADJUDICATE]
//!  -> FINALIZE -> [INGEST] -> (terminal)
//! CLEANUP is a branch reachable from any state on cancel/fatal failure.
//! ```
//!
//! Jobs are a sum type ([`JobPayload`]) keyed by wire name; an unknown
//! job name fails at parse, not at dispatch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod engine;
pub mod quality;
pub mod queue;
pub mod stages;
pub mod validator;
pub mod verify;

/// Which worker pool a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// The main smart-upload pool.
    SmartUpload,
    /// The single-worker cleanup pool.
    Cleanup,
}

impl QueueName {
    /// Queue name as shown in health output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SmartUpload => "smart-upload",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Why cleanup is running for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupReason {
    /// The user cancelled the batch.
    Cancelled,
    /// A stage failed terminally.
    Failed,
}

/// One job, tagged with its wire name. Every stage's payload is spelled
/// out here and matched exhaustively in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job")]
pub enum JobPayload {
    /// Download the original and extract its text.
    #[serde(rename = "smartupload.extractText")]
    ExtractText {
        /// Target item.
        item_id: Uuid,
    },
    /// First-pass vision metadata extraction.
    #[serde(rename = "smartupload.llmExtractMetadata")]
    LlmExtractMetadata {
        /// Target item.
        item_id: Uuid,
    },
    /// Part classification and split planning.
    #[serde(rename = "smartupload.classifyAndPlanSplit")]
    ClassifyAndPlanSplit {
        /// Target item.
        item_id: Uuid,
    },
    /// Split an approved packet into per-instrument parts.
    #[serde(rename = "smartupload.splitPdf")]
    SplitPdf {
        /// Target item.
        item_id: Uuid,
    },
    /// Second-pass verification of the original against the split parts.
    #[serde(rename = "smartupload.secondPass")]
    SecondPass {
        /// Target item.
        item_id: Uuid,
    },
    /// Adjudicate a first/second pass disagreement.
    #[serde(rename = "smartupload.adjudicate")]
    Adjudicate {
        /// Target item.
        item_id: Uuid,
    },
    /// Gap-fill, quality gates, and final confidence.
    #[serde(rename = "smartupload.finalize")]
    Finalize {
        /// Target item.
        item_id: Uuid,
    },
    /// Commit a batch's approved items to the catalog.
    #[serde(rename = "smartupload.ingest")]
    Ingest {
        /// Target batch.
        batch_id: Uuid,
    },
    /// Delete temp blobs and mark the item cancelled/failed.
    #[serde(rename = "smartupload.cleanup")]
    Cleanup {
        /// Target item.
        item_id: Uuid,
        /// Why cleanup is running.
        reason: CleanupReason,
    },
}

impl JobPayload {
    /// The wire name for logs and queue stats.
    pub fn job_name(&self) -> &'static str {
        match self {
            Self::ExtractText { .. } => "smartupload.extractText",
            Self::LlmExtractMetadata { .. } => "smartupload.llmExtractMetadata",
            Self::ClassifyAndPlanSplit { .. } => "smartupload.classifyAndPlanSplit",
            Self::SplitPdf { .. } => "smartupload.splitPdf",
            Self::SecondPass { .. } => "smartupload.secondPass",
            Self::Adjudicate { .. } => "smartupload.adjudicate",
            Self::Finalize { .. } => "smartupload.finalize",
            Self::Ingest { .. } => "smartupload.ingest",
            Self::Cleanup { .. } => "smartupload.cleanup",
        }
    }

    /// Which pool this job belongs on.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Cleanup { .. } => QueueName::Cleanup,
            _ => QueueName::SmartUpload,
        }
    }

    /// The item this job targets, when it targets one.
    pub fn item_id(&self) -> Option<Uuid> {
        match self {
            Self::ExtractText { item_id }
            | Self::LlmExtractMetadata { item_id }
            | Self::ClassifyAndPlanSplit { item_id }
            | Self::SplitPdf { item_id }
            | Self::SecondPass { item_id }
            | Self::Adjudicate { item_id }
            | Self::Finalize { item_id }
            | Self::Cleanup { item_id, .. } => Some(*item_id),
            Self::Ingest { .. } => None,
        }
    }
}

/// Parse a wire job (`{"job": "smartupload.extractText", ...}`).
/// Unknown job names are a hard error.
///
/// # Errors
///
/// Returns the serde error for unknown names or malformed payloads.
pub fn parse_job(value: serde_json::Value) -> Result<JobPayload, serde_json::Error> {
    serde_json::from_value(value)
}

/// Stage-handler failures, mapped onto the pipeline error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The blob was missing, unreadable, or yielded no text.
    #[error("extraction failed: {0}")]
    Extraction(String),
    /// The LLM call failed terminally (timeout, bad request, exhausted
    /// retries).
    #[error("LLM call failed: {0}")]
    Llm(#[from] crate::llm::dispatcher::DispatchError),
    /// Model output was not a JSON object even after the repair pass.
    #[error("model output unusable: {0}")]
    Parse(#[from] crate::llm::json_extract::JsonExtractError),
    /// Document engine failure.
    #[error("document error: {0}")]
    Document(#[from] crate::document::DocumentError),
    /// Blob store failure.
    #[error("blob storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    /// Relational store failure.
    #[error("database error: {0}")]
    Store(#[from] crate::storage::StoreError),
    /// Cancellation observed at a suspension point.
    #[error("cancelled")]
    Cancelled,
    /// The item is not in a state this stage can work on.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl PipelineError {
    /// Short machine-readable kind for `error_details`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "EXTRACTION",
            Self::Llm(e) => match e {
                crate::llm::dispatcher::DispatchError::Timeout(_) => "TIMEOUT",
                crate::llm::dispatcher::DispatchError::Cancelled => "CANCELLED",
                e if e.is_transient_exhaustion() => "TRANSIENT_LLM",
                crate::llm::dispatcher::DispatchError::Provider(
                    crate::llm::ProviderError::MissingKey(_)
                    | crate::llm::ProviderError::MissingEndpoint(_),
                ) => "MISSING_KEY",
                _ => "BAD_REQUEST_LLM",
            },
            Self::Parse(_) => "PARSE_ERROR",
            Self::Document(_) => "DOCUMENT",
            Self::Storage(_) => "STORAGE_IO",
            Self::Store(_) => "DB_CONFLICT",
            Self::Cancelled => "CANCELLED",
            Self::InvalidState(_) => "INVALID_STATE",
        }
    }

    /// Whether the queue should retry the job.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::InvalidState(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_wire_round_trip() {
        let item_id = Uuid::new_v4();
        let job = JobPayload::ExtractText { item_id };
        let wire = serde_json::to_value(&job).expect("serialize");
        assert_eq!(wire["job"], "smartupload.extractText");
        let back = parse_job(wire).expect("parse");
        assert_eq!(back, job);
    }

    #[test]
    fn test_unknown_job_name_is_hard_error() {
        let result = parse_job(json!({
            "job": "smartupload.doSomethingElse",
            "item_id": Uuid::new_v4(),
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_cleanup_routes_to_cleanup_queue() {
        let cleanup = JobPayload::Cleanup {
            item_id: Uuid::new_v4(),
            reason: CleanupReason::Cancelled,
        };
        assert_eq!(cleanup.queue(), QueueName::Cleanup);
        assert_eq!(
            JobPayload::SplitPdf {
                item_id: Uuid::new_v4()
            }
            .queue(),
            QueueName::SmartUpload
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PipelineError::Extraction("empty".to_owned()).kind(),
            "EXTRACTION"
        );
        assert_eq!(PipelineError::Cancelled.kind(), "CANCELLED");
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(PipelineError::Extraction("x".to_owned()).is_retryable());
    }
}
