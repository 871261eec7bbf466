//! End-to-end pipeline scenarios driven through the engine with a
//! scripted LLM and a fake document engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use partsmith::llm::dispatcher::{Dispatcher, Transport, TransportError, TransportResponse};
use partsmith::llm::rate_limit::RateLimiter;
use partsmith::pipeline::engine::{CancelRegistry, PipelineEngine};
use partsmith::pipeline::JobPayload;
use partsmith::storage::batches::{BatchStore, NewUpload};
use partsmith::storage::db;
use partsmith::storage::fs::FsBlobStore;
use partsmith::storage::settings::SettingsStore;
use partsmith::storage::{BlobStore, StorageError};
use partsmith::types::{BatchStatus, ItemStatus, ItemStep, PassStatus};

use crate::support::{drive, fake_pdf, llm_json_response, FakeDocumentEngine, ScriptedTransport};

// ── Harness ─────────────────────────────────────────────────────

struct TestEnv {
    engine: Arc<PipelineEngine>,
    store: BatchStore,
    settings: SettingsStore,
    blobs: Arc<dyn BlobStore>,
    transport: Arc<ScriptedTransport>,
    _tmp: tempfile::TempDir,
}

async fn env_with_blobs(
    script: Vec<Result<TransportResponse, TransportError>>,
    wrap_blobs: impl FnOnce(Arc<dyn BlobStore>) -> Arc<dyn BlobStore>,
) -> TestEnv {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pool = db::connect_memory().await.expect("db");
    let store = BatchStore::new(pool.clone());
    let settings = SettingsStore::new(pool);

    settings.set("llm_provider", "openai").await.expect("set");
    settings
        .set("llm_openai_api_key", "sk-test")
        .await
        .expect("set");

    let blobs = wrap_blobs(Arc::new(FsBlobStore::new(tmp.path())));
    let transport = ScriptedTransport::new(script);
    let dispatcher = Arc::new(Dispatcher::with_transport(
        transport.clone(),
        Arc::new(RateLimiter::new(1000)),
    ));
    let engine = PipelineEngine::new(
        store.clone(),
        Arc::clone(&blobs),
        Arc::new(FakeDocumentEngine),
        dispatcher,
        settings.clone(),
    );

    TestEnv {
        engine,
        store,
        settings,
        blobs,
        transport,
        _tmp: tmp,
    }
}

async fn env(script: Vec<Result<TransportResponse, TransportError>>) -> TestEnv {
    env_with_blobs(script, |blobs| blobs).await
}

impl TestEnv {
    async fn configure(&self, pairs: &[(&str, &str)]) {
        for (key, value) in pairs {
            self.settings.set(key, value).await.expect("set");
        }
    }

    /// Upload a fake document and create a one-item batch.
    async fn seed_item(&self, pages: i64) -> (Uuid, Uuid) {
        let key = format!("smart-upload/{}/score.pdf", Uuid::new_v4());
        self.blobs
            .upload(&key, &fake_pdf(pages), "application/pdf")
            .await
            .expect("upload");
        let (batch, items) = self
            .store
            .create_batch(
                "tester",
                &[NewUpload {
                    file_name: "score.pdf".to_owned(),
                    mime_type: "application/pdf".to_owned(),
                    storage_key: key,
                }],
            )
            .await
            .expect("create batch");
        (batch.id, items[0].id)
    }
}

fn single_part_metadata(confidence: f64) -> Value {
    json!({
        "title": "Sonata",
        "composer": "Bach",
        "confidenceScore": confidence,
        "fileType": "PART",
        "isMultiPart": false,
        "cuttingInstructions": [{
            "partName": "Piano",
            "instrument": "Piano",
            "section": "Keyboard",
            "transposition": "C",
            "pageRange": [1, 4]
        }]
    })
}

fn instruction(name: &str, start: i64, end: i64) -> Value {
    json!({
        "partName": name,
        "instrument": name,
        "section": "Winds",
        "transposition": "C",
        "pageRange": [start, end]
    })
}

// ── Scenario 1: happy path, single part, halts for review ───────

#[tokio::test]
async fn test_single_part_below_autonomous_threshold_needs_review() {
    let env = env(vec![llm_json_response(&single_part_metadata(92.0))]).await;
    env.configure(&[
        ("llm_two_pass_enabled", "false"),
        ("llm_autonomous_mode", "true"),
    ])
    .await;
    let (_batch_id, item_id) = env.seed_item(4).await;

    drive(&env.engine, vec![JobPayload::ExtractText { item_id }]).await;

    let item = env.store.get_item(item_id).await.expect("item");
    assert_eq!(item.status, ItemStatus::NeedsReview);
    assert!(item.requires_human_review);
    assert!(!item.auto_approved);
    assert!(!item.is_packet);
    assert_eq!(item.final_confidence, Some(92.0));
    // No second pass and no split for a single-part document.
    assert!(item.second_pass_status.is_none());
    assert!(item.temp_files.is_empty());
    // Exactly one LLM call was made.
    assert_eq!(env.transport.attempts(), 1);
}

/// The overall confidence floor forces review even when the approval
/// thresholds are configured low enough to pass.
#[tokio::test]
async fn test_confidence_floor_overrides_approval_thresholds() {
    let env = env(vec![llm_json_response(&single_part_metadata(92.0))]).await;
    env.configure(&[
        ("llm_two_pass_enabled", "false"),
        ("llm_autonomous_mode", "true"),
        ("llm_auto_approve_threshold", "50"),
        ("llm_autonomous_approval_threshold", "50"),
        ("llm_confidence_threshold", "99"),
    ])
    .await;
    let (_batch_id, item_id) = env.seed_item(4).await;

    drive(&env.engine, vec![JobPayload::ExtractText { item_id }]).await;

    let item = env.store.get_item(item_id).await.expect("item");
    // 92 clears both approval thresholds but sits under the floor.
    assert_eq!(item.status, ItemStatus::NeedsReview);
    assert!(item.requires_human_review);
    assert!(!item.auto_approved);
    assert_eq!(item.current_step, Some(ItemStep::SplitPlanned));
    assert!(item.final_confidence.is_none(), "halted before finalize");
}

// ── Scenario 2: autonomous ingest ───────────────────────────────

#[tokio::test]
async fn test_high_confidence_single_part_ingests_autonomously() {
    let env = env(vec![llm_json_response(&single_part_metadata(97.0))]).await;
    env.configure(&[
        ("llm_two_pass_enabled", "false"),
        ("llm_autonomous_mode", "true"),
    ])
    .await;
    let (batch_id, item_id) = env.seed_item(4).await;

    drive(&env.engine, vec![JobPayload::ExtractText { item_id }]).await;

    let item = env.store.get_item(item_id).await.expect("item");
    assert_eq!(item.status, ItemStatus::Complete);
    assert_eq!(item.current_step, Some(ItemStep::Ingested));
    assert!(item.auto_approved);
    assert!(!item.requires_human_review);
    assert_eq!(item.final_confidence, Some(97.0));
    let parts = item.parsed_parts.expect("synthesized part");
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].part_name, "Piano");

    let batch = env.store.get_batch(batch_id).await.expect("batch");
    assert_eq!(batch.status, BatchStatus::Complete);
    assert_eq!(batch.success_files, 1);

    // One catalog entry carrying the extracted title.
    let entries: Vec<(String, String)> =
        sqlx::query_as("SELECT title, part_name FROM catalog_entries")
            .fetch_all(env.store.pool())
            .await
            .expect("catalog");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "Sonata");
    assert_eq!(entries[0].1, "Piano");
}

// ── Scenario 3: packet split + adjudication ─────────────────────

#[tokio::test]
async fn test_packet_disagreement_triggers_adjudication() {
    let first_pass = json!({
        "title": "March",
        "composer": "Sousa",
        "confidenceScore": 96,
        "segmentationConfidence": 92,
        "fileType": "FULL_SCORE",
        "isMultiPart": true,
        "cuttingInstructions": [
            instruction("Flute", 1, 4),
            instruction("Clarinet", 5, 8),
            instruction("Trumpet", 9, 12),
        ]
    });
    let verification = json!({
        "title": "March",
        "composer": "Sousa",
        "confidenceScore": 90,
        "segmentationConfidence": 80,
        "fileType": "FULL_SCORE",
        "isMultiPart": true,
        "verificationConfidence": 90,
        "cuttingInstructions": [
            instruction("Flute", 1, 4),
            instruction("Clarinet", 5, 7),
            instruction("Horn", 8, 12),
        ]
    });
    let adjudication = json!({
        "adjudicatedMetadata": {
            "title": "March",
            "composer": "Sousa",
            "confidenceScore": 88,
            "segmentationConfidence": 92,
            "fileType": "FULL_SCORE",
            "isMultiPart": true,
            "cuttingInstructions": [
                instruction("Flute", 1, 4),
                instruction("Clarinet", 5, 8),
                instruction("Trumpet", 9, 12),
            ]
        },
        "adjudicationNotes": "Reading A matches the page headers.",
        "finalConfidence": 88,
        "requiresHumanReview": true
    });

    let env = env(vec![
        llm_json_response(&first_pass),
        llm_json_response(&verification),
        llm_json_response(&adjudication),
    ])
    .await;
    env.configure(&[
        ("llm_two_pass_enabled", "true"),
        ("llm_autonomous_mode", "true"),
    ])
    .await;
    let (_batch_id, item_id) = env.seed_item(12).await;

    drive(&env.engine, vec![JobPayload::ExtractText { item_id }]).await;

    let item = env.store.get_item(item_id).await.expect("item");
    assert_eq!(item.status, ItemStatus::NeedsReview);
    assert_eq!(item.second_pass_status, Some(PassStatus::Complete));
    assert_eq!(item.adjudicator_status, Some(PassStatus::Complete));
    assert!(item.requires_human_review);
    assert_eq!(item.final_confidence, Some(88.0));
    assert!(item
        .adjudication_notes
        .as_deref()
        .is_some_and(|n| n.contains("page headers")));

    // All three parts were split and persisted before the disagreement
    // was adjudicated.
    let parts = item.parsed_parts.expect("parts");
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0].part_name, "Flute");
    for part in &parts {
        let bytes = env.blobs.download(&part.storage_key).await.expect("part blob");
        assert!(!bytes.is_empty());
    }
    // Metadata, verification, adjudication: three LLM calls.
    assert_eq!(env.transport.attempts(), 3);
}

// ── Scenario 4: gap fill + coverage gate failure ────────────────

#[tokio::test]
async fn test_uncovered_pages_fail_the_coverage_gate() {
    let metadata = json!({
        "title": "Suite",
        "composer": "Holst",
        "confidenceScore": 96,
        "segmentationConfidence": 85,
        "fileType": "FULL_SCORE",
        "isMultiPart": true,
        "cuttingInstructions": [
            instruction("Flute", 1, 3),
            instruction("Oboe", 7, 10),
        ]
    });
    let env = env(vec![llm_json_response(&metadata)]).await;
    env.configure(&[
        ("llm_two_pass_enabled", "false"),
        ("llm_autonomous_mode", "true"),
    ])
    .await;
    let (_batch_id, item_id) = env.seed_item(10).await;

    drive(&env.engine, vec![JobPayload::ExtractText { item_id }]).await;

    let item = env.store.get_item(item_id).await.expect("item");
    assert_eq!(item.status, ItemStatus::NeedsReview);
    assert!(item.requires_human_review);
    // Coverage 7/10 < 95% fails the gate, capping the confidence to 0.
    assert_eq!(item.final_confidence, Some(0.0));

    let instructions = item.cutting_instructions.expect("instructions");
    assert!(
        instructions
            .iter()
            .any(|i| i.part_name == "Uncovered pages 4-6"),
        "gap fill instruction missing: {instructions:?}"
    );
}

// ── Scenario 6: cancellation during split ───────────────────────

/// Blob store that fires a batch cancellation once `cancel_after`
/// part uploads have landed.
struct CancellingBlobStore {
    inner: Arc<dyn BlobStore>,
    part_uploads: AtomicUsize,
    cancel_after: usize,
    armed: Mutex<Option<(Arc<CancelRegistry>, Uuid)>>,
}

#[async_trait]
impl BlobStore for CancellingBlobStore {
    async fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.inner.upload(key, bytes, content_type).await?;
        if key.contains("/parts/") {
            let count = self.part_uploads.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            if count == self.cancel_after {
                if let Some((registry, batch_id)) = self.armed.lock().expect("lock").as_ref() {
                    registry.cancel(*batch_id);
                }
            }
        }
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.download(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_cancellation_mid_split_cleans_up_uploaded_parts() {
    let metadata = json!({
        "title": "Symphony",
        "composer": "Dvorak",
        "confidenceScore": 96,
        "segmentationConfidence": 90,
        "fileType": "FULL_SCORE",
        "isMultiPart": true,
        "cuttingInstructions": [
            instruction("Flute", 1, 4),
            instruction("Oboe", 5, 8),
            instruction("Clarinet", 9, 12),
            instruction("Bassoon", 13, 16),
            instruction("Horn", 17, 20),
        ]
    });

    let slot: Arc<Mutex<Option<Arc<CancellingBlobStore>>>> = Arc::new(Mutex::new(None));
    let slot_for_env = Arc::clone(&slot);
    let env = env_with_blobs(vec![llm_json_response(&metadata)], move |inner| {
        let wrapped = Arc::new(CancellingBlobStore {
            inner,
            part_uploads: AtomicUsize::new(0),
            cancel_after: 2,
            armed: Mutex::new(None),
        });
        *slot_for_env.lock().expect("lock") = Some(Arc::clone(&wrapped));
        wrapped
    })
    .await;
    let cancelling = slot
        .lock()
        .expect("lock")
        .take()
        .expect("wrapper installed");
    env.configure(&[
        ("llm_two_pass_enabled", "true"),
        ("llm_autonomous_mode", "true"),
    ])
    .await;
    let (batch_id, item_id) = env.seed_item(20).await;
    *cancelling.armed.lock().expect("lock") = Some((env.engine.cancels(), batch_id));

    drive(&env.engine, vec![JobPayload::ExtractText { item_id }]).await;

    let item = env.store.get_item(item_id).await.expect("item");
    assert_eq!(item.status, ItemStatus::Cancelled);
    assert!(item.current_step.is_none(), "cleanup clears the step");
    assert!(item.parsed_parts.is_none(), "no parts were committed");

    // Both uploaded part blobs were recorded as temp files and deleted.
    assert_eq!(item.temp_files.len(), 2);
    for key in &item.temp_files {
        assert!(
            matches!(
                env.blobs.download(key).await,
                Err(StorageError::NotFound(_))
            ),
            "blob {key} should have been deleted"
        );
    }

    let batch = env.store.get_batch(batch_id).await.expect("batch");
    assert_eq!(batch.status, BatchStatus::Cancelled);
}

// ── Replay idempotence ──────────────────────────────────────────

#[tokio::test]
async fn test_replaying_stages_does_not_change_the_final_row() {
    let env = env(vec![llm_json_response(&single_part_metadata(92.0))]).await;
    env.configure(&[
        ("llm_two_pass_enabled", "false"),
        ("llm_autonomous_mode", "true"),
    ])
    .await;
    let (_batch_id, item_id) = env.seed_item(4).await;

    drive(&env.engine, vec![JobPayload::ExtractText { item_id }]).await;
    let first = env.store.get_item(item_id).await.expect("item");

    // At-least-once delivery: replay earlier stages; every handler must
    // observe the advanced state and no-op (the transport script is
    // exhausted, so any stray LLM call would fail the run loudly).
    drive(
        &env.engine,
        vec![
            JobPayload::ExtractText { item_id },
            JobPayload::Finalize { item_id },
        ],
    )
    .await;

    let second = env.store.get_item(item_id).await.expect("item");
    assert_eq!(second.status, first.status);
    assert_eq!(second.current_step, first.current_step);
    assert_eq!(second.final_confidence, first.final_confidence);
    assert_eq!(second.ocr_text, first.ocr_text);
    assert_eq!(second.cutting_instructions, first.cutting_instructions);
    assert_eq!(env.transport.attempts(), 1, "no extra LLM calls on replay");
}

// ── Failure path: empty document ────────────────────────────────

#[tokio::test]
async fn test_failed_extraction_marks_item_and_batch_failed() {
    // The blob is missing entirely: extraction fails, retries exhaust,
    // and the failure branch (mark failed + cleanup) runs.
    let env = env(vec![]).await;
    let (batch_id, items) = {
        let (batch, items) = env
            .store
            .create_batch(
                "tester",
                &[NewUpload {
                    file_name: "ghost.pdf".to_owned(),
                    mime_type: "application/pdf".to_owned(),
                    storage_key: "smart-upload/none/ghost.pdf".to_owned(),
                }],
            )
            .await
            .expect("create");
        (batch.id, items)
    };

    drive(
        &env.engine,
        vec![JobPayload::ExtractText {
            item_id: items[0].id,
        }],
    )
    .await;

    let item = env.store.get_item(items[0].id).await.expect("item");
    assert_eq!(item.status, ItemStatus::Failed);
    assert!(item
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("blob missing")));

    let batch = env.store.get_batch(batch_id).await.expect("batch");
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch
        .error_summary
        .as_deref()
        .is_some_and(|s| s.contains("ghost.pdf")));
}
