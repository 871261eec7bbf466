//! Batch and item persistence with transactional stage transitions.
//!
//! Every stage commit runs in its own transaction and checks the expected
//! prior state first; a retry that finds the state already advanced
//! returns `Ok(false)` and writes nothing. Batch counters and status are
//! recomputed inside the same transaction as the item change, so readers
//! never observe counters that disagree with item rows.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, Transaction};
use uuid::Uuid;

use crate::types::{
    AssignmentRecord, Batch, BatchStatus, CuttingInstruction, ExtractedMetadata, ItemStatus,
    ItemStep, ParsedPart, PassStatus, UploadItem,
};

use super::StoreError;

/// Input for one uploaded file when creating a batch.
#[derive(Debug, Clone)]
pub struct NewUpload {
    /// Original file name.
    pub file_name: String,
    /// MIME type as uploaded.
    pub mime_type: String,
    /// Blob-store key the original was uploaded under.
    pub storage_key: String,
}

/// A catalog row committed by the ingest stage.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Entry UUID.
    pub id: Uuid,
    /// Source upload item.
    pub item_id: Uuid,
    /// Work title.
    pub title: String,
    /// Composer.
    pub composer: String,
    /// Part label.
    pub part_name: String,
    /// Instrument.
    pub instrument: String,
    /// Blob key of the part PDF.
    pub storage_key: String,
    /// Page count of the part PDF.
    pub page_count: i64,
}

/// Batch/item persistence.
#[derive(Debug, Clone)]
pub struct BatchStore {
    pool: SqlitePool,
}

/// Item statuses counted as "done processing" for batch roll-ups.
const PROCESSED_STATUSES: &str = "'NEEDS_REVIEW','COMPLETE','FAILED','CANCELLED'";

impl BatchStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Creation & reads ────────────────────────────────────────

    /// Create a batch plus one item per upload, all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn create_batch(
        &self,
        user_id: &str,
        uploads: &[NewUpload],
    ) -> Result<(Batch, Vec<UploadItem>), StoreError> {
        let now = Utc::now();
        let batch_id = Uuid::new_v4();
        let total = i64::try_from(uploads.len()).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO batches (id, user_id, status, total_files, processed_files, \
             success_files, failed_files, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 0, 0, 0, ?5, ?5)",
        )
        .bind(batch_id.to_string())
        .bind(user_id)
        .bind(BatchStatus::Created.to_string())
        .bind(total)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let mut items = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let item_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO upload_items (id, batch_id, file_name, mime_type, storage_key, \
                 status, temp_files, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', ?7, ?7)",
            )
            .bind(item_id.to_string())
            .bind(batch_id.to_string())
            .bind(&upload.file_name)
            .bind(&upload.mime_type)
            .bind(&upload.storage_key)
            .bind(ItemStatus::Created.to_string())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            items.push(UploadItem {
                id: item_id,
                batch_id,
                file_name: upload.file_name.clone(),
                mime_type: upload.mime_type.clone(),
                storage_key: upload.storage_key.clone(),
                status: ItemStatus::Created,
                current_step: None,
                ocr_text: None,
                extracted_metadata: None,
                cutting_instructions: None,
                parsed_parts: None,
                second_pass_metadata: None,
                second_pass_status: None,
                adjudicator_status: None,
                adjudication_notes: None,
                final_confidence: None,
                auto_approved: false,
                requires_human_review: false,
                is_packet: false,
                error_message: None,
                error_details: None,
                temp_files: Vec::new(),
                created_at: now,
                updated_at: now,
            });
        }
        tx.commit().await?;

        Ok((
            Batch {
                id: batch_id,
                user_id: user_id.to_owned(),
                status: BatchStatus::Created,
                total_files: total,
                processed_files: 0,
                success_files: 0,
                failed_files: 0,
                error_summary: None,
                created_at: now,
                updated_at: now,
            },
            items,
        ))
    }

    /// Load a batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BatchNotFound`] when no row matches.
    pub async fn get_batch(&self, id: Uuid) -> Result<Batch, StoreError> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::BatchNotFound(id))?;
        batch_from_row(&row)
    }

    /// Load an item.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ItemNotFound`] when no row matches.
    pub async fn get_item(&self, id: Uuid) -> Result<UploadItem, StoreError> {
        let row = sqlx::query("SELECT * FROM upload_items WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ItemNotFound(id))?;
        item_from_row(&row)
    }

    /// Load all items in a batch, creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn items_for_batch(&self, batch_id: Uuid) -> Result<Vec<UploadItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM upload_items WHERE batch_id = ?1 ORDER BY created_at, id",
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    // ── Stage commits (idempotent) ──────────────────────────────

    /// Persist extracted text: `CREATED -> PROCESSING(TEXT_EXTRACTED)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn commit_text_extracted(
        &self,
        item_id: Uuid,
        ocr_text: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((_, step)) = item_state(&mut tx, item_id).await? else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if step.is_some() {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET ocr_text = ?2, status = ?3, current_step = ?4, \
             updated_at = ?5 WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(ocr_text)
        .bind(ItemStatus::Processing.to_string())
        .bind(ItemStep::TextExtracted.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        mark_batch_processing(&mut tx, item_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Persist first-pass metadata:
    /// `PROCESSING(TEXT_EXTRACTED) -> PROCESSING(METADATA_EXTRACTED)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn commit_metadata_extracted(
        &self,
        item_id: Uuid,
        metadata: &ExtractedMetadata,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((_, step)) = item_state(&mut tx, item_id).await? else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if step != Some(ItemStep::TextExtracted) {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET extracted_metadata = ?2, current_step = ?3, \
             updated_at = ?4 WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(serde_json::to_string(metadata)?)
        .bind(ItemStep::MetadataExtracted.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Persist the split plan:
    /// `PROCESSING(METADATA_EXTRACTED) -> {status}(SPLIT_PLANNED)`.
    ///
    /// `status` is `NeedsReview` for the human path or `Approved` when the
    /// plan was auto-approved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn commit_split_plan(
        &self,
        item_id: Uuid,
        instructions: &[CuttingInstruction],
        is_packet: bool,
        status: ItemStatus,
        requires_review: bool,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((_, step)) = item_state(&mut tx, item_id).await? else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if step != Some(ItemStep::MetadataExtracted) {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET cutting_instructions = ?2, is_packet = ?3, status = ?4, \
             current_step = ?5, requires_human_review = ?6, updated_at = ?7 WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(serde_json::to_string(instructions)?)
        .bind(i64::from(is_packet))
        .bind(status.to_string())
        .bind(ItemStep::SplitPlanned.to_string())
        .bind(i64::from(requires_review))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        recompute_batch(&mut tx, item_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Persist split outputs:
    /// `APPROVED(SPLIT_PLANNED) -> PROCESSING(SPLIT_COMPLETE)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn commit_split_complete(
        &self,
        item_id: Uuid,
        parts: &[ParsedPart],
        temp_files: &[String],
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((status, step)) = item_state(&mut tx, item_id).await? else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if step != Some(ItemStep::SplitPlanned) || status != ItemStatus::Approved {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET parsed_parts = ?2, temp_files = ?3, status = ?4, \
             current_step = ?5, updated_at = ?6 WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(serde_json::to_string(parts)?)
        .bind(serde_json::to_string(temp_files)?)
        .bind(ItemStatus::Processing.to_string())
        .bind(ItemStep::SplitComplete.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        recompute_batch(&mut tx, item_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Set the second-pass status marker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn set_second_pass_status(
        &self,
        item_id: Uuid,
        status: PassStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_items SET second_pass_status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(item_id.to_string())
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the second-pass result. No-ops unless the pass is still
    /// `QUEUED`/`IN_PROGRESS`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn commit_second_pass(
        &self,
        item_id: Uuid,
        metadata: &ExtractedMetadata,
        outcome: PassStatus,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(Option<String>,)> =
            sqlx::query_as("SELECT second_pass_status FROM upload_items WHERE id = ?1")
                .bind(item_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((pass_status,)) = current else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        match pass_status.as_deref() {
            Some("QUEUED" | "IN_PROGRESS") => {}
            _ => return Ok(false),
        }
        sqlx::query(
            "UPDATE upload_items SET second_pass_metadata = ?2, second_pass_status = ?3, \
             updated_at = ?4 WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(serde_json::to_string(metadata)?)
        .bind(outcome.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Set the adjudicator status marker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn set_adjudicator_status(
        &self,
        item_id: Uuid,
        status: PassStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE upload_items SET adjudicator_status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(item_id.to_string())
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the adjudicated metadata as authoritative, along with the
    /// re-validated (zero-indexed) cutting plan and the adjudicator's
    /// notes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn commit_adjudication(
        &self,
        item_id: Uuid,
        metadata: &ExtractedMetadata,
        instructions: &[CuttingInstruction],
        notes: Option<&str>,
        requires_review: bool,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(Option<String>,)> =
            sqlx::query_as("SELECT adjudicator_status FROM upload_items WHERE id = ?1")
                .bind(item_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((adjudicator_status,)) = current else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if adjudicator_status.as_deref() == Some("COMPLETE") {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET extracted_metadata = ?2, cutting_instructions = ?3, \
             adjudication_notes = ?4, adjudicator_status = ?5, \
             requires_human_review = MAX(requires_human_review, ?6), updated_at = ?7 \
             WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(serde_json::to_string(metadata)?)
        .bind(serde_json::to_string(instructions)?)
        .bind(notes)
        .bind(PassStatus::Complete.to_string())
        .bind(i64::from(requires_review))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Persist finalize results: validated plan, synthesized parts (for
    /// unsplit single-part items), final confidence, review flags, and
    /// the resulting status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit_finalize(
        &self,
        item_id: Uuid,
        instructions: &[CuttingInstruction],
        parsed_parts: Option<&[ParsedPart]>,
        final_confidence: f64,
        requires_review: bool,
        auto_approved: bool,
        status: ItemStatus,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((current_status, _)) = item_state(&mut tx, item_id).await? else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if matches!(
            current_status,
            ItemStatus::Complete | ItemStatus::Failed | ItemStatus::Cancelled
        ) {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET cutting_instructions = ?2, \
             parsed_parts = COALESCE(?3, parsed_parts), final_confidence = ?4, \
             requires_human_review = ?5, auto_approved = ?6, status = ?7, updated_at = ?8 \
             WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(serde_json::to_string(instructions)?)
        .bind(parsed_parts.map(serde_json::to_string).transpose()?)
        .bind(final_confidence)
        .bind(i64::from(requires_review))
        .bind(i64::from(auto_approved))
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        recompute_batch(&mut tx, item_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Append blob keys to an item's temp-file list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn append_temp_files(
        &self,
        item_id: Uuid,
        keys: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT temp_files FROM upload_items WHERE id = ?1")
                .bind(item_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((raw,)) = current else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        let mut files: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
        for key in keys {
            if !files.contains(key) {
                files.push(key.clone());
            }
        }
        sqlx::query("UPDATE upload_items SET temp_files = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(item_id.to_string())
            .bind(serde_json::to_string(&files)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a non-terminal attempt error without changing status, so
    /// operators can see what the queue is retrying.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn set_item_error(
        &self,
        item_id: Uuid,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE upload_items SET error_message = ?2, error_details = ?3, updated_at = ?4 \
             WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(message)
        .bind(details.map(serde_json::Value::to_string))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a terminal failure on the item and roll the batch up, in one
    /// transaction. Idempotent: a second call on a terminal item no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn mark_item_failed(
        &self,
        item_id: Uuid,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((status, _)) = item_state(&mut tx, item_id).await? else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if matches!(
            status,
            ItemStatus::Complete | ItemStatus::Failed | ItemStatus::Cancelled
        ) {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET status = ?2, error_message = ?3, error_details = ?4, \
             updated_at = ?5 WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(ItemStatus::Failed.to_string())
        .bind(message)
        .bind(details.map(serde_json::Value::to_string))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        recompute_batch(&mut tx, item_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Mark an item cancelled after cleanup ran, clearing `current_step`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn mark_item_cancelled(&self, item_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((status, _)) = item_state(&mut tx, item_id).await? else {
            return Err(StoreError::ItemNotFound(item_id));
        };
        if matches!(status, ItemStatus::Complete | ItemStatus::Cancelled) {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE upload_items SET status = ?2, current_step = NULL, updated_at = ?3 \
             WHERE id = ?1",
        )
        .bind(item_id.to_string())
        .bind(ItemStatus::Cancelled.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        recompute_batch(&mut tx, item_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Mark a whole batch cancelled (items are cleaned up individually).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn mark_batch_cancelled(&self, batch_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE batches SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(batch_id.to_string())
            .bind(BatchStatus::Cancelled.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Commit catalog entries for a batch in a single transaction.
    ///
    /// Inserts every entry, advances each referenced item to
    /// `COMPLETE(INGESTED)`, and rolls the batch up. Any failure rolls the
    /// whole write back — a failed batch is never partially committed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure (after rollback).
    pub async fn ingest_batch(
        &self,
        batch_id: Uuid,
        entries: &[CatalogEntry],
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut item_ids: Vec<Uuid> = Vec::new();
        for entry in entries {
            sqlx::query(
                "INSERT INTO catalog_entries (id, item_id, title, composer, part_name, \
                 instrument, storage_key, page_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(entry.id.to_string())
            .bind(entry.item_id.to_string())
            .bind(&entry.title)
            .bind(&entry.composer)
            .bind(&entry.part_name)
            .bind(&entry.instrument)
            .bind(&entry.storage_key)
            .bind(entry.page_count)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            if !item_ids.contains(&entry.item_id) {
                item_ids.push(entry.item_id);
            }
        }

        for item_id in &item_ids {
            sqlx::query(
                "UPDATE upload_items SET status = ?2, current_step = ?3, updated_at = ?4 \
                 WHERE id = ?1",
            )
            .bind(item_id.to_string())
            .bind(ItemStatus::Complete.to_string())
            .bind(ItemStep::Ingested.to_string())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            record_assignment_tx(
                &mut tx,
                &AssignmentRecord {
                    assignment_id: *item_id,
                    action: "INGESTED".to_owned(),
                    from_status: Some(ItemStatus::Approved.to_string()),
                    to_status: ItemStatus::Complete.to_string(),
                    notes: None,
                    performed_by: "pipeline".to_owned(),
                    performed_at: now,
                },
            )
            .await?;
        }

        recompute_batch_by_id(&mut tx, batch_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append an audit record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn record_assignment(&self, record: &AssignmentRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        record_assignment_tx(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Audit records for an item, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn assignment_history(
        &self,
        assignment_id: Uuid,
    ) -> Result<Vec<AssignmentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT assignment_id, action, from_status, to_status, notes, performed_by, \
             performed_at FROM assignment_history WHERE assignment_id = ?1 ORDER BY id",
        )
        .bind(assignment_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(AssignmentRecord {
                    assignment_id: parse_uuid(&row.try_get::<String, _>("assignment_id")?)?,
                    action: row.try_get("action")?,
                    from_status: row.try_get("from_status")?,
                    to_status: row.try_get("to_status")?,
                    notes: row.try_get("notes")?,
                    performed_by: row.try_get("performed_by")?,
                    performed_at: parse_timestamp(&row.try_get::<String, _>("performed_at")?)?,
                })
            })
            .collect()
    }

    /// Items still in `CREATED` — uploaded (possibly by another process)
    /// but never enqueued. The scheduler tick picks these up.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn unstarted_items(&self) -> Result<Vec<UploadItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM upload_items WHERE status = 'CREATED' ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Items whose second pass has been `QUEUED`/`IN_PROGRESS` since
    /// before `cutoff` — dead jobs the reaper should requeue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn stale_second_pass_items(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UploadItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM upload_items \
             WHERE second_pass_status IN ('QUEUED', 'IN_PROGRESS') AND updated_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }
}

// ── Transaction helpers ─────────────────────────────────────────

/// Read `(status, current_step)` for an item inside a transaction.
async fn item_state(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    item_id: Uuid,
) -> Result<Option<(ItemStatus, Option<ItemStep>)>, StoreError> {
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT status, current_step FROM upload_items WHERE id = ?1")
            .bind(item_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
    let Some((status, step)) = row else {
        return Ok(None);
    };
    let status = status
        .parse::<ItemStatus>()
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    let step = step
        .map(|s| s.parse::<ItemStep>())
        .transpose()
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    Ok(Some((status, step)))
}

/// Move the owning batch from `CREATED` to `PROCESSING` once the first
/// item starts moving.
async fn mark_batch_processing(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    item_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE batches SET status = ?1, updated_at = ?2 \
         WHERE id = (SELECT batch_id FROM upload_items WHERE id = ?3) AND status = ?4",
    )
    .bind(BatchStatus::Processing.to_string())
    .bind(Utc::now().to_rfc3339())
    .bind(item_id.to_string())
    .bind(BatchStatus::Created.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Recompute batch counters, status, and error summary from item rows.
async fn recompute_batch(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    item_id: Uuid,
) -> Result<(), StoreError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT batch_id FROM upload_items WHERE id = ?1")
            .bind(item_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
    let Some((batch_id,)) = row else {
        return Ok(());
    };
    let batch_id = parse_uuid(&batch_id)?;
    recompute_batch_by_id(tx, batch_id).await
}

async fn recompute_batch_by_id(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    batch_id: Uuid,
) -> Result<(), StoreError> {
    let current: Option<(String, i64)> =
        sqlx::query_as("SELECT status, total_files FROM batches WHERE id = ?1")
            .bind(batch_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
    let Some((status, total_files)) = current else {
        return Ok(());
    };
    // A cancelled batch stays cancelled regardless of stragglers.
    if status == BatchStatus::Cancelled.to_string() {
        return Ok(());
    }

    let (processed, success, failed, cancelled): (i64, i64, i64, i64) = sqlx::query_as(&format!(
        "SELECT \
         COALESCE(SUM(CASE WHEN status IN ({PROCESSED_STATUSES}) THEN 1 ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN status = 'COMPLETE' THEN 1 ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN status = 'CANCELLED' THEN 1 ELSE 0 END), 0) \
         FROM upload_items WHERE batch_id = ?1"
    ))
    .bind(batch_id.to_string())
    .fetch_one(&mut **tx)
    .await?;

    let new_status = if processed < total_files {
        BatchStatus::Processing
    } else if cancelled == total_files {
        BatchStatus::Cancelled
    } else if failed > 0 {
        BatchStatus::Failed
    } else if success == total_files {
        BatchStatus::Complete
    } else {
        BatchStatus::NeedsReview
    };

    let error_summary: Option<String> = if failed > 0 {
        let failures: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT file_name, error_message FROM upload_items \
             WHERE batch_id = ?1 AND status = 'FAILED' ORDER BY created_at, id",
        )
        .bind(batch_id.to_string())
        .fetch_all(&mut **tx)
        .await?;
        Some(
            failures
                .into_iter()
                .map(|(name, message)| {
                    format!("{name}: {}", message.unwrap_or_else(|| "unknown error".to_owned()))
                })
                .collect::<Vec<_>>()
                .join("; "),
        )
    } else {
        None
    };

    sqlx::query(
        "UPDATE batches SET processed_files = ?2, success_files = ?3, failed_files = ?4, \
         status = ?5, error_summary = ?6, updated_at = ?7 WHERE id = ?1",
    )
    .bind(batch_id.to_string())
    .bind(processed)
    .bind(success)
    .bind(failed)
    .bind(new_status.to_string())
    .bind(error_summary)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn record_assignment_tx(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    record: &AssignmentRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO assignment_history (assignment_id, action, from_status, to_status, \
         notes, performed_by, performed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(record.assignment_id.to_string())
    .bind(&record.action)
    .bind(&record.from_status)
    .bind(&record.to_status)
    .bind(&record.notes)
    .bind(&record.performed_by)
    .bind(record.performed_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ── Row mapping ─────────────────────────────────────────────────

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::InvalidRow(format!("bad uuid {raw:?}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
) -> Result<Option<T>, StoreError> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StoreError::from)
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch, StoreError> {
    Ok(Batch {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        user_id: row.try_get("user_id")?,
        status: row
            .try_get::<String, _>("status")?
            .parse()
            .map_err(|e: anyhow::Error| StoreError::InvalidRow(e.to_string()))?,
        total_files: row.try_get("total_files")?,
        processed_files: row.try_get("processed_files")?,
        success_files: row.try_get("success_files")?,
        failed_files: row.try_get("failed_files")?,
        error_summary: row.try_get("error_summary")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<UploadItem, StoreError> {
    let parse_status = |raw: String| {
        raw.parse::<ItemStatus>()
            .map_err(|e| StoreError::InvalidRow(e.to_string()))
    };
    let parse_pass = |raw: Option<String>| {
        raw.map(|s| s.parse::<PassStatus>())
            .transpose()
            .map_err(|e| StoreError::InvalidRow(e.to_string()))
    };

    Ok(UploadItem {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        batch_id: parse_uuid(&row.try_get::<String, _>("batch_id")?)?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        storage_key: row.try_get("storage_key")?,
        status: parse_status(row.try_get("status")?)?,
        current_step: row
            .try_get::<Option<String>, _>("current_step")?
            .map(|s| s.parse::<ItemStep>())
            .transpose()
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?,
        ocr_text: row.try_get("ocr_text")?,
        extracted_metadata: parse_json_column(row.try_get("extracted_metadata")?)?,
        cutting_instructions: parse_json_column(row.try_get("cutting_instructions")?)?,
        parsed_parts: parse_json_column(row.try_get("parsed_parts")?)?,
        second_pass_metadata: parse_json_column(row.try_get("second_pass_metadata")?)?,
        second_pass_status: parse_pass(row.try_get("second_pass_status")?)?,
        adjudicator_status: parse_pass(row.try_get("adjudicator_status")?)?,
        adjudication_notes: row.try_get("adjudication_notes")?,
        final_confidence: row.try_get("final_confidence")?,
        auto_approved: row.try_get::<i64, _>("auto_approved")? != 0,
        requires_human_review: row.try_get::<i64, _>("requires_human_review")? != 0,
        is_packet: row.try_get::<i64, _>("is_packet")? != 0,
        error_message: row.try_get("error_message")?,
        error_details: parse_json_column(row.try_get("error_details")?)?,
        temp_files: serde_json::from_str(&row.try_get::<String, _>("temp_files")?)
            .unwrap_or_default(),
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}
