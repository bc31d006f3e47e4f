//! Upload record persistence

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::upload::types::{UploadForm, UploadMetadata, UploadRecord, UploadTier};

/// Durable store of in-progress upload records, keyed by (attachment, tier)
#[async_trait]
pub trait UploadRecordStore: Send + Sync {
    async fn fetch(&self, attachment_id: &str, tier: UploadTier) -> Result<Option<UploadRecord>>;

    /// Insert or replace the record for its key; returns the row id
    async fn upsert(&self, record: &UploadRecord) -> Result<i64>;

    /// Returns whether a record was deleted
    async fn remove(&self, attachment_id: &str, tier: UploadTier) -> Result<bool>;

    async fn list(&self) -> Result<Vec<UploadRecord>>;

    /// Delete records at or past `max_attempts`; returns how many
    async fn remove_exhausted(&self, max_attempts: u32) -> Result<u64>;
}

/// Raw row
#[derive(Debug, sqlx::FromRow)]
struct UploadRecordRow {
    id: i64,
    tier: String,
    attachment_id: String,
    upload_form: Option<String>,
    upload_form_timestamp_ms: Option<i64>,
    local_metadata: Option<String>,
    session_url: Option<String>,
    attempt: i64,
}

impl UploadRecordRow {
    fn into_record(self) -> Result<UploadRecord> {
        let upload_form = self
            .upload_form
            .as_deref()
            .map(serde_json::from_str::<UploadForm>)
            .transpose()?;
        let local_metadata = self
            .local_metadata
            .as_deref()
            .map(serde_json::from_str::<UploadMetadata>)
            .transpose()?;

        Ok(UploadRecord {
            id: Some(self.id),
            attachment_id: self.attachment_id,
            tier: self.tier.parse()?,
            upload_form,
            upload_form_timestamp_ms: self.upload_form_timestamp_ms.map(|ts| ts.max(0) as u64),
            local_metadata,
            session_url: self.session_url,
            attempt: self.attempt.clamp(0, u32::MAX as i64) as u32,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, tier, attachment_id, upload_form, upload_form_timestamp_ms,
           local_metadata, session_url, attempt
    FROM attachment_upload_records
"#;

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteUploadRecordStore {
    pool: SqlitePool,
}

impl SqliteUploadRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UploadRecordStore for SqliteUploadRecordStore {
    async fn fetch(&self, attachment_id: &str, tier: UploadTier) -> Result<Option<UploadRecord>> {
        let row = sqlx::query_as::<_, UploadRecordRow>(&format!(
            "{} WHERE attachment_id = ? AND tier = ?",
            SELECT_COLUMNS
        ))
        .bind(attachment_id)
        .bind(tier.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(UploadRecordRow::into_record).transpose()
    }

    async fn upsert(&self, record: &UploadRecord) -> Result<i64> {
        let upload_form = record
            .upload_form
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let local_metadata = record
            .local_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO attachment_upload_records
                (tier, attachment_id, upload_form, upload_form_timestamp_ms,
                 local_metadata, session_url, attempt)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(attachment_id, tier) DO UPDATE SET
                upload_form = excluded.upload_form,
                upload_form_timestamp_ms = excluded.upload_form_timestamp_ms,
                local_metadata = excluded.local_metadata,
                session_url = excluded.session_url,
                attempt = excluded.attempt,
                updated_at = datetime('now')
            RETURNING id
            "#,
        )
        .bind(record.tier.as_str())
        .bind(&record.attachment_id)
        .bind(upload_form)
        .bind(record.upload_form_timestamp_ms.map(|ts| ts as i64))
        .bind(local_metadata)
        .bind(&record.session_url)
        .bind(record.attempt as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn remove(&self, attachment_id: &str, tier: UploadTier) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM attachment_upload_records WHERE attachment_id = ? AND tier = ?",
        )
        .bind(attachment_id)
        .bind(tier.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRecordRow>(&format!(
            "{} ORDER BY updated_at DESC, id DESC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UploadRecordRow::into_record).collect()
    }

    async fn remove_exhausted(&self, max_attempts: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM attachment_upload_records WHERE attempt >= ?")
            .bind(max_attempts as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Tests
// ============================================================================
