//! Upload coordinator
//!
//! Entry point for uploading an attachment to one of three tiers:
//!
//! - transit: the CDN messages point at
//! - media: long-term backup storage, filled by server-side copy from transit
//! - thumbnail: a small JPEG rendition, also copied into the media tier
//!
//! For each (attachment, tier) the manager deduplicates concurrent callers,
//! decides which encrypted blob and form to use, persists the resume record
//! before any bytes are sent, and reconciles attachment state afterwards.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::active::{ActiveUploads, UploadRole};
use super::copy::{self, CopyRequest, CopySource, MediaCopyClient};
use super::endpoint::UploadEndpoint;
use super::forms::FormProvider;
use super::metadata::MetadataBuilder;
use super::runner::{AttemptRunner, RunnerConfig};
use super::thumbnail::THUMBNAIL_MAX_DIMENSION;
use super::types::{
    MediaTierAuth, UploadAttempt, UploadMetadata, UploadRecord, UploadResult, UploadTier,
};
use crate::attachment::{
    Attachment, AttachmentStore, MediaTierInfo, StreamInfo, TransitTierInfo, TransitUploadStrategy,
};
use crate::clock::{Clock, Sleeper};
use crate::config::UploadConfig;
use crate::crypto::EncryptionProvider;
use crate::db::UploadRecordStore;
use crate::error::{Result, UploadError};
use crate::net::{NetworkClient, ProgressSink};
use crate::storage::FileSystem;

/// Collaborators the manager is built from
pub struct UploadManagerDeps {
    pub net: Arc<dyn NetworkClient>,
    pub fs: Arc<dyn FileSystem>,
    pub encryption: Arc<dyn EncryptionProvider>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub records: Arc<dyn UploadRecordStore>,
    pub forms: Arc<dyn FormProvider>,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    /// Chat service base URL, for the media copy endpoint
    pub service_base_url: String,
}

/// Cheap to clone; clones share the active-upload map
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: UploadConfig,
    net: Arc<dyn NetworkClient>,
    fs: Arc<dyn FileSystem>,
    attachments: Arc<dyn AttachmentStore>,
    records: Arc<dyn UploadRecordStore>,
    forms: Arc<dyn FormProvider>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    metadata: MetadataBuilder,
    copier: MediaCopyClient,
    runner: AttemptRunner,
    active: ActiveUploads,
}

#[derive(Debug, Clone)]
struct UploadJob {
    attachment_id: String,
    tier: UploadTier,
    auth: Option<MediaTierAuth>,
}

impl UploadJob {
    fn auth(&self) -> Result<&MediaTierAuth> {
        self.auth
            .as_ref()
            .ok_or_else(|| UploadError::NotUploadable(format!("{} upload needs media credentials", self.tier)))
    }
}

impl UploadManager {
    pub fn new(deps: UploadManagerDeps, config: UploadConfig) -> Self {
        let runner = AttemptRunner::new(deps.sleeper.clone(), RunnerConfig::from(&config));
        let metadata = MetadataBuilder::new(deps.fs.clone(), deps.encryption);
        let copier = MediaCopyClient::new(deps.net.clone(), deps.service_base_url);

        Self {
            inner: Arc::new(Inner {
                config,
                net: deps.net,
                fs: deps.fs,
                attachments: deps.attachments,
                records: deps.records,
                forms: deps.forms,
                clock: deps.clock,
                sleeper: deps.sleeper,
                metadata,
                copier,
                runner,
                active: ActiveUploads::new(),
            }),
        }
    }

    /// Upload to the transit CDN, reusing a recent upload when possible
    pub async fn upload_transit_tier_attachment(
        &self,
        attachment_id: &str,
        progress: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<UploadResult> {
        let job = UploadJob {
            attachment_id: attachment_id.to_string(),
            tier: UploadTier::Transit,
            auth: None,
        };
        self.upload(job, progress, cancel).await
    }

    /// Upload (or reuse a transit upload) and copy into the media tier
    pub async fn upload_media_tier_attachment(
        &self,
        attachment_id: &str,
        auth: MediaTierAuth,
        progress: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<UploadResult> {
        let job = UploadJob {
            attachment_id: attachment_id.to_string(),
            tier: UploadTier::Media,
            auth: Some(auth),
        };
        self.upload(job, progress, cancel).await
    }

    /// Render, upload and copy the attachment's thumbnail into the media tier
    pub async fn upload_media_tier_thumbnail(
        &self,
        attachment_id: &str,
        auth: MediaTierAuth,
        progress: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<UploadResult> {
        let job = UploadJob {
            attachment_id: attachment_id.to_string(),
            tier: UploadTier::Thumbnail,
            auth: Some(auth),
        };
        self.upload(job, progress, cancel).await
    }

    pub fn is_uploading(&self, attachment_id: &str, tier: UploadTier) -> bool {
        self.inner.active.is_active(attachment_id, tier)
    }

    // ========================================================================
    // Deduplication
    // ========================================================================

    async fn upload(&self, job: UploadJob, progress: Option<ProgressSink>, cancel: CancellationToken) -> Result<UploadResult> {
        let mut reissues = 0;

        loop {
            match self.inner.active.register(&job.attachment_id, job.tier) {
                UploadRole::Uploader(guard) => {
                    let manager = self.clone();
                    let job = job.clone();
                    let progress = progress.clone();
                    let cancel = cancel.clone();

                    // Runs to completion for the waiters even if this caller goes away
                    let handle = tokio::spawn(async move {
                        let result = manager.upload_with_record(&job, progress, &cancel).await;
                        guard.complete(&result);
                        result
                    });

                    return handle
                        .await
                        .map_err(|e| UploadError::Unknown(format!("Upload task failed: {}", e)))?;
                }
                UploadRole::Waiter(mut rx) => {
                    tracing::debug!(
                        attachment_id = %job.attachment_id,
                        tier = %job.tier,
                        "Joining in-flight upload"
                    );

                    let received = tokio::select! {
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        received = rx.recv() => received,
                    };

                    let error = match received {
                        Ok(shared) => match shared.as_ref() {
                            Ok(result) => return Ok(result.clone()),
                            Err(e) => e.duplicate(),
                        },
                        Err(_) => UploadError::Unknown("in-flight upload ended without a result".to_string()),
                    };

                    if !error.is_retryable() || reissues >= self.inner.config.max_shared_reissues {
                        return Err(error);
                    }
                    reissues += 1;
                    tracing::info!(
                        attachment_id = %job.attachment_id,
                        tier = %job.tier,
                        reissues,
                        error = %error,
                        "Shared upload failed, re-issuing"
                    );
                }
            }
        }
    }

    // ========================================================================
    // Record lifecycle
    // ========================================================================

    async fn upload_with_record(
        &self,
        job: &UploadJob,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let inner = &self.inner;
        let id = job.attachment_id.as_str();
        let max_attempts = inner.config.max_record_attempts;

        let mut record = match inner.records.fetch(id, job.tier).await? {
            Some(record) => record,
            None => UploadRecord::new(id, job.tier),
        };
        // Surfaced instead of a bare exhaustion when the ceiling is hit here
        let mut last_restart: Option<UploadError> = None;

        loop {
            if record.attempt >= max_attempts {
                tracing::warn!(
                    attachment_id = %id,
                    tier = %job.tier,
                    attempt = record.attempt,
                    "Upload attempts exhausted, dropping record"
                );
                self.drop_record(&mut record).await?;
                return Err(last_restart.unwrap_or_else(UploadError::no_more_retries));
            }

            match self.attempt_upload(job, &mut record, progress.clone(), cancel).await {
                Ok(result) => {
                    self.drop_record(&mut record).await?;
                    return Ok(result);
                }
                Err(UploadError::MissingFile(path)) => {
                    if self.canonical_file_missing(id, &path).await? {
                        tracing::warn!(
                            attachment_id = %id,
                            path = %path.display(),
                            "Attachment file is gone, marking attachment file-less"
                        );
                        inner.attachments.mark_file_missing(id).await?;
                        self.drop_record(&mut record).await?;
                        return Err(UploadError::MissingFile(path));
                    }

                    tracing::info!(attachment_id = %id, path = %path.display(), "Temporary upload file is gone, rebuilding");
                    record.local_metadata = None;
                    record.session_url = None;
                    inner.records.upsert(&record).await?;
                }
                Err(e) if e.is_restart() => {
                    record.attempt += 1;
                    tracing::warn!(
                        attachment_id = %id,
                        tier = %job.tier,
                        attempt = record.attempt,
                        error = %e,
                        "Upload failed, restarting with a new session"
                    );

                    if let Some(metadata) = record.local_metadata.take() {
                        if metadata.temporary {
                            inner.metadata.discard(&metadata.source_path).await;
                        }
                    }
                    record.clear_form();

                    if record.attempt < max_attempts {
                        inner.records.upsert(&record).await?;
                        if let Some(delay) = recovery_delay(&e) {
                            inner.sleeper.sleep(delay, cancel).await?;
                        }
                    }
                    last_restart = Some(e);
                }
                Err(e) => {
                    // Network, timeout and cancellation keep the record for a later resume
                    tracing::debug!(attachment_id = %id, tier = %job.tier, error = %e, "Upload interrupted");
                    return Err(e);
                }
            }
        }
    }

    /// Delete the record and any temp file it owns
    async fn drop_record(&self, record: &mut UploadRecord) -> Result<()> {
        if let Some(metadata) = record.local_metadata.take() {
            if metadata.temporary {
                self.inner.metadata.discard(&metadata.source_path).await;
            }
        }
        self.inner
            .records
            .remove(&record.attachment_id, record.tier)
            .await?;
        Ok(())
    }

    async fn canonical_file_missing(&self, attachment_id: &str, missing: &std::path::Path) -> Result<bool> {
        let attachment = self.inner.attachments.fetch(attachment_id).await?;
        Ok(match attachment.and_then(|a| a.stream) {
            None => true,
            Some(stream) => {
                stream.encrypted_path == missing || !self.inner.fs.exists(&stream.encrypted_path).await
            }
        })
    }

    // ========================================================================
    // Single attempt
    // ========================================================================

    async fn attempt_upload(
        &self,
        job: &UploadJob,
        record: &mut UploadRecord,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let inner = &self.inner;
        let id = job.attachment_id.as_str();
        let now = inner.clock.now_ms();

        let attachment = inner
            .attachments
            .fetch(id)
            .await?
            .ok_or_else(|| UploadError::NotUploadable(format!("attachment {} not found", id)))?;

        let metadata = match job.tier {
            UploadTier::Transit => {
                match attachment.transit_upload_strategy(now, inner.config.attachment_reuse_window) {
                    TransitUploadStrategy::CannotUpload => {
                        return Err(UploadError::NotUploadable("attachment has no local file".to_string()));
                    }
                    TransitUploadStrategy::ReuseExistingUpload(info) => {
                        tracing::info!(attachment_id = %id, cdn_key = %info.cdn_key, "Reusing recent transit upload");
                        return Ok(UploadResult::from(&info));
                    }
                    TransitUploadStrategy::ReuseStreamEncryption(stream) => MetadataBuilder::from_stream(&stream)?,
                    TransitUploadStrategy::FreshUpload(stream) => match self.cached_temp_metadata(record, None).await {
                        Some(cached) => cached,
                        None => inner.metadata.reencrypt(&stream, None).await?,
                    },
                }
            }
            UploadTier::Media => {
                let stream = local_stream(&attachment)?;
                let auth = job.auth()?;

                if let Some(transit) = attachment.reusable_transit_upload(now, inner.config.attachment_reuse_window) {
                    return self.copy_existing_transit(&attachment, stream, transit, auth).await;
                }

                match self.cached_temp_metadata(record, Some(&stream.encryption_key)).await {
                    Some(cached) => cached,
                    None => {
                        record.clear_form();
                        inner
                            .metadata
                            .reencrypt(stream, Some(&stream.encryption_key))
                            .await?
                    }
                }
            }
            UploadTier::Thumbnail => {
                let stream = local_stream(&attachment)?;
                job.auth()?;

                match self.cached_temp_metadata(record, None).await {
                    Some(cached) => cached,
                    None => inner.metadata.thumbnail(stream, THUMBNAIL_MAX_DIMENSION).await?,
                }
            }
        };

        self.adopt_metadata(record, &metadata).await;
        let metadata = inner.metadata.validate(metadata).await?;

        let form = match (&record.upload_form, record.upload_form_timestamp_ms) {
            (Some(form), Some(issued_at))
                if now.saturating_sub(issued_at) < inner.config.form_reuse_window.as_millis() as u64 =>
            {
                form.clone()
            }
            _ => {
                let form = match job.tier {
                    UploadTier::Transit => inner.forms.transit_form().await?,
                    UploadTier::Media | UploadTier::Thumbnail => inner.forms.media_form(job.auth()?).await?,
                };
                tracing::debug!(attachment_id = %id, tier = %job.tier, cdn = form.cdn_number, "Using new upload form");
                record.upload_form = Some(form.clone());
                record.upload_form_timestamp_ms = Some(now);
                record.session_url = None;
                form
            }
        };

        let endpoint = UploadEndpoint::for_form(
            &form,
            inner.net.clone(),
            inner.fs.clone(),
            inner.config.max_location_fetch_retries,
        )?;

        let (location, is_resumed_session) = match &record.session_url {
            Some(url) => (url.clone(), true),
            None => {
                let url = endpoint.fetch_resumable_location(&form).await?;
                record.session_url = Some(url.clone());
                (url, false)
            }
        };

        // Resume state must be durable before the first byte goes out
        record.id = Some(inner.records.upsert(record).await?);

        if is_resumed_session {
            tracing::info!(attachment_id = %id, tier = %job.tier, "Resuming persisted upload session");
        }

        let attempt = UploadAttempt {
            attachment_id: id.to_string(),
            tier: job.tier,
            metadata,
            form,
            location,
            is_resumed_session,
        };

        inner.runner.run(&endpoint, &attempt, progress, cancel).await?;

        let result = UploadResult {
            cdn_key: attempt.form.cdn_key.clone(),
            cdn_number: attempt.form.cdn_number,
            encrypted_byte_count: attempt.metadata.encrypted_len,
            plaintext_byte_count: attempt.metadata.plaintext_len,
            encryption_key: attempt.metadata.encryption_key.clone(),
            digest: attempt.metadata.digest.clone(),
            upload_timestamp_ms: inner.clock.now_ms(),
        };

        match job.tier {
            UploadTier::Transit => {
                inner
                    .attachments
                    .set_transit_info(id, TransitTierInfo::from(&result))
                    .await?;
                inner.attachments.touch_owners(id).await?;
                Ok(result)
            }
            UploadTier::Media | UploadTier::Thumbnail => {
                let stream = local_stream(&attachment)?;
                self.copy_fresh_upload(job, stream, result).await
            }
        }
    }

    /// Cached temp metadata whose file still exists, optionally only under `key`
    async fn cached_temp_metadata(&self, record: &UploadRecord, key: Option<&[u8]>) -> Option<UploadMetadata> {
        let cached = record
            .local_metadata
            .as_ref()
            .filter(|m| m.temporary)
            .filter(|m| key.map_or(true, |key| m.encryption_key == key));
        self.inner.metadata.reuse_cached(cached).await
    }

    /// Store the chosen metadata in the record, invalidating what it obsoletes
    async fn adopt_metadata(&self, record: &mut UploadRecord, metadata: &UploadMetadata) {
        if let Some(previous) = record.local_metadata.clone() {
            if previous.encryption_key != metadata.encryption_key {
                record.clear_form();
            } else if previous.digest != metadata.digest {
                record.session_url = None;
            }

            if previous.temporary && previous.source_path != metadata.source_path {
                self.inner.metadata.discard(&previous.source_path).await;
            }
        }
        record.local_metadata = Some(metadata.clone());
    }

    // ========================================================================
    // Media tier copies
    // ========================================================================

    async fn copy_fresh_upload(&self, job: &UploadJob, stream: &StreamInfo, uploaded: UploadResult) -> Result<UploadResult> {
        let auth = job.auth()?;
        let name = match job.tier {
            UploadTier::Thumbnail => copy::thumbnail_media_name(&stream.plaintext_hash, &stream.encryption_key),
            _ => copy::media_name(&stream.plaintext_hash, &stream.encryption_key),
        };
        let media_id = copy::media_id(&auth.backup_root_key, &name);

        let request = CopyRequest {
            source_attachment: CopySource {
                cdn: uploaded.cdn_number,
                key: uploaded.cdn_key.clone(),
            },
            object_length: uploaded.encrypted_byte_count,
            media_id: media_id.clone(),
        };

        let cdn = match self.inner.copier.copy_to_media_tier(auth, &request).await {
            Ok(cdn) => cdn,
            Err(UploadError::SourceObjectNotFound) => {
                self.source_not_found(&job.attachment_id, job.tier, stream).await?;
                return Err(UploadError::SourceObjectNotFound);
            }
            Err(e) => return Err(e),
        };

        let info = MediaTierInfo {
            cdn_number: cdn,
            media_id: media_id.clone(),
            upload_era: auth.upload_era.clone(),
            uploaded_at_ms: self.inner.clock.now_ms(),
        };
        match job.tier {
            UploadTier::Thumbnail => self.inner.attachments.set_thumbnail_info(&job.attachment_id, info).await?,
            _ => self.inner.attachments.set_media_info(&job.attachment_id, info).await?,
        }

        Ok(UploadResult {
            cdn_key: media_id,
            cdn_number: cdn,
            ..uploaded
        })
    }

    /// Copy a still-valid transit upload without sending any bytes
    async fn copy_existing_transit(
        &self,
        attachment: &Attachment,
        stream: &StreamInfo,
        transit: &TransitTierInfo,
        auth: &MediaTierAuth,
    ) -> Result<UploadResult> {
        let media_id = copy::media_id(
            &auth.backup_root_key,
            &copy::media_name(&stream.plaintext_hash, &stream.encryption_key),
        );

        let request = CopyRequest {
            source_attachment: CopySource {
                cdn: transit.cdn_number,
                key: transit.cdn_key.clone(),
            },
            object_length: transit.encrypted_len,
            media_id: media_id.clone(),
        };

        tracing::info!(
            attachment_id = %attachment.id,
            cdn_key = %transit.cdn_key,
            "Copying existing transit upload to media tier"
        );

        let cdn = match self.inner.copier.copy_to_media_tier(auth, &request).await {
            Ok(cdn) => cdn,
            Err(UploadError::SourceObjectNotFound) => {
                // The transit upload we relied on is gone
                self.inner.attachments.clear_transit_info(&attachment.id).await?;
                self.source_not_found(&attachment.id, UploadTier::Media, stream).await?;
                return Err(UploadError::SourceObjectNotFound);
            }
            Err(e) => return Err(e),
        };

        let now = self.inner.clock.now_ms();
        self.inner
            .attachments
            .set_media_info(
                &attachment.id,
                MediaTierInfo {
                    cdn_number: cdn,
                    media_id: media_id.clone(),
                    upload_era: auth.upload_era.clone(),
                    uploaded_at_ms: now,
                },
            )
            .await?;

        Ok(UploadResult {
            cdn_key: media_id,
            cdn_number: cdn,
            encrypted_byte_count: transit.encrypted_len,
            plaintext_byte_count: transit.plaintext_len,
            encryption_key: transit.encryption_key.clone(),
            digest: transit.digest.clone(),
            upload_timestamp_ms: now,
        })
    }

    async fn source_not_found(&self, attachment_id: &str, tier: UploadTier, stream: &StreamInfo) -> Result<()> {
        let mut record = self
            .inner
            .records
            .fetch(attachment_id, tier)
            .await?
            .unwrap_or_else(|| UploadRecord::new(attachment_id, tier));
        self.drop_record(&mut record).await?;

        if !self.inner.fs.exists(&stream.encrypted_path).await {
            tracing::warn!(attachment_id = %attachment_id, "Copy source and local file both gone");
            self.inner.attachments.mark_file_missing(attachment_id).await?;
        }
        Ok(())
    }
}

fn local_stream(attachment: &Attachment) -> Result<&StreamInfo> {
    attachment
        .stream
        .as_ref()
        .ok_or_else(|| UploadError::NotUploadable("attachment has no local file".to_string()))
}

fn recovery_delay(error: &UploadError) -> Option<std::time::Duration> {
    match error {
        UploadError::UploadFailure { recovery } => recovery.delay(),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
