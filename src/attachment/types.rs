//! Owning-entity model
//!
//! A trimmed view of the attachment row: enough to decide how (and whether)
//! its bytes need to go over the wire.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::upload::types::UploadResult;

/// The locally stored, already encrypted attachment file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub encrypted_path: PathBuf,
    pub encryption_key: Vec<u8>,
    /// SHA-256 over the encrypted file
    pub digest: Vec<u8>,
    pub encrypted_len: u64,
    pub plaintext_len: u64,
    /// SHA-256 over the plaintext
    pub plaintext_hash: Vec<u8>,
    pub mime_type: String,
}

/// Where the attachment was last uploaded on the transit CDN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitTierInfo {
    pub cdn_number: u32,
    pub cdn_key: String,
    pub upload_timestamp_ms: u64,
    pub encryption_key: Vec<u8>,
    pub digest: Vec<u8>,
    pub encrypted_len: u64,
    pub plaintext_len: u64,
}

impl TransitTierInfo {
    pub fn is_within(&self, now_ms: u64, window: Duration) -> bool {
        now_ms.saturating_sub(self.upload_timestamp_ms) < window.as_millis() as u64
    }
}

impl From<&UploadResult> for TransitTierInfo {
    fn from(result: &UploadResult) -> Self {
        Self {
            cdn_number: result.cdn_number,
            cdn_key: result.cdn_key.clone(),
            upload_timestamp_ms: result.upload_timestamp_ms,
            encryption_key: result.encryption_key.clone(),
            digest: result.digest.clone(),
            encrypted_len: result.encrypted_byte_count,
            plaintext_len: result.plaintext_byte_count,
        }
    }
}

impl From<&TransitTierInfo> for UploadResult {
    fn from(info: &TransitTierInfo) -> Self {
        Self {
            cdn_key: info.cdn_key.clone(),
            cdn_number: info.cdn_number,
            encrypted_byte_count: info.encrypted_len,
            plaintext_byte_count: info.plaintext_len,
            encryption_key: info.encryption_key.clone(),
            digest: info.digest.clone(),
            upload_timestamp_ms: info.upload_timestamp_ms,
        }
    }
}

/// Media-tier (or thumbnail-tier) copy location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTierInfo {
    pub cdn_number: u32,
    pub media_id: String,
    pub upload_era: String,
    pub uploaded_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    /// `None` once the local file is known to be gone
    pub stream: Option<StreamInfo>,
    pub transit: Option<TransitTierInfo>,
    pub media: Option<MediaTierInfo>,
    pub thumbnail: Option<MediaTierInfo>,
}

/// How to get an attachment onto the transit tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitUploadStrategy {
    /// No local file to upload
    CannotUpload,
    /// A recent transit upload with the current key can be handed out as is
    ReuseExistingUpload(TransitTierInfo),
    /// The local file's key was never exposed; upload it unchanged
    ReuseStreamEncryption(StreamInfo),
    /// The key was already used for an upload; re-encrypt under a new key
    FreshUpload(StreamInfo),
}

impl Attachment {
    pub fn transit_upload_strategy(&self, now_ms: u64, reuse_window: Duration) -> TransitUploadStrategy {
        let Some(stream) = &self.stream else {
            return TransitUploadStrategy::CannotUpload;
        };

        let key_already_used = match &self.transit {
            Some(transit) if transit.encryption_key == stream.encryption_key => {
                if transit.is_within(now_ms, reuse_window) {
                    return TransitUploadStrategy::ReuseExistingUpload(transit.clone());
                }
                true
            }
            _ => false,
        };

        if key_already_used || self.media.is_some() {
            TransitUploadStrategy::FreshUpload(stream.clone())
        } else {
            TransitUploadStrategy::ReuseStreamEncryption(stream.clone())
        }
    }

    /// A transit upload recent enough, and under the local key, to be the
    /// source of a media-tier copy
    pub fn reusable_transit_upload(&self, now_ms: u64, reuse_window: Duration) -> Option<&TransitTierInfo> {
        let stream = self.stream.as_ref()?;
        self.transit.as_ref().filter(|transit| {
            transit.encryption_key == stream.encryption_key && transit.is_within(now_ms, reuse_window)
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
