//! Upload types and protocol constants

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionMetadata;
use crate::error::{Result, UploadError};

/// TUS protocol version sent on every TUS request
pub const TUS_VERSION: &str = "1.0.0";

/// Header carrying the base64 SHA-256 of the encrypted blob on TUS creation
pub const CHECKSUM_HEADER: &str = "x-signal-checksum-sha256";

pub const CDN_RESUMABLE_PUT: u32 = 2;
pub const CDN_TUS: u32 = 3;

/// Destination an attachment's bytes are uploaded to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadTier {
    Transit,
    Media,
    Thumbnail,
}

impl UploadTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transit => "transit",
            Self::Media => "media",
            Self::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for UploadTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadTier {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transit" => Ok(Self::Transit),
            "media" => Ok(Self::Media),
            "thumbnail" => Ok(Self::Thumbnail),
            other => Err(UploadError::Unknown(format!("Unknown upload tier: {}", other))),
        }
    }
}

/// An encrypted blob ready to be uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub source_path: PathBuf,
    pub encryption_key: Vec<u8>,
    pub digest: Vec<u8>,
    pub encrypted_len: u64,
    pub plaintext_len: u64,
    /// Written by us for this upload and deleted once it succeeds
    pub temporary: bool,
}

impl UploadMetadata {
    pub fn new(
        source_path: PathBuf,
        encryption_key: Vec<u8>,
        digest: Vec<u8>,
        encrypted_len: u64,
        plaintext_len: u64,
        temporary: bool,
    ) -> Result<Self> {
        // IV and MAC always make the ciphertext longer
        if encrypted_len <= plaintext_len {
            return Err(UploadError::NotUploadable(format!(
                "encrypted length {} does not exceed plaintext length {}",
                encrypted_len, plaintext_len
            )));
        }

        Ok(Self {
            source_path,
            encryption_key,
            digest,
            encrypted_len,
            plaintext_len,
            temporary,
        })
    }

    pub fn from_encryption(path: PathBuf, encryption: EncryptionMetadata, temporary: bool) -> Result<Self> {
        Self::new(
            path,
            encryption.key,
            encryption.digest,
            encryption.encrypted_len,
            encryption.plaintext_len,
            temporary,
        )
    }
}

/// Metadata whose digest has been checked against the bytes on disk.
///
/// Only constructed by `MetadataBuilder::validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUploadMetadata(UploadMetadata);

impl ValidatedUploadMetadata {
    pub(crate) fn new_unchecked(metadata: UploadMetadata) -> Self {
        Self(metadata)
    }

    pub fn into_inner(self) -> UploadMetadata {
        self.0
    }
}

impl Deref for ValidatedUploadMetadata {
    type Target = UploadMetadata;

    fn deref(&self) -> &UploadMetadata {
        &self.0
    }
}

/// Server-issued authorization for one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadForm {
    #[serde(rename = "cdn")]
    pub cdn_number: u32,
    #[serde(rename = "key")]
    pub cdn_key: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub signed_upload_location: String,
}

/// Durable resume state for one (attachment, tier)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    /// Row id, `None` until first persisted
    pub id: Option<i64>,
    pub attachment_id: String,
    pub tier: UploadTier,
    pub upload_form: Option<UploadForm>,
    pub upload_form_timestamp_ms: Option<u64>,
    pub local_metadata: Option<UploadMetadata>,
    pub session_url: Option<String>,
    pub attempt: u32,
}

impl UploadRecord {
    pub fn new(attachment_id: impl Into<String>, tier: UploadTier) -> Self {
        Self {
            id: None,
            attachment_id: attachment_id.into(),
            tier,
            upload_form: None,
            upload_form_timestamp_ms: None,
            local_metadata: None,
            session_url: None,
            attempt: 0,
        }
    }

    pub fn clear_form(&mut self) {
        self.upload_form = None;
        self.upload_form_timestamp_ms = None;
        self.session_url = None;
    }
}

/// Where a finished upload landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub cdn_key: String,
    pub cdn_number: u32,
    pub encrypted_byte_count: u64,
    pub plaintext_byte_count: u64,
    pub encryption_key: Vec<u8>,
    pub digest: Vec<u8>,
    pub upload_timestamp_ms: u64,
}

/// Server-reported state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeProgress {
    Complete,
    Uploaded(u64),
    Restart,
}

/// Outcome of a single transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The final byte was accepted
    Complete,
    /// A chunk was accepted; more remain
    Partial,
}

/// Credentials for media-tier forms and copies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTierAuth {
    pub headers: BTreeMap<String, String>,
    /// Root key the destination media ids are derived from
    pub backup_root_key: Vec<u8>,
    pub upload_era: String,
}

/// Everything one run of the attempt runner needs
#[derive(Debug, Clone)]
pub struct UploadAttempt {
    pub attachment_id: String,
    pub tier: UploadTier,
    pub metadata: ValidatedUploadMetadata,
    pub form: UploadForm,
    /// Session URL (resumable-PUT) or creation URL (TUS)
    pub location: String,
    /// The session was restored from a record rather than created now
    pub is_resumed_session: bool,
}

impl UploadAttempt {
    pub fn total_len(&self) -> u64 {
        self.metadata.encrypted_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_rejects_non_expanding_ciphertext() {
        let result = UploadMetadata::new(PathBuf::from("/tmp/x"), vec![], vec![], 10, 10, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_tier_round_trips_through_str() {
        for tier in [UploadTier::Transit, UploadTier::Media, UploadTier::Thumbnail] {
            assert_eq!(tier.as_str().parse::<UploadTier>().unwrap(), tier);
        }
        assert!("primary".parse::<UploadTier>().is_err());
    }

    #[test]
    fn test_form_parses_service_json() {
        let json = r#"{
            "cdn": 3,
            "key": "abc",
            "headers": {"Authorization": "Basic xyz"},
            "signedUploadLocation": "https://cdn3.example/upload"
        }"#;

        let form: UploadForm = serde_json::from_str(json).unwrap();
        assert_eq!(form.cdn_number, 3);
        assert_eq!(form.cdn_key, "abc");
        assert_eq!(form.headers.get("Authorization").unwrap(), "Basic xyz");
    }
}
