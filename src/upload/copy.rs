//! Server-side copy into the media tier
//!
//! Bytes are uploaded once to the transit CDN and then copied by the
//! server. Media objects are addressed by a media id derived from the
//! backup root key, never from the attachment's own key.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::endpoint::retry_after;
use super::types::MediaTierAuth;
use crate::error::{Result, UploadError};
use crate::net::{HttpRequest, NetworkClient};

pub const MEDIA_COPY_PATH: &str = "/v1/archives/media";

/// Bytes of the SHA-256 output kept for a media id
const MEDIA_ID_LEN: usize = 15;

const MEDIA_ID_DOMAIN: &[u8] = b"attachment-media-id:";

const THUMBNAIL_SUFFIX: &str = "_thumbnail";

/// Stable name of an attachment's full-size media object
pub fn media_name(plaintext_hash: &[u8], encryption_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext_hash);
    hasher.update(encryption_key);
    hex::encode(hasher.finalize())
}

pub fn thumbnail_media_name(plaintext_hash: &[u8], encryption_key: &[u8]) -> String {
    format!("{}{}", media_name(plaintext_hash, encryption_key), THUMBNAIL_SUFFIX)
}

/// URL-safe id the server stores a media object under
pub fn media_id(backup_root_key: &[u8], media_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backup_root_key);
    hasher.update(MEDIA_ID_DOMAIN);
    hasher.update(media_name.as_bytes());
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..MEDIA_ID_LEN])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySource {
    pub cdn: u32,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRequest {
    pub source_attachment: CopySource,
    pub object_length: u64,
    pub media_id: String,
}

#[derive(Debug, Deserialize)]
struct CopyResponse {
    cdn: u32,
}

/// Client for the media copy endpoint
#[derive(Clone)]
pub struct MediaCopyClient {
    net: Arc<dyn NetworkClient>,
    base_url: String,
}

impl MediaCopyClient {
    pub fn new(net: Arc<dyn NetworkClient>, base_url: impl Into<String>) -> Self {
        Self {
            net,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Copy a transit object; returns the media-tier CDN number
    pub async fn copy_to_media_tier(&self, auth: &MediaTierAuth, copy: &CopyRequest) -> Result<u32> {
        let request = HttpRequest::new(Method::PUT, format!("{}{}", self.base_url, MEDIA_COPY_PATH))
            .with_headers(&auth.headers)
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(copy)?);

        let response = self.net.send(request).await?;

        match response.status {
            200 => {
                let body: CopyResponse = serde_json::from_slice(&response.body)?;
                tracing::info!(
                    media_id = %copy.media_id,
                    source_cdn = copy.source_attachment.cdn,
                    cdn = body.cdn,
                    "Copied to media tier"
                );
                Ok(body.cdn)
            }
            410 => {
                tracing::warn!(media_id = %copy.media_id, "Copy source no longer on transit CDN");
                Err(UploadError::SourceObjectNotFound)
            }
            status if status >= 500 => Err(UploadError::resume(retry_after(&response))),
            status => Err(UploadError::UnexpectedStatusCode(status)),
        }
    }
}
