//! Scripted collaborators shared by the unit tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::attachment::{Attachment, AttachmentStore, MediaTierInfo, StreamInfo, TransitTierInfo};
use crate::clock::{Clock, Sleeper};
use crate::crypto::{EncryptionMetadata, EncryptionProvider};
use crate::error::{Result, UploadError};
use crate::net::{HttpRequest, HttpResponse, NetworkClient, ProgressSink};
use crate::storage::LocalFileSystem;
use crate::upload::forms::FormProvider;
use crate::upload::types::{
    MediaTierAuth, UploadAttempt, UploadForm, UploadMetadata, UploadTier, ValidatedUploadMetadata,
};

// ============================================================================
// Network
// ============================================================================

/// A request as it went over the wire
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// In-memory body, or the file contents for streamed uploads
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_transfer(&self) -> bool {
        (self.method == Method::PUT || self.method == Method::POST || self.method == Method::PATCH)
            && !self.body.is_empty()
    }
}

/// Replays queued responses in order
#[derive(Default)]
pub struct MockNetworkClient {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    upload_delay: Mutex<Option<Duration>>,
}

impl MockNetworkClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: HttpResponse) {
        self.script.lock().push_back(Ok(response));
    }

    pub fn push_error(&self, error: UploadError) {
        self.script.lock().push_back(Err(error));
    }

    /// Hold every file upload for `delay` before answering
    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock() = Some(delay);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request(&self, index: usize) -> RecordedRequest {
        self.requests.lock()[index].clone()
    }

    pub fn transfers(&self) -> Vec<RecordedRequest> {
        self.requests().into_iter().filter(|r| r.is_transfer()).collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    fn next(&self, request: &HttpRequest, body: Vec<u8>) -> Result<HttpResponse> {
        self.requests.lock().push(RecordedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body,
        });

        self.script.lock().pop_front().unwrap_or_else(|| {
            Err(UploadError::Unknown(format!(
                "no scripted response for {} {}",
                request.method, request.url
            )))
        })
    }
}

#[async_trait]
impl NetworkClient for MockNetworkClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let body = request.body.clone().unwrap_or_default();
        self.next(&request, body)
    }

    async fn upload_file(
        &self,
        request: HttpRequest,
        file: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<HttpResponse> {
        let body = tokio::fs::read(file)
            .await
            .map_err(|_| UploadError::MissingFile(file.to_path_buf()))?;

        let delay = *self.upload_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let len = body.len() as u64;
        let response = self.next(&request, body);
        if let (Ok(_), Some(progress)) = (&response, progress) {
            progress(len, len);
        }
        response
    }
}

// ============================================================================
// Encryption
// ============================================================================

const MOCK_IV_LEN: usize = 16;
const MOCK_TAG_LEN: usize = 16;

/// "Encrypts" by framing the plaintext with a key-derived prefix and a tag
#[derive(Default)]
pub struct MockEncryption {
    generated: AtomicU64,
}

impl MockEncryption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(plaintext: &[u8], key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(plaintext.len() + MOCK_IV_LEN + MOCK_TAG_LEN);
        out.extend(key.iter().cycle().take(MOCK_IV_LEN));
        out.extend_from_slice(plaintext);
        out.extend(std::iter::repeat(0xAB).take(MOCK_TAG_LEN));
        out
    }
}

#[async_trait]
impl EncryptionProvider for MockEncryption {
    async fn encrypt_file(&self, source: &Path, dest: &Path, key: Option<&[u8]>) -> Result<EncryptionMetadata> {
        let plaintext = tokio::fs::read(source)
            .await
            .map_err(|_| UploadError::MissingFile(source.to_path_buf()))?;

        let key = match key {
            Some(key) => key.to_vec(),
            None => {
                let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
                let mut key = vec![0x40u8; 64];
                key[..8].copy_from_slice(&n.to_be_bytes());
                key
            }
        };

        let encrypted = Self::frame(&plaintext, &key);
        tokio::fs::write(dest, &encrypted).await?;

        Ok(EncryptionMetadata {
            digest: Sha256::digest(&encrypted).to_vec(),
            key,
            encrypted_len: encrypted.len() as u64,
            plaintext_len: plaintext.len() as u64,
        })
    }

    async fn decrypt_file(&self, source: &Path, dest: &Path, _key: &[u8], plaintext_len: u64) -> Result<()> {
        let encrypted = tokio::fs::read(source)
            .await
            .map_err(|_| UploadError::MissingFile(source.to_path_buf()))?;
        let start = MOCK_IV_LEN.min(encrypted.len());
        let end = (start + plaintext_len as usize).min(encrypted.len());
        tokio::fs::write(dest, &encrypted[start..end]).await?;
        Ok(())
    }
}

// ============================================================================
// Attachments
// ============================================================================

#[derive(Default)]
pub struct MockAttachmentStore {
    attachments: Mutex<HashMap<String, Attachment>>,
    missing_marked: Mutex<Vec<String>>,
    touched: Mutex<Vec<String>>,
}

impl MockAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, attachment: Attachment) {
        self.attachments.lock().insert(attachment.id.clone(), attachment);
    }

    pub fn get(&self, id: &str) -> Option<Attachment> {
        self.attachments.lock().get(id).cloned()
    }

    pub fn missing_marked(&self) -> Vec<String> {
        self.missing_marked.lock().clone()
    }

    pub fn touched(&self) -> Vec<String> {
        self.touched.lock().clone()
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Attachment)) -> Result<()> {
        let mut attachments = self.attachments.lock();
        let attachment = attachments
            .get_mut(id)
            .ok_or_else(|| UploadError::Unknown(format!("no attachment {}", id)))?;
        f(attachment);
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for MockAttachmentStore {
    async fn fetch(&self, attachment_id: &str) -> Result<Option<Attachment>> {
        Ok(self.get(attachment_id))
    }

    async fn set_transit_info(&self, attachment_id: &str, info: TransitTierInfo) -> Result<()> {
        self.update(attachment_id, |a| a.transit = Some(info))
    }

    async fn clear_transit_info(&self, attachment_id: &str) -> Result<()> {
        self.update(attachment_id, |a| a.transit = None)
    }

    async fn set_media_info(&self, attachment_id: &str, info: MediaTierInfo) -> Result<()> {
        self.update(attachment_id, |a| a.media = Some(info))
    }

    async fn set_thumbnail_info(&self, attachment_id: &str, info: MediaTierInfo) -> Result<()> {
        self.update(attachment_id, |a| a.thumbnail = Some(info))
    }

    async fn mark_file_missing(&self, attachment_id: &str) -> Result<()> {
        self.missing_marked.lock().push(attachment_id.to_string());
        self.update(attachment_id, |a| a.stream = None)
    }

    async fn touch_owners(&self, attachment_id: &str) -> Result<()> {
        self.touched.lock().push(attachment_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Forms
// ============================================================================

/// Issues numbered forms for one CDN
pub struct MockFormProvider {
    cdn_number: u32,
    transit_calls: AtomicUsize,
    media_calls: AtomicUsize,
}

impl MockFormProvider {
    pub fn new(cdn_number: u32) -> Self {
        Self {
            cdn_number,
            transit_calls: AtomicUsize::new(0),
            media_calls: AtomicUsize::new(0),
        }
    }

    pub fn transit_calls(&self) -> usize {
        self.transit_calls.load(Ordering::SeqCst)
    }

    pub fn media_calls(&self) -> usize {
        self.media_calls.load(Ordering::SeqCst)
    }

    fn form(&self, n: usize) -> UploadForm {
        let mut form = sample_form(self.cdn_number);
        form.cdn_key = format!("cdn-key-{}", n);
        form
    }
}

#[async_trait]
impl FormProvider for MockFormProvider {
    async fn transit_form(&self) -> Result<UploadForm> {
        let n = self.transit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.form(n))
    }

    async fn media_form(&self, _auth: &MediaTierAuth) -> Result<UploadForm> {
        let n = self.media_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.form(100 + n))
    }
}

pub fn sample_auth() -> MediaTierAuth {
    let mut headers = BTreeMap::new();
    headers.insert("Authorization".to_string(), "Basic backup".to_string());
    MediaTierAuth {
        headers,
        backup_root_key: vec![5; 32],
        upload_era: "era-1".to_string(),
    }
}

// ============================================================================
// Time
// ============================================================================

pub struct MockClock {
    now_ms: AtomicU64,
}

impl MockClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Returns immediately, remembering what it was asked to wait
#[derive(Default)]
pub struct MockSleeper {
    sleeps: Mutex<Vec<Duration>>,
    /// Cancel this token on the n-th sleep (1-based)
    cancel_on: Mutex<Option<(usize, CancellationToken)>>,
}

impl MockSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn cancel_on_sleep(&self, n: usize, token: CancellationToken) {
        *self.cancel_on.lock() = Some((n, token));
    }
}

#[async_trait]
impl Sleeper for MockSleeper {
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        let count = {
            let mut sleeps = self.sleeps.lock();
            sleeps.push(duration);
            sleeps.len()
        };

        if let Some((n, token)) = self.cancel_on.lock().as_ref() {
            if *n == count {
                token.cancel();
            }
        }

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub async fn temp_fs() -> (TempDir, Arc<LocalFileSystem>) {
    let dir = TempDir::new().unwrap();
    let fs = LocalFileSystem::new(dir.path().join("tmp")).await.unwrap();
    (dir, Arc::new(fs))
}

pub fn noop_progress() -> ProgressSink {
    Arc::new(|_, _| {})
}

pub fn sample_form(cdn_number: u32) -> UploadForm {
    let mut headers = BTreeMap::new();
    headers.insert("Authorization".to_string(), "Basic dGVzdA==".to_string());

    UploadForm {
        cdn_number,
        cdn_key: "cdn-key-1".to_string(),
        headers,
        signed_upload_location: format!("https://cdn{}.example/upload", cdn_number),
    }
}

/// Deterministic non-repeating test bytes
pub fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Write `len` bytes to `dir/name` and describe them as an encrypted blob
pub async fn write_blob(dir: &Path, name: &str, len: usize) -> UploadMetadata {
    let path = dir.join(name);
    let bytes = test_bytes(len);
    tokio::fs::write(&path, &bytes).await.unwrap();

    UploadMetadata::new(
        path,
        vec![7; 64],
        Sha256::digest(&bytes).to_vec(),
        len as u64,
        len.saturating_sub(32) as u64,
        false,
    )
    .unwrap()
}

pub async fn sample_attempt(dir: &Path, len: usize, cdn_number: u32, location: &str) -> UploadAttempt {
    let metadata = write_blob(dir, "blob", len).await;

    UploadAttempt {
        attachment_id: "att-1".to_string(),
        tier: UploadTier::Transit,
        metadata: ValidatedUploadMetadata::new_unchecked(metadata),
        form: sample_form(cdn_number),
        location: location.to_string(),
        is_resumed_session: false,
    }
}

/// An attachment whose local stream is a mock-encrypted copy of `plaintext`
pub async fn write_attachment(dir: &Path, id: &str, plaintext: &[u8]) -> Attachment {
    let key = vec![1u8; 64];
    let encrypted = MockEncryption::frame(plaintext, &key);
    let path: PathBuf = dir.join(format!("{}.enc", id));
    tokio::fs::write(&path, &encrypted).await.unwrap();

    Attachment {
        id: id.to_string(),
        stream: Some(StreamInfo {
            encrypted_path: path,
            encryption_key: key,
            digest: Sha256::digest(&encrypted).to_vec(),
            encrypted_len: encrypted.len() as u64,
            plaintext_len: plaintext.len() as u64,
            plaintext_hash: Sha256::digest(plaintext).to_vec(),
            mime_type: "application/octet-stream".to_string(),
        }),
        transit: None,
        media: None,
        thumbnail: None,
    }
}
