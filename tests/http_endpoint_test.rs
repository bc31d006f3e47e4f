//! Protocol round trips against an in-process CDN over real HTTP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path as RoutePath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{head, post, put};
use axum::Router;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use attachment_upload::clock::TokioSleeper;
use attachment_upload::crypto::{EncryptionMetadata, EncryptionProvider};
use attachment_upload::net::{ProgressSink, ReqwestNetworkClient};
use attachment_upload::storage::LocalFileSystem;
use attachment_upload::upload::{
    AttemptRunner, MetadataBuilder, RunnerConfig, UploadAttempt, UploadEndpoint, UploadForm,
    UploadMetadata, UploadTier,
};
use attachment_upload::{Result, UploadError};

const CHECKSUM_HEADER: &str = "x-signal-checksum-sha256";

// ============================================================================
// Fake CDN
// ============================================================================

#[derive(Default)]
struct Cdn {
    base_url: String,
    stored: Vec<u8>,
    /// Keep only half of the next transfer and answer 503
    drop_next_transfer: bool,
    checksum: Option<String>,
}

type SharedCdn = Arc<Mutex<Cdn>>;

/// Append a transfer starting at `start`, honoring `drop_next_transfer`
fn accept(cdn: &mut Cdn, start: usize, body: &[u8]) -> bool {
    cdn.stored.truncate(start);
    if cdn.drop_next_transfer {
        cdn.drop_next_transfer = false;
        cdn.stored.extend_from_slice(&body[..body.len() / 2]);
        return false;
    }
    cdn.stored.extend_from_slice(body);
    true
}

async fn create_session(State(cdn): State<SharedCdn>) -> Response {
    let location = format!("{}/session/1", cdn.lock().base_url);
    (StatusCode::CREATED, [(header::LOCATION, location)]).into_response()
}

async fn put_session(State(cdn): State<SharedCdn>, headers: HeaderMap, body: Bytes) -> Response {
    let mut cdn = cdn.lock();
    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Progress query
    if let Some(total) = range.as_deref().and_then(|r| r.strip_prefix("bytes */")) {
        let total: usize = total.parse().unwrap_or(0);
        if cdn.stored.len() == total {
            return StatusCode::OK.into_response();
        }
        if cdn.stored.is_empty() {
            return StatusCode::PERMANENT_REDIRECT.into_response();
        }
        let held = format!("bytes=0-{}", cdn.stored.len() - 1);
        return (StatusCode::PERMANENT_REDIRECT, [(header::RANGE, held)]).into_response();
    }

    let (start, total) = match range.as_deref().and_then(|r| r.strip_prefix("bytes ")) {
        Some(content_range) => {
            let (span, total) = content_range.split_once('/').unwrap();
            let start = span.split_once('-').unwrap().0.parse().unwrap();
            (start, total.parse().unwrap())
        }
        None => (0, body.len()),
    };

    if !accept(&mut cdn, start, &body) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if cdn.stored.len() == total {
        StatusCode::OK.into_response()
    } else {
        StatusCode::PERMANENT_REDIRECT.into_response()
    }
}

async fn tus_create(State(cdn): State<SharedCdn>, headers: HeaderMap, body: Bytes) -> Response {
    let mut cdn = cdn.lock();
    if headers.get("tus-resumable").is_none() || headers.get("upload-length").is_none() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    cdn.checksum = headers
        .get(CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !accept(&mut cdn, 0, &body) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::CREATED.into_response()
}

async fn tus_head(State(cdn): State<SharedCdn>, RoutePath(_key): RoutePath<String>) -> Response {
    let offset = cdn.lock().stored.len().to_string();
    (StatusCode::OK, [("upload-offset", offset)]).into_response()
}

async fn tus_patch(
    State(cdn): State<SharedCdn>,
    RoutePath(_key): RoutePath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut cdn = cdn.lock();
    let offset: Option<usize> = headers
        .get("upload-offset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    match offset {
        Some(offset) if offset == cdn.stored.len() => {
            if accept(&mut cdn, offset, &body) {
                StatusCode::NO_CONTENT.into_response()
            } else {
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        }
        _ => StatusCode::CONFLICT.into_response(),
    }
}

async fn spawn_cdn() -> (String, SharedCdn) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);

    let cdn: SharedCdn = Arc::new(Mutex::new(Cdn {
        base_url: base_url.clone(),
        ..Cdn::default()
    }));

    let app = Router::new()
        .route("/upload", post(create_session))
        .route("/session/1", put(put_session))
        .route("/tus", post(tus_create))
        .route("/tus/:key", head(tus_head).patch(tus_patch))
        .with_state(cdn.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base_url, cdn)
}

// ============================================================================
// Client side
// ============================================================================

/// Blobs here are already encrypted
struct NoEncryption;

#[async_trait]
impl EncryptionProvider for NoEncryption {
    async fn encrypt_file(
        &self,
        _source: &std::path::Path,
        _dest: &std::path::Path,
        _key: Option<&[u8]>,
    ) -> Result<EncryptionMetadata> {
        Err(UploadError::Unknown("not used".to_string()))
    }

    async fn decrypt_file(
        &self,
        _source: &std::path::Path,
        _dest: &std::path::Path,
        _key: &[u8],
        _plaintext_len: u64,
    ) -> Result<()> {
        Err(UploadError::Unknown("not used".to_string()))
    }
}

struct Client {
    dir: tempfile::TempDir,
    blob: Vec<u8>,
    net: Arc<ReqwestNetworkClient>,
    fs: Arc<LocalFileSystem>,
    metadata: MetadataBuilder,
}

async fn client(len: usize) -> Client {
    let dir = tempfile::TempDir::new().unwrap();
    let fs = Arc::new(LocalFileSystem::new(dir.path().join("tmp")).await.unwrap());
    let blob: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(dir.path().join("blob"), &blob).await.unwrap();

    Client {
        net: Arc::new(ReqwestNetworkClient::new(Duration::from_secs(10)).unwrap()),
        metadata: MetadataBuilder::new(fs.clone(), Arc::new(NoEncryption)),
        fs,
        blob,
        dir,
    }
}

impl Client {
    async fn attempt(&self, form: UploadForm, location: String) -> UploadAttempt {
        let metadata = UploadMetadata::new(
            self.dir.path().join("blob"),
            vec![7; 64],
            Sha256::digest(&self.blob).to_vec(),
            self.blob.len() as u64,
            self.blob.len() as u64 - 32,
            false,
        )
        .unwrap();

        UploadAttempt {
            attachment_id: "att-1".to_string(),
            tier: UploadTier::Transit,
            metadata: self.metadata.validate(metadata).await.unwrap(),
            form,
            location,
            is_resumed_session: false,
        }
    }

    fn endpoint(&self, form: &UploadForm) -> UploadEndpoint {
        UploadEndpoint::for_form(form, self.net.clone(), self.fs.clone(), 2).unwrap()
    }
}

fn form(cdn_number: u32, location: String) -> UploadForm {
    UploadForm {
        cdn_number,
        cdn_key: "cdn-key-1".to_string(),
        headers: Default::default(),
        signed_upload_location: location,
    }
}

fn runner(max_chunk_bytes: Option<u64>) -> AttemptRunner {
    AttemptRunner::new(
        Arc::new(TokioSleeper),
        RunnerConfig {
            max_resume_retries: 3,
            max_chunk_bytes,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
        },
    )
}

#[tokio::test]
async fn test_resumable_put_resumes_after_server_error() {
    let (base_url, cdn) = spawn_cdn().await;
    cdn.lock().drop_next_transfer = true;

    let client = client(10_000).await;
    let form = form(2, format!("{}/upload", base_url));
    let endpoint = client.endpoint(&form);

    let location = endpoint.fetch_resumable_location(&form).await.unwrap();
    assert_eq!(location, format!("{}/session/1", base_url));

    let attempt = client.attempt(form, location).await;
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink: ProgressSink = {
        let reported = reported.clone();
        Arc::new(move |done: u64, total: u64| reported.lock().push((done, total)))
    };

    runner(None)
        .run(&endpoint, &attempt, Some(sink), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cdn.lock().stored, client.blob);

    let reported = reported.lock().clone();
    assert_eq!(reported.last(), Some(&(10_000, 10_000)));
    assert!(reported.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[tokio::test]
async fn test_resumable_put_in_chunks() {
    let (base_url, cdn) = spawn_cdn().await;

    let client = client(10_000).await;
    let form = form(2, format!("{}/upload", base_url));
    let endpoint = client.endpoint(&form);
    let location = endpoint.fetch_resumable_location(&form).await.unwrap();
    let attempt = client.attempt(form, location).await;

    runner(Some(3_000))
        .run(&endpoint, &attempt, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cdn.lock().stored, client.blob);
}

#[tokio::test]
async fn test_tus_creation_then_patch_after_server_error() {
    let (base_url, cdn) = spawn_cdn().await;
    cdn.lock().drop_next_transfer = true;

    let client = client(8_000).await;
    let form = form(3, format!("{}/tus", base_url));
    let endpoint = client.endpoint(&form);

    let location = endpoint.fetch_resumable_location(&form).await.unwrap();
    assert_eq!(location, format!("{}/tus", base_url));

    let attempt = client.attempt(form, location).await;
    runner(None)
        .run(&endpoint, &attempt, None, &CancellationToken::new())
        .await
        .unwrap();

    let cdn = cdn.lock();
    assert_eq!(cdn.stored, client.blob);
    assert!(cdn.checksum.is_some());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (base_url, cdn) = spawn_cdn().await;

    let client = client(1_000).await;
    let form = form(3, format!("{}/tus", base_url));
    let endpoint = client.endpoint(&form);
    let attempt = client.attempt(form, format!("{}/tus", base_url)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = runner(None)
        .run(&endpoint, &attempt, None, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Cancelled));
    assert!(cdn.lock().stored.is_empty());
}
