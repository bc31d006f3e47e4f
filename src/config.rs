//! Configuration management for the attachment uploader

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    pub upload: UploadConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base URL of the chat service (form issuing, media copy)
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Restart-classified failures tolerated per record before it is dropped
    pub max_record_attempts: u32,
    /// Resume retries inside a single attempt
    pub max_resume_retries: u32,
    /// Network retries when creating a resumable-PUT session
    pub max_location_fetch_retries: u32,
    /// How long a cached upload form may be reused
    pub form_reuse_window: Duration,
    /// How long a transit-tier upload may be reused instead of re-uploading
    pub attachment_reuse_window: Duration,
    /// Maximum bytes per transfer request (`None` sends the rest in one request)
    pub max_chunk_bytes: Option<u64>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How many times a caller re-issues after a shared upload it waited on fails
    pub max_shared_reissues: u32,
    /// Where re-encrypted blobs and slices are written
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            max_record_attempts: 8,
            max_resume_retries: 8,
            max_location_fetch_retries: 2,
            // Forms expire server-side after a week; stay well inside that.
            form_reuse_window: Duration::from_secs(2 * 24 * 60 * 60),
            attachment_reuse_window: Duration::from_secs(3 * 24 * 60 * 60),
            max_chunk_bytes: None,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(120),
            max_shared_reissues: 3,
            temp_dir: env::temp_dir().join("attachment-upload"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service: ServiceConfig {
                base_url: "http://localhost:8080".to_string(),
                request_timeout: Duration::from_secs(60),
            },
            upload: UploadConfig::default(),
            database: DatabaseConfig::new("sqlite:./uploads.db"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = UploadConfig::default();

        Ok(Config {
            service: ServiceConfig {
                base_url: env::var("SERVICE_BASE_URL")?,
                request_timeout: Duration::from_secs(parse_var("SERVICE_TIMEOUT_SECS", 60)),
            },
            upload: UploadConfig {
                max_record_attempts: parse_var("UPLOAD_MAX_ATTEMPTS", defaults.max_record_attempts),
                max_resume_retries: parse_var(
                    "UPLOAD_MAX_RESUME_RETRIES",
                    defaults.max_resume_retries,
                ),
                max_chunk_bytes: env::var("UPLOAD_MAX_CHUNK_BYTES")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                temp_dir: env::var("UPLOAD_TEMP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.temp_dir.clone()),
                ..defaults
            },
            database: DatabaseConfig {
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5),
                ..DatabaseConfig::new(
                    env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./uploads.db".to_string()),
                )
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
