//! Resumable Upload Module
//!
//! Moves encrypted attachment files to the CDN and copies them into the
//! media tier:
//! - Resumable-PUT (CDN 2) and TUS (CDN 3) wire protocols
//! - Resume from the server-reported offset after interruptions
//! - Durable per-(attachment, tier) records so uploads survive restarts
//! - One in-flight upload per (attachment, tier), shared by all callers
//!
//! Flow:
//! 1. Pick the blob to send (stream as is, re-encrypted, or a thumbnail)
//! 2. Obtain or reuse an upload form and session
//! 3. Transfer, resuming as needed
//! 4. Record where the bytes landed (and copy to the media tier)

pub mod active;
pub mod copy;
pub mod endpoint;
pub mod forms;
pub mod manager;
pub mod metadata;
pub mod runner;
pub mod thumbnail;
pub mod types;

pub use active::ActiveUploads;
pub use copy::{media_id, media_name, thumbnail_media_name, MediaCopyClient};
pub use endpoint::UploadEndpoint;
pub use forms::{FormProvider, HttpFormProvider};
pub use manager::{UploadManager, UploadManagerDeps};
pub use metadata::MetadataBuilder;
pub use runner::{AttemptRunner, RunnerConfig};
pub use types::*;
