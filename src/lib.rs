//! Attachment Upload Library
//!
//! Resumable, deduplicated uploads of encrypted attachments to the transit
//! CDN, with server-side copies into the media (backup) tier.
//!
//! # Modules
//!
//! - `upload`: Upload coordinator, wire protocols and retry policy
//! - `attachment`: The host application's attachment model
//! - `db`: SQLite persistence for in-progress upload records
//! - `net`: HTTP transport abstraction (reqwest-backed)
//! - `storage`: Temp-file and slicing helpers over the local filesystem
//! - `crypto`, `clock`: Seams for encryption and time

pub mod attachment;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod net;
pub mod storage;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use config::{Config, UploadConfig};
pub use error::{Recovery, Result, UploadError};
pub use upload::{UploadManager, UploadManagerDeps, UploadResult, UploadTier};
