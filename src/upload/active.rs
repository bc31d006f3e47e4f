//! Active uploads
//!
//! At most one task uploads a given (attachment, tier) at a time. The first
//! caller registers as the uploader; later callers subscribe and receive the
//! same result when it finishes.
//!
//! The entry is removed and the result broadcast under one lock, so a caller
//! either subscribes before the result is sent or finds the key free.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::types::{UploadResult, UploadTier};
use crate::error::Result;

/// Result fanned out to waiters
pub type SharedResult = Arc<Result<UploadResult>>;

/// Only the single completion message is ever sent
const CHANNEL_CAPACITY: usize = 1;

type ActiveKey = (String, UploadTier);
type ActiveMap = HashMap<ActiveKey, broadcast::Sender<SharedResult>>;

#[derive(Clone, Default)]
pub struct ActiveUploads {
    active: Arc<Mutex<ActiveMap>>,
}

pub enum UploadRole {
    /// First caller: perform the upload and `complete` the guard
    Uploader(ActiveUploadGuard),
    /// Someone else is uploading
    Waiter(broadcast::Receiver<SharedResult>),
}

/// Removes the key on completion or drop
pub struct ActiveUploadGuard {
    key: ActiveKey,
    sender: broadcast::Sender<SharedResult>,
    active: Arc<Mutex<ActiveMap>>,
    completed: bool,
}

impl ActiveUploads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, attachment_id: &str, tier: UploadTier) -> UploadRole {
        let key = (attachment_id.to_string(), tier);
        let mut active = self.active.lock();

        if let Some(sender) = active.get(&key) {
            return UploadRole::Waiter(sender.subscribe());
        }

        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        active.insert(key.clone(), sender.clone());

        UploadRole::Uploader(ActiveUploadGuard {
            key,
            sender,
            active: Arc::clone(&self.active),
            completed: false,
        })
    }

    pub fn is_active(&self, attachment_id: &str, tier: UploadTier) -> bool {
        self.active
            .lock()
            .contains_key(&(attachment_id.to_string(), tier))
    }
}

impl ActiveUploadGuard {
    /// Release the key and hand a copy of `result` to every waiter
    pub fn complete(mut self, result: &Result<UploadResult>) {
        let shared = Arc::new(match result {
            Ok(upload) => Ok(upload.clone()),
            Err(e) => Err(e.duplicate()),
        });

        let mut active = self.active.lock();
        active.remove(&self.key);
        // No receivers is fine
        let _ = self.sender.send(shared);
        self.completed = true;
    }
}

impl Drop for ActiveUploadGuard {
    fn drop(&mut self) {
        if !self.completed {
            // Waiters see the channel close
            self.active.lock().remove(&self.key);
            tracing::debug!(
                attachment_id = %self.key.0,
                tier = %self.key.1,
                "Active upload dropped without a result"
            );
        }
    }
}
