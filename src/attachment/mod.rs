//! Attachments owned by the host application
//!
//! The upload engine reads attachment state and writes back where the bytes
//! ended up. Storage of the attachment rows themselves is external.

mod types;

pub use types::*;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn fetch(&self, attachment_id: &str) -> Result<Option<Attachment>>;

    async fn set_transit_info(&self, attachment_id: &str, info: TransitTierInfo) -> Result<()>;

    /// Forget a transit upload the server no longer has
    async fn clear_transit_info(&self, attachment_id: &str) -> Result<()>;

    async fn set_media_info(&self, attachment_id: &str, info: MediaTierInfo) -> Result<()>;

    async fn set_thumbnail_info(&self, attachment_id: &str, info: MediaTierInfo) -> Result<()>;

    /// Drop the local stream; the attachment can no longer be uploaded
    async fn mark_file_missing(&self, attachment_id: &str) -> Result<()>;

    /// Notify messages and other owners that the attachment changed
    async fn touch_owners(&self, attachment_id: &str) -> Result<()>;
}
