//! File upload collaborator.

use async_trait::async_trait;
use bytes::Bytes;
use parlor_core::UploadedFile;

use crate::error::UploadError;

/// Stores file content and returns the backend's file metadata.
///
/// Uploads run on their own task; the result is fed back into the session on
/// the owner task.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `data` under `file_name`.
    async fn upload(&self, file_name: String, data: Bytes) -> Result<UploadedFile, UploadError>;
}
