use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Hands an image URL to external storage and returns the URL to persist.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload(&self, property_id: Uuid, original_url: &str, position: usize) -> Result<String>;
}

/// Keeps the source URL as the stored URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughUploader;

#[async_trait]
impl ImageUploader for PassthroughUploader {
    async fn upload(&self, _property_id: Uuid, original_url: &str, _position: usize) -> Result<String> {
        Ok(original_url.to_string())
    }
}
