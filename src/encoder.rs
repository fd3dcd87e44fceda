use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::EncodeError;
use crate::types::{EncodedPayload, ImageHandle};

#[async_trait]
pub trait ImageEncoder: Send + Sync {
    async fn encode(&self, image: ImageHandle) -> Result<EncodedPayload, EncodeError>;
}

/// Base64-encodes images off the async runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Encoder;

#[async_trait]
impl ImageEncoder for Base64Encoder {
    #[tracing::instrument(skip(self, image), fields(file = %image.name(), size = image.size()))]
    async fn encode(&self, image: ImageHandle) -> Result<EncodedPayload, EncodeError> {
        let encoded = tokio::task::spawn_blocking(move || STANDARD.encode(image.bytes()))
            .await
            .map_err(|e| EncodeError(format!("encoder task failed: {e}")))?;

        let body = strip_data_uri(&encoded);
        tracing::debug!(encoded_len = body.len(), "Image encoded");

        EncodedPayload::new(body.to_string())
            .ok_or_else(|| EncodeError("image has no content".into()))
    }
}

/// Drops a `data:<type>;base64,` prefix, up to and including its first `,`.
/// Anything not starting with `data:` is already a bare body and is returned
/// unchanged; `:` is outside the base64 alphabet, so the two never collide.
pub fn strip_data_uri(encoded: &str) -> &str {
    match encoded.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((_, body)) => body,
        None => encoded,
    }
}
