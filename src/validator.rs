use anyhow::{Context, Result};
use image::ImageFormat;
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::ValidationError;
use crate::types::{ImageHandle, MAX_IMAGE_BYTES};

const FALLBACK_MIME: &str = "application/octet-stream";
const READ_LIMIT: u64 = MAX_IMAGE_BYTES as u64;

/// A file as handed over by a picker or drop target, before any checks.
///
/// `size` is the size the source reported. It can exceed `bytes.len()` when
/// an oversized file was never read.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub name: String,
    pub mime: String,
    bytes: Vec<u8>,
    size: u64,
}

impl RawFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reads a file from disk. The declared type comes from the extension,
    /// then from the content's magic bytes.
    ///
    /// Files over [`MAX_IMAGE_BYTES`] are not read; at most one byte past the
    /// limit is ever buffered.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let reported = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        let mut bytes = Vec::new();
        if reported <= READ_LIMIT {
            file.take(READ_LIMIT + 1)
                .read_to_end(&mut bytes)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
        }

        let mime = ImageFormat::from_path(path)
            .or_else(|_| image::guess_format(&bytes))
            .map(|format| format.to_mime_type())
            .unwrap_or(FALLBACK_MIME);

        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let size = reported.max(bytes.len() as u64);
        tracing::debug!(file = %name, mime, size, read = bytes.len(), "Read file from disk");
        Ok(Self {
            name,
            mime: mime.to_string(),
            bytes,
            size,
        })
    }
}

/// Checks size, then declared type. Ownership of the bytes moves into the
/// returned handle.
pub fn validate(file: RawFile) -> Result<ImageHandle, ValidationError> {
    if file.size > READ_LIMIT {
        return Err(ValidationError::TooLarge { size: file.size });
    }
    if !file.mime.starts_with("image/") {
        return Err(ValidationError::NotAnImage { mime: file.mime });
    }
    Ok(ImageHandle::new(file.name, file.mime, file.bytes))
}
