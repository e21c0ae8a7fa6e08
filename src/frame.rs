use crate::error::{RelayError, Result};
use bytes::Bytes;
use std::path::Path;

/// Bundled placeholder image served to clients while the upstream camera is
/// timing out.
pub static DEFAULT_TIMEOUT_IMAGE: &[u8] = include_bytes!("../assets/timeout.jpg");

/// A single frame in a video stream: opaque image bytes plus a MIME content
/// type, typically `image/jpeg`.
///
/// Frames compare by value. Clones share the underlying bytes, so a frame
/// held by the ring buffer and by any number of subscriber cursors costs one
/// allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    content_type: String,
}

impl Frame {
    /// Create a frame from raw image bytes and a content type.
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }

    /// Load a frame from an image file, guessing the content type from the
    /// file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content_type = mime_guess::from_path(path)
            .first_raw()
            .ok_or_else(|| RelayError::UnknownContentType {
                path: path.display().to_string(),
            })?;
        let data = std::fs::read(path)?;
        Ok(Self::new(data, content_type))
    }

    /// The bundled placeholder frame.
    pub fn timeout_placeholder() -> Self {
        Self::new(Bytes::from_static(DEFAULT_TIMEOUT_IMAGE), "image/jpeg")
    }

    /// Raw image bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// MIME content type of the image bytes.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
