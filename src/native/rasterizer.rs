//! Rasterizer seam and document handles
//!
//! The gateway drives a `Rasterizer`; everything behind that trait is native
//! code that must stay on the thread that created it. Implementations are
//! free to be `!Send`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbaImage;
use sha2::{Digest, Sha256};

use crate::error::RenderResult;

/// PDF points per inch; rasterizers scale by `dpi / POINTS_PER_INCH`
pub const POINTS_PER_INCH: f64 = 72.0;

/// Source data for a document
#[derive(Clone)]
pub enum DocumentSource {
    /// Document loaded from owned bytes
    Bytes(Arc<Vec<u8>>),
    /// Document loaded from a file path
    Path(PathBuf),
}

impl DocumentSource {
    /// Create source from bytes
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::Bytes(Arc::new(data))
    }

    /// Create source from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }
}

impl fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentSource::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            DocumentSource::Path(path) => write!(f, "Path({})", path.display()),
        }
    }
}

/// Handle to a document owned by the external document service.
///
/// Cheap to clone. The engine reads through it but never closes it.
#[derive(Clone, Debug)]
pub struct DocumentHandle {
    id: Arc<str>,
    source: DocumentSource,
}

impl DocumentHandle {
    /// Create a handle with an explicit identity
    pub fn new(id: impl Into<Arc<str>>, source: DocumentSource) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }

    /// Create a handle from bytes; identity is the SHA-256 of the content
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let id = hex::encode(Sha256::digest(&data));
        Self::new(id, DocumentSource::from_bytes(data))
    }

    /// Create a handle from a path; identity is the path as given
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::new(path.to_string_lossy().into_owned(), DocumentSource::from_path(path))
    }

    /// Document identity used in cache keys
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Underlying source
    pub fn source(&self) -> &DocumentSource {
        &self.source
    }
}

/// Native rasterization library as seen by the gateway.
///
/// Every method is only ever called on the gateway's owner thread.
pub trait Rasterizer {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Number of pages in the document
    fn page_count(&self, document: &DocumentHandle) -> RenderResult<usize>;

    /// Rasterize a 0-based page at the given resolution (dots per inch).
    ///
    /// Out-of-memory conditions must be reported as
    /// `RenderError::OutOfMemory` so the coordinator can retry smaller.
    fn rasterize(
        &self,
        document: &DocumentHandle,
        page_index: usize,
        dpi: f64,
    ) -> RenderResult<RgbaImage>;

    /// Release native state for one document (optional)
    fn forget_document(&self, _document_id: &str) {}

    /// Tear down the native library. Called once, on the owner thread.
    fn shutdown(&mut self) {}
}
