//! Render request and result types

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::display::RenderingQuality;
use crate::error::{RenderError, RenderResult};
use crate::native::DocumentHandle;

/// Per-request cancellation signal.
///
/// Clones share the same flag. Cancelling only affects the waiter that
/// carries the signal; deduplicated work keeps running for everyone else.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scheduling hint supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderContext {
    /// On-screen page the user is looking at
    #[default]
    Interactive,
    /// Export, thumbnails, prefetch
    Batch,
}

/// A request to render one page
#[derive(Debug, Clone)]
pub struct PageRenderRequest {
    pub document: DocumentHandle,
    /// 1-based page number
    pub page_number: u32,
    pub zoom: f64,
    /// Overrides the settings provider when set
    pub quality: Option<RenderingQuality>,
    pub context: RenderContext,
    pub cancel: CancelSignal,
}

impl PageRenderRequest {
    pub fn new(document: DocumentHandle, page_number: u32, zoom: f64) -> Self {
        Self {
            document,
            page_number,
            zoom,
            quality: None,
            context: RenderContext::default(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_quality(mut self, quality: RenderingQuality) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_context(mut self, context: RenderContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// 0-based index handed to the rasterizer
    pub fn page_index(&self) -> usize {
        self.page_number.saturating_sub(1) as usize
    }

    /// Reject malformed requests before any work is scheduled
    pub fn validate(&self) -> RenderResult<()> {
        if self.page_number == 0 {
            return Err(RenderError::InvalidRequest(
                "page numbers start at 1".to_string(),
            ));
        }
        if !self.zoom.is_finite() || self.zoom <= 0.0 {
            return Err(RenderError::InvalidRequest(format!(
                "zoom must be a positive number, got {}",
                self.zoom
            )));
        }
        Ok(())
    }
}

/// Cache key for rendered pages
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub document_id: Arc<str>,
    pub page_number: u32,
    pub resolution_bucket: u32, // Resolution * 100 as integer for hashing
}

impl CacheKey {
    pub fn new(document_id: &str, page_number: u32, resolution: f64) -> Self {
        Self {
            document_id: Arc::from(document_id),
            page_number,
            resolution_bucket: Self::bucket(resolution),
        }
    }

    fn bucket(resolution: f64) -> u32 {
        (resolution * 100.0).round() as u32
    }

    /// Resolution this key was built for, in dpi
    pub fn resolution(&self) -> f64 {
        f64::from(self.resolution_bucket) / 100.0
    }

    /// Same document and page at another resolution
    pub fn with_resolution(&self, resolution: f64) -> Self {
        Self {
            document_id: Arc::clone(&self.document_id),
            page_number: self.page_number,
            resolution_bucket: Self::bucket(resolution),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id: &str = &self.document_id;
        let short = id.get(..12).unwrap_or(id);
        write!(f, "{}#{}@{:.2}dpi", short, self.page_number, self.resolution())
    }
}

/// Strategy that produced a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    ResidentBitmap,
    FileBacked,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::ResidentBitmap => f.write_str("resident"),
            StrategyKind::FileBacked => f.write_str("file-backed"),
        }
    }
}

/// Backing storage of a rendered page
pub enum PageImage {
    /// Decoded RGBA pixels kept in memory
    Resident(RgbaImage),
    /// PNG in a temporary file, deleted on release
    FileBacked { file: NamedTempFile, len: u64 },
}

impl PageImage {
    /// Bytes held in memory
    pub fn resident_bytes(&self) -> usize {
        match self {
            PageImage::Resident(bitmap) => bitmap.as_raw().len(),
            PageImage::FileBacked { .. } => 0,
        }
    }

    /// Tear the backing resource down now.
    ///
    /// For file-backed pages the temporary file is closed and deleted; any
    /// stream opened earlier keeps its own handle.
    pub fn release(self) -> io::Result<()> {
        match self {
            PageImage::Resident(bitmap) => {
                drop(bitmap);
                Ok(())
            }
            PageImage::FileBacked { file, .. } => file.close(),
        }
    }
}

impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageImage::Resident(bitmap) => {
                write!(f, "Resident({}x{})", bitmap.width(), bitmap.height())
            }
            PageImage::FileBacked { file, len } => {
                write!(f, "FileBacked({}, {} bytes)", file.path().display(), len)
            }
        }
    }
}

/// A decoded page as stored in the cache
#[derive(Debug)]
pub struct RenderedPage {
    pub key: CacheKey,
    pub width: u32,
    pub height: u32,
    pub image: PageImage,
    pub created_at: DateTime<Utc>,
    pub render_time: Duration,
    pub strategy: StrategyKind,
    rendered_at: Instant,
}

impl RenderedPage {
    pub fn new(
        key: CacheKey,
        image: PageImage,
        width: u32,
        height: u32,
        render_time: Duration,
        strategy: StrategyKind,
    ) -> Self {
        Self {
            key,
            width,
            height,
            image,
            created_at: Utc::now(),
            render_time,
            strategy,
            rendered_at: Instant::now(),
        }
    }

    /// Time since the page was produced
    pub fn age(&self) -> Duration {
        self.rendered_at.elapsed()
    }

    pub fn resident_bytes(&self) -> usize {
        self.image.resident_bytes()
    }

    /// Open a PNG byte stream over the page
    pub fn open_stream(&self) -> RenderResult<ImageStream> {
        match &self.image {
            PageImage::Resident(bitmap) => {
                let mut output = Vec::new();
                bitmap.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)?;
                Ok(ImageStream::Memory(Cursor::new(output)))
            }
            PageImage::FileBacked { file, .. } => Ok(ImageStream::File(file.reopen()?)),
        }
    }

    /// Consume the page and release its backing resource
    pub fn release(self) -> io::Result<()> {
        self.image.release()
    }
}

/// Readable PNG stream over a rendered page
#[derive(Debug)]
pub enum ImageStream {
    Memory(Cursor<Vec<u8>>),
    File(File),
}

impl ImageStream {
    /// Read the whole stream into memory
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for ImageStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ImageStream::Memory(cursor) => cursor.read(buf),
            ImageStream::File(file) => file.read(buf),
        }
    }
}

/// Per-key render state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderState {
    Queued,
    InFlight,
    Completed,
    Cancelled,
    Failed,
}

impl RenderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RenderState::Completed | RenderState::Cancelled | RenderState::Failed
        )
    }

    /// Queued -> InFlight -> {Completed | Cancelled | Failed};
    /// Queued may also end directly in Cancelled or Failed.
    pub fn can_transition_to(self, next: RenderState) -> bool {
        use RenderState::*;
        matches!(
            (self, next),
            (Queued, InFlight)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (InFlight, Completed)
                | (InFlight, Cancelled)
                | (InFlight, Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::io::Write;

    fn key() -> CacheKey {
        CacheKey::new("doc-1", 3, 144.0)
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        assert_eq!(key(), CacheKey::new("doc-1", 3, 144.0));
        assert_ne!(key(), CacheKey::new("doc-1", 3, 144.5));
        assert_eq!(CacheKey::new("doc-1", 3, 144.001), key());
        assert_eq!(key().resolution(), 144.0);
        assert_eq!(key().with_resolution(72.0).resolution(), 72.0);
    }

    #[test]
    fn test_request_validation() {
        let doc = DocumentHandle::from_bytes(b"%PDF".to_vec());
        assert!(PageRenderRequest::new(doc.clone(), 1, 1.0).validate().is_ok());
        assert!(matches!(
            PageRenderRequest::new(doc.clone(), 0, 1.0).validate(),
            Err(RenderError::InvalidRequest(_))
        ));
        assert!(PageRenderRequest::new(doc.clone(), 1, 0.0).validate().is_err());
        assert!(PageRenderRequest::new(doc, 1, f64::NAN).validate().is_err());
    }

    #[tokio::test]
    async fn test_cancel_signal_is_shared_between_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_cancelled());

        signal.cancel();
        assert!(clone.is_cancelled());
        // Already fired: resolves immediately
        clone.cancelled().await;
    }

    #[test]
    fn test_state_transitions() {
        use RenderState::*;
        assert!(Queued.can_transition_to(InFlight));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(InFlight.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InFlight));
        assert!(!InFlight.can_transition_to(Queued));
        assert!(Failed.is_terminal());
        assert!(!InFlight.is_terminal());
    }

    #[test]
    fn test_resident_stream_is_png() {
        let bitmap = RgbaImage::from_pixel(4, 2, Rgba([10, 20, 30, 255]));
        let page = RenderedPage::new(
            key(),
            PageImage::Resident(bitmap),
            4,
            2,
            Duration::from_millis(3),
            StrategyKind::ResidentBitmap,
        );

        assert_eq!(page.resident_bytes(), 4 * 2 * 4);
        let bytes = page.open_stream().unwrap().into_bytes().unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_file_backed_release_deletes_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not really a png").unwrap();
        let path = file.path().to_path_buf();
        let page = RenderedPage::new(
            key(),
            PageImage::FileBacked { file, len: 16 },
            1,
            1,
            Duration::ZERO,
            StrategyKind::FileBacked,
        );

        let stream = page.open_stream().unwrap();
        page.release().unwrap();
        assert!(!path.exists());
        // The open stream keeps its own handle
        assert_eq!(stream.into_bytes().unwrap(), b"not really a png");
    }
}
