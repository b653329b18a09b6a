//! MuPDF rasterizer backend
//!
//! MuPDF documents are `!Send`. Opened documents are kept per identity on the
//! owner thread so repeated page renders do not re-parse the file.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use image::RgbaImage;
use mupdf::{Colorspace, Document, Matrix};

use crate::error::{RenderError, RenderResult};

use super::{DocumentHandle, DocumentSource, Rasterizer, POINTS_PER_INCH};

/// Rasterizer backed by MuPDF
#[derive(Default)]
pub struct MupdfRasterizer {
    documents: RefCell<HashMap<String, Document>>,
}

impl MupdfRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(source: &DocumentSource) -> RenderResult<Document> {
        match source {
            DocumentSource::Bytes(data) => {
                Document::from_bytes(&data[..], mime_from_magic(&data[..])).map_err(Into::into)
            }
            DocumentSource::Path(path) => {
                let path_str = path.to_string_lossy();
                Document::open(&*path_str).map_err(Into::into)
            }
        }
    }

    fn with_document<T>(
        &self,
        handle: &DocumentHandle,
        f: impl FnOnce(&Document) -> RenderResult<T>,
    ) -> RenderResult<T> {
        let mut documents = self.documents.borrow_mut();
        let document = match documents.entry(handle.id().to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::debug!(document_id = handle.id(), "Opening document");
                entry.insert(Self::open(handle.source())?)
            }
        };
        f(document)
    }
}

impl Rasterizer for MupdfRasterizer {
    fn name(&self) -> &'static str {
        "mupdf"
    }

    fn page_count(&self, document: &DocumentHandle) -> RenderResult<usize> {
        self.with_document(document, |doc| Ok(doc.page_count()? as usize))
    }

    fn rasterize(
        &self,
        document: &DocumentHandle,
        page_index: usize,
        dpi: f64,
    ) -> RenderResult<RgbaImage> {
        self.with_document(document, |doc| {
            let page_count = doc.page_count()? as usize;
            if page_index >= page_count {
                return Err(RenderError::PageOutOfRange {
                    page: page_index as u32 + 1,
                    page_count,
                });
            }

            let page = doc.load_page(page_index as i32)?;
            let scale = (dpi / POINTS_PER_INCH) as f32;
            let matrix = Matrix::new_scale(scale, scale);
            let colorspace = Colorspace::device_rgb();

            let pixmap = page
                .to_pixmap(&matrix, &colorspace, true, true)
                .map_err(|e| match RenderError::from(e) {
                    RenderError::OutOfMemory { .. } => RenderError::OutOfMemory { resolution: dpi },
                    other => other,
                })?;

            pixmap_to_rgba(&pixmap)
        })
    }

    fn forget_document(&self, document_id: &str) {
        self.documents.borrow_mut().remove(document_id);
    }

    fn shutdown(&mut self) {
        self.documents.get_mut().clear();
    }
}

/// Guess the MuPDF magic type from leading bytes
fn mime_from_magic(data: &[u8]) -> &'static str {
    if data.starts_with(b"PK") {
        "application/epub+zip"
    } else {
        "application/pdf"
    }
}

fn pixmap_to_rgba(pixmap: &mupdf::Pixmap) -> RenderResult<RgbaImage> {
    samples_to_rgba(
        pixmap.width() as u32,
        pixmap.height() as u32,
        pixmap.n() as usize,
        pixmap.samples(),
    )
}

/// Expand packed RGB or RGBA samples into an RGBA buffer
fn samples_to_rgba(width: u32, height: u32, channels: usize, samples: &[u8]) -> RenderResult<RgbaImage> {
    if !(3..=4).contains(&channels) {
        return Err(RenderError::NativeEngine(format!(
            "unsupported pixmap with {} channels",
            channels
        )));
    }

    let pixels = (width as usize).checked_mul(height as usize);
    let needed = pixels.and_then(|pixels| pixels.checked_mul(channels));
    let (Some(pixels), Some(needed)) = (pixels, needed) else {
        return Err(RenderError::OutOfMemory { resolution: 0.0 });
    };
    if samples.len() < needed {
        return Err(RenderError::NativeEngine(format!(
            "pixmap has {} samples, expected {}",
            samples.len(),
            needed
        )));
    }

    let rgba: Vec<u8> = samples[..needed]
        .chunks_exact(channels)
        .flat_map(|px| [px[0], px[1], px[2], px.get(3).copied().unwrap_or(u8::MAX)])
        .collect();
    debug_assert_eq!(rgba.len(), pixels * 4);

    RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| RenderError::NativeEngine("Pixmap size mismatch".to_string()))
}
