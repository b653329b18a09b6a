//! Rendering strategies and their selection
//!
//! Both strategies rasterize through the gateway; they differ in where the
//! decoded page lives afterwards:
//!
//! - `ResidentBitmap`: RGBA pixels stay in memory (fast redisplay)
//! - `FileBacked`: the page is encoded to PNG in a temporary file and the
//!   pixel buffer is dropped (low memory, batch work)

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::RgbaImage;
use tempfile::NamedTempFile;

use crate::error::{RenderError, RenderResult};
use crate::native::{NativeEngineGateway, Rasterizer};

use super::types::{CacheKey, PageImage, PageRenderRequest, RenderContext, RenderedPage, StrategyKind};

/// Default available-memory floor below which pages go to disk
pub const DEFAULT_LOW_MEMORY_THRESHOLD_MB: u64 = 512;

/// A way of producing a decoded page
#[derive(Debug, Clone, PartialEq)]
pub enum RenderStrategy {
    ResidentBitmap,
    FileBacked {
        /// Directory for temporary files; system default when `None`
        temp_dir: Option<PathBuf>,
    },
}

impl RenderStrategy {
    pub fn from_kind(kind: StrategyKind, temp_dir: Option<&Path>) -> Self {
        match kind {
            StrategyKind::ResidentBitmap => RenderStrategy::ResidentBitmap,
            StrategyKind::FileBacked => RenderStrategy::FileBacked {
                temp_dir: temp_dir.map(Path::to_path_buf),
            },
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            RenderStrategy::ResidentBitmap => StrategyKind::ResidentBitmap,
            RenderStrategy::FileBacked { .. } => StrategyKind::FileBacked,
        }
    }

    /// Rasterize `request` at the resolution carried by `key`
    pub async fn render<R: Rasterizer>(
        &self,
        gateway: &NativeEngineGateway<R>,
        request: &PageRenderRequest,
        key: &CacheKey,
    ) -> RenderResult<RenderedPage> {
        let started = Instant::now();
        let dpi = key.resolution();
        let page_index = request.page_index();

        let bitmap = gateway
            .execute_async(|engine| engine.rasterize(&request.document, page_index, dpi))
            .await
            .map_err(|e| match e {
                RenderError::OutOfMemory { .. } => RenderError::OutOfMemory { resolution: dpi },
                other => other,
            })?;

        let (width, height) = bitmap.dimensions();
        let image = match self {
            RenderStrategy::ResidentBitmap => PageImage::Resident(bitmap),
            RenderStrategy::FileBacked { temp_dir } => write_temp_png(&bitmap, temp_dir.as_deref())?,
        };

        let render_time = started.elapsed();
        tracing::debug!(
            key = %key,
            strategy = %self.kind(),
            width,
            height,
            render_ms = render_time.as_millis() as u64,
            "Rendered page"
        );

        Ok(RenderedPage::new(
            key.clone(),
            image,
            width,
            height,
            render_time,
            self.kind(),
        ))
    }
}

/// Encode to PNG in a temporary file; the pixel buffer is dropped by the caller
fn write_temp_png(bitmap: &RgbaImage, temp_dir: Option<&Path>) -> RenderResult<PageImage> {
    let mut output = Vec::new();
    bitmap.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)?;

    let mut builder = tempfile::Builder::new();
    builder.prefix("amnesia-page-").suffix(".png");
    let mut file: NamedTempFile = match temp_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    file.write_all(&output)?;
    file.flush()?;

    Ok(PageImage::FileBacked {
        file,
        len: output.len() as u64,
    })
}

/// Inputs to strategy selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionInputs {
    pub context: RenderContext,
    /// `None` when the platform cannot tell
    pub available_memory_mb: Option<u64>,
    pub low_memory_threshold_mb: u64,
}

/// Pick a strategy.
///
/// Batch work and low-memory conditions go to disk; everything else stays
/// resident, including when available memory is unknown.
pub fn select_strategy(inputs: SelectionInputs) -> StrategyKind {
    if inputs.context == RenderContext::Batch {
        return StrategyKind::FileBacked;
    }
    match inputs.available_memory_mb {
        Some(available) if available < inputs.low_memory_threshold_mb => StrategyKind::FileBacked,
        _ => StrategyKind::ResidentBitmap,
    }
}

/// Source of the available-memory figure used for selection
pub trait MemoryProbe {
    fn available_memory_mb(&self) -> Option<u64>;
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for Box<P> {
    fn available_memory_mb(&self) -> Option<u64> {
        (**self).available_memory_mb()
    }
}

/// Reads the operating system's available memory
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn available_memory_mb(&self) -> Option<u64> {
        system_available_memory_mb()
    }
}

#[cfg(target_os = "linux")]
fn system_available_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available_kb(&meminfo).map(|kb| kb / 1024)
}

#[cfg(not(target_os = "linux"))]
fn system_available_memory_mb() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mem_available_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Constant answer, for tests and hosts that track memory themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMemoryProbe(pub Option<u64>);

impl MemoryProbe for FixedMemoryProbe {
    fn available_memory_mb(&self) -> Option<u64> {
        self.0
    }
}
