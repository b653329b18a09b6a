//! Test doubles shared by the unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::error::{RenderError, RenderResult};
use crate::native::{DocumentHandle, Rasterizer};

/// One recorded native call
#[derive(Debug, Clone)]
pub(crate) struct RasterCall {
    pub thread: ThreadId,
    pub document_id: String,
    pub page_index: usize,
    pub dpi: f64,
}

/// Scripted failure for an upcoming rasterize call
#[derive(Debug, Clone)]
pub(crate) enum ScriptedFailure {
    Native(String),
    OutOfMemory,
    /// The native call unwinds with this message
    Panic(String),
}

#[derive(Default)]
struct Shared {
    calls: Vec<RasterCall>,
    failures: VecDeque<ScriptedFailure>,
    /// Failures reserved for the first call at a given dpi
    failures_at: Vec<(f64, ScriptedFailure)>,
    shut_down: bool,
}

/// Rasterizer that records the calling thread of every native call
pub(crate) struct FakeRasterizer {
    page_count: usize,
    shared: Arc<Mutex<Shared>>,
}

/// Inspection side of a `FakeRasterizer`
#[derive(Clone)]
pub(crate) struct FakeProbe {
    shared: Arc<Mutex<Shared>>,
}

impl FakeRasterizer {
    pub fn new(page_count: usize) -> (Self, FakeProbe) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                page_count,
                shared: Arc::clone(&shared),
            },
            FakeProbe { shared },
        )
    }
}

impl FakeProbe {
    pub fn calls(&self) -> Vec<RasterCall> {
        self.shared.lock().calls.clone()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.shared.lock().calls.iter().map(|c| c.thread).collect()
    }

    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.shared.lock().failures.push_back(failure);
    }

    /// Fail the first rasterize call made at `dpi`, whatever its order
    pub fn fail_at(&self, dpi: f64, failure: ScriptedFailure) {
        self.shared.lock().failures_at.push((dpi, failure));
    }

    pub fn dpis(&self) -> Vec<f64> {
        self.shared.lock().calls.iter().map(|c| c.dpi).collect()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }
}

impl Rasterizer for FakeRasterizer {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn page_count(&self, _document: &DocumentHandle) -> RenderResult<usize> {
        Ok(self.page_count)
    }

    fn rasterize(
        &self,
        document: &DocumentHandle,
        page_index: usize,
        dpi: f64,
    ) -> RenderResult<RgbaImage> {
        let failure = {
            let mut shared = self.shared.lock();
            shared.calls.push(RasterCall {
                thread: thread::current().id(),
                document_id: document.id().to_string(),
                page_index,
                dpi,
            });

            if page_index >= self.page_count {
                return Err(RenderError::PageOutOfRange {
                    page: page_index as u32 + 1,
                    page_count: self.page_count,
                });
            }

            match shared.failures_at.iter().position(|(at, _)| *at == dpi) {
                Some(index) => Some(shared.failures_at.remove(index).1),
                None => shared.failures.pop_front(),
            }
        };

        match failure {
            Some(ScriptedFailure::Native(message)) => Err(RenderError::NativeEngine(message)),
            Some(ScriptedFailure::OutOfMemory) => Err(RenderError::OutOfMemory { resolution: dpi }),
            Some(ScriptedFailure::Panic(message)) => panic!("{}", message),
            None => {
                // A US-letter page is 8.5in wide; shrink 10x to keep tests light
                let width = ((8.5 * dpi) / 10.0).ceil().max(1.0) as u32;
                let height = ((11.0 * dpi) / 10.0).ceil().max(1.0) as u32;
                Ok(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])))
            }
        }
    }

    fn shutdown(&mut self) {
        self.shared.lock().shut_down = true;
    }
}
