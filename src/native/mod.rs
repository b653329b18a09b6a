//! Native rasterizer access
//!
//! This module provides a thread-aware wrapper around the native
//! rasterization library.
//!
//! # Thread Safety
//!
//! The native library is **NOT thread-safe**. It must only ever be called
//! from the thread that initialized it. This module addresses this via:
//!
//! 1. **Rasterizer**: the narrow trait every backend implements
//! 2. **NativeEngineGateway**: owns the backend and the owner thread identity;
//!    every call asserts affinity before touching native code
//! 3. **Cooperative async**: `execute_async` yields, then runs inline on the
//!    same thread instead of hopping to a worker
//!
//! # Usage
//!
//! ```rust,ignore
//! use amnesia_render::native::{DocumentHandle, NativeEngineGateway};
//!
//! // On the render-owner thread
//! let gateway = NativeEngineGateway::initialize(MupdfRasterizer::new());
//!
//! let doc = DocumentHandle::from_path("book.pdf");
//! let bitmap = gateway
//!     .execute_async(|engine| engine.rasterize(&doc, 0, 144.0))
//!     .await?;
//! ```

mod gateway;
#[cfg(feature = "mupdf-backend")]
mod mupdf_backend;
mod rasterizer;

pub use gateway::{AffinityGuard, NativeEngineGateway};
#[cfg(feature = "mupdf-backend")]
pub use mupdf_backend::MupdfRasterizer;
pub use rasterizer::{DocumentHandle, DocumentSource, Rasterizer, POINTS_PER_INCH};
