//! Amnesia Render
//!
//! Page rendering coordination for a native rasterizer that may only be
//! called from the thread that initialized it.
//!
//! # Modules
//!
//! - `native`: Affinity-checked gateway around the rasterizer
//! - `render`: Strategies, bitmap cache and the rendering coordinator
//! - `display`: Effective resolution and display change monitoring
//! - `metrics`: Performance samples, classification and export
//! - `engine`: Render-owner thread and the `Send + Sync` engine handle
//! - `config` / `settings`: Environment configuration and runtime settings

pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod native;
pub mod render;
pub mod settings;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use engine::{EngineBuilder, EngineStats, RenderEngine};
pub use error::{RenderError, RenderResult};
