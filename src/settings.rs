//! Settings consumed by the engine
//!
//! The engine only reads settings; persisting them is the host's job.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::display::RenderingQuality;

/// Read side of the host's settings store
pub trait SettingsProvider: Send + Sync {
    /// Preferred rendering quality
    fn quality(&self) -> RenderingQuality;

    /// Whether quality may be stepped down under pressure
    fn adaptive_quality(&self) -> bool;

    /// Whether performance samples are collected
    fn metrics_enabled(&self) -> bool;
}

/// Plain settings values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSettings {
    pub quality: RenderingQuality,
    pub adaptive_quality: bool,
    pub metrics_enabled: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            quality: RenderingQuality::Auto,
            adaptive_quality: true,
            metrics_enabled: true,
        }
    }
}

/// In-process settings store that can be updated at runtime
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<RenderSettings>,
}

impl SharedSettings {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> RenderSettings {
        *self.inner.read()
    }

    /// Apply a change atomically
    pub fn update(&self, change: impl FnOnce(&mut RenderSettings)) {
        let mut settings = self.inner.write();
        change(&mut settings);
        tracing::debug!(settings = ?*settings, "Render settings updated");
    }
}

impl SettingsProvider for SharedSettings {
    fn quality(&self) -> RenderingQuality {
        self.inner.read().quality
    }

    fn adaptive_quality(&self) -> bool {
        self.inner.read().adaptive_quality
    }

    fn metrics_enabled(&self) -> bool {
        self.inner.read().metrics_enabled
    }
}
