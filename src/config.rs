//! Configuration management for the render engine

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::display::{RenderingQuality, DEFAULT_DEBOUNCE_WINDOW, DEFAULT_SIGNIFICANCE_THRESHOLD};
use crate::error::ConfigError;
use crate::metrics::DEFAULT_METRICS_CAPACITY;
use crate::render::{DEFAULT_CACHE_CAPACITY, DEFAULT_LOW_MEMORY_THRESHOLD_MB};
use crate::settings::RenderSettings;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    pub render: RenderConfig,
    pub display: DisplayConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RenderConfig {
    pub cache_capacity: usize,
    pub max_concurrent: usize,
    /// `None` disables the coordinator timeout
    pub timeout: Option<Duration>,
    pub cache_max_age: Option<Duration>,
    pub quality: RenderingQuality,
    pub adaptive_quality: bool,
    pub low_memory_threshold_mb: u64,
    pub temp_dir: Option<PathBuf>,
    /// Resolution factor for the single out-of-memory retry
    pub oom_retry_scale: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DisplayConfig {
    pub debounce: Duration,
    pub change_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricsConfig {
    pub capacity: usize,
    pub enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            render: RenderConfig {
                cache_capacity: DEFAULT_CACHE_CAPACITY,
                max_concurrent: 4,
                timeout: Some(Duration::from_secs(30)),
                cache_max_age: None,
                quality: RenderingQuality::Auto,
                adaptive_quality: true,
                low_memory_threshold_mb: DEFAULT_LOW_MEMORY_THRESHOLD_MB,
                temp_dir: None,
                oom_retry_scale: 0.5,
            },
            display: DisplayConfig {
                debounce: DEFAULT_DEBOUNCE_WINDOW,
                change_threshold: DEFAULT_SIGNIFICANCE_THRESHOLD,
            },
            metrics: MetricsConfig {
                capacity: DEFAULT_METRICS_CAPACITY,
                enabled: true,
            },
        }
    }
}

impl EngineConfig {
    /// Read `RENDER_*`, `DISPLAY_*` and `METRICS_*` variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env` with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();
        let get = |var: &'static str| lookup(var).filter(|value| !value.trim().is_empty());

        let timeout = match get("RENDER_TIMEOUT_SECS") {
            Some(value) => match parse::<u64>("RENDER_TIMEOUT_SECS", &value)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => defaults.render.timeout,
        };

        let config = EngineConfig {
            render: RenderConfig {
                cache_capacity: parse_or(&get, "RENDER_CACHE_CAPACITY", defaults.render.cache_capacity)?,
                max_concurrent: parse_or(&get, "RENDER_MAX_CONCURRENT", defaults.render.max_concurrent)?,
                timeout,
                cache_max_age: get("RENDER_CACHE_MAX_AGE_SECS")
                    .map(|value| parse::<u64>("RENDER_CACHE_MAX_AGE_SECS", &value))
                    .transpose()?
                    .map(Duration::from_secs),
                quality: parse_or(&get, "RENDER_QUALITY", defaults.render.quality)?,
                adaptive_quality: parse_or(&get, "RENDER_ADAPTIVE_QUALITY", defaults.render.adaptive_quality)?,
                low_memory_threshold_mb: parse_or(
                    &get,
                    "RENDER_LOW_MEMORY_MB",
                    defaults.render.low_memory_threshold_mb,
                )?,
                temp_dir: get("RENDER_TEMP_DIR").map(PathBuf::from),
                oom_retry_scale: parse_or(&get, "RENDER_OOM_RETRY_SCALE", defaults.render.oom_retry_scale)?,
            },
            display: DisplayConfig {
                debounce: Duration::from_millis(parse_or(
                    &get,
                    "DISPLAY_DEBOUNCE_MS",
                    defaults.display.debounce.as_millis() as u64,
                )?),
                change_threshold: parse_or(
                    &get,
                    "DISPLAY_CHANGE_THRESHOLD",
                    defaults.display.change_threshold,
                )?,
            },
            metrics: MetricsConfig {
                capacity: parse_or(&get, "METRICS_CAPACITY", defaults.metrics.capacity)?,
                enabled: parse_or(&get, "METRICS_ENABLED", defaults.metrics.enabled)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |var: &'static str, value: String| ConfigError::Invalid { var, value };

        if self.render.cache_capacity == 0 {
            return Err(invalid("RENDER_CACHE_CAPACITY", "0".to_string()));
        }
        if self.render.max_concurrent == 0 {
            return Err(invalid("RENDER_MAX_CONCURRENT", "0".to_string()));
        }
        let scale = self.render.oom_retry_scale;
        if !(scale > 0.0 && scale < 1.0) {
            return Err(invalid("RENDER_OOM_RETRY_SCALE", scale.to_string()));
        }
        let threshold = self.display.change_threshold;
        if !(threshold.is_finite() && threshold >= 0.0) {
            return Err(invalid("DISPLAY_CHANGE_THRESHOLD", threshold.to_string()));
        }
        if self.metrics.capacity == 0 {
            return Err(invalid("METRICS_CAPACITY", "0".to_string()));
        }
        Ok(())
    }

    /// Initial values for the in-process settings store
    pub fn settings(&self) -> RenderSettings {
        RenderSettings {
            quality: self.render.quality,
            adaptive_quality: self.render.adaptive_quality,
            metrics_enabled: self.metrics.enabled,
        }
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&'static str) -> Option<String>,
{
    match get(var) {
        Some(value) => parse(var, &value),
        None => Ok(default),
    }
}
