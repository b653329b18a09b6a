//! Display change monitoring
//!
//! Host display notifications arrive in bursts (window drags across monitors,
//! DPI settings being dragged). They are turned into a stream of
//! `DisplayInfo` by two independent stages:
//!
//! ```text
//! host signals ──▶ debounce(window) ──▶ SignificanceFilter ──▶ DisplayInfo
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;

use super::resolution::{
    calculate_effective_resolution, DisplayInfo, RenderingQuality, SignificanceFilter,
    DEFAULT_SIGNIFICANCE_THRESHOLD,
};

/// Default debounce window for display signals
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Windowing-layer display context
pub trait HostDisplayContext: Send + Sync {
    /// Current rasterization scale
    fn rasterization_scale(&self) -> f64;

    /// Raw scale-change notifications
    fn subscribe(&self) -> BoxStream<'static, f64>;
}

/// Channel-backed host adapter.
///
/// The windowing layer calls [`DisplaySignalSource::signal`] from its event
/// handler; every subscriber receives the raw value.
pub struct DisplaySignalSource {
    scale: Mutex<f64>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<f64>>>,
}

impl DisplaySignalSource {
    pub fn new(initial_scale: f64) -> Arc<Self> {
        Arc::new(Self {
            scale: Mutex::new(initial_scale),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Record a new scale and notify subscribers
    pub fn signal(&self, scale: f64) {
        *self.scale.lock() = scale;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.unbounded_send(scale).is_ok());
    }

    /// Live subscriber count
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl HostDisplayContext for DisplaySignalSource {
    fn rasterization_scale(&self) -> f64 {
        *self.scale.lock()
    }

    fn subscribe(&self) -> BoxStream<'static, f64> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx.boxed()
    }
}

/// Trailing-edge debounce: emits the last item of a burst once `window`
/// passes without a new item. The final pending item is flushed when the
/// input ends.
pub fn debounce<S>(input: S, window: Duration) -> impl Stream<Item = S::Item>
where
    S: Stream + Unpin,
{
    stream::unfold(Some(input), move |state| async move {
        let Some(mut input) = state else {
            return None;
        };
        let Some(mut pending) = input.next().await else {
            return None;
        };
        loop {
            match tokio::time::timeout(window, input.next()).await {
                Ok(Some(next)) => pending = next,
                Ok(None) => return Some((pending, None)),
                Err(_) => return Some((pending, Some(input))),
            }
        }
    })
}

/// Composes debounce and significance filtering over a host context
#[derive(Debug, Clone)]
pub struct DisplayMonitor {
    pub debounce_window: Duration,
    pub threshold: f64,
    /// Zoom used to judge significance
    pub zoom: f64,
    /// Quality used to judge significance
    pub quality: RenderingQuality,
}

impl Default for DisplayMonitor {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            threshold: DEFAULT_SIGNIFICANCE_THRESHOLD,
            zoom: 1.0,
            quality: RenderingQuality::Auto,
        }
    }
}

impl DisplayMonitor {
    pub fn new(debounce_window: Duration, threshold: f64) -> Self {
        Self {
            debounce_window,
            threshold,
            ..Self::default()
        }
    }

    /// Debounced, significance-filtered display changes.
    ///
    /// The baseline is the host's scale at subscription time.
    pub fn observe(&self, host: &dyn HostDisplayContext) -> BoxStream<'static, DisplayInfo> {
        let zoom = self.zoom;
        let quality = self.quality;
        let baseline = DisplayInfo::new(host.rasterization_scale());
        let mut filter = SignificanceFilter::new(self.threshold)
            .with_baseline(calculate_effective_resolution(&baseline, zoom, quality));

        debounce(host.subscribe(), self.debounce_window)
            .filter_map(move |scale| {
                let info = DisplayInfo::new(scale);
                let resolution = calculate_effective_resolution(&info, zoom, quality);
                let changed = filter.observe(resolution);
                if changed {
                    tracing::debug!(
                        scale = info.rasterization_scale,
                        resolution,
                        "Display change propagated"
                    );
                }
                futures::future::ready(changed.then_some(info))
            })
            .boxed()
    }
}
