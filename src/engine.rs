//! Render engine host
//!
//! Owns the render-owner thread. The native library is initialized on that
//! thread and never leaves it; the rest of the application talks to it
//! through a `Send + Sync` [`RenderEngine`] handle.
//!
//! ```text
//!  callers (any thread)                 render-owner thread
//! ┌──────────────────┐   mpsc    ┌───────────────────────────────────┐
//! │ RenderEngine     │──────────▶│ current-thread runtime + LocalSet │
//! │  submit()        │           │   RenderCoordinator               │
//! │  render_page()   │◀──────────│     BitmapCache                   │
//! │  stats() ...     │  oneshot  │     NativeEngineGateway ─▶ native │
//! └──────────────────┘           └───────────────────────────────────┘
//!          │
//!          └── MetricsCollector (shared, lock-light)
//! ```

use std::path::Path;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

use crate::config::EngineConfig;
use crate::display::{DisplayInfo, DisplayMonitor, HostDisplayContext, RenderingQuality};
use crate::error::{ExportError, RenderError, RenderResult};
use crate::metrics::{ExportFormat, MetricsCollector, PerformanceLevel, PerformanceSample};
use crate::native::{DocumentHandle, NativeEngineGateway, Rasterizer};
use crate::render::{
    BitmapCache, CoordinatorConfig, CoordinatorStats, ImageStream, MemoryProbe,
    PageRenderRequest, RenderCoordinator, RenderedPage, SystemMemoryProbe,
};
use crate::settings::{SettingsProvider, SharedSettings};

const OWNER_THREAD_NAME: &str = "render-owner";

/// Requests forwarded to the owner thread
enum Command {
    Render {
        request: PageRenderRequest,
        reply: oneshot::Sender<RenderResult<Arc<RenderedPage>>>,
    },
    PageCount {
        document: DocumentHandle,
        reply: oneshot::Sender<RenderResult<usize>>,
    },
    SetDisplay(DisplayInfo),
    RemoveDocument {
        document_id: String,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<(CoordinatorStats, DisplayInfo)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Engine-wide statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub render: CoordinatorStats,
    pub display: DisplayInfo,
    pub metrics_samples: usize,
    pub performance_level: PerformanceLevel,
}

/// Builder for [`RenderEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    settings: Option<Arc<dyn SettingsProvider>>,
    host: Option<Arc<dyn HostDisplayContext>>,
    memory_probe: Option<Box<dyn MemoryProbe + Send>>,
}

impl EngineBuilder {
    /// Settings provider; defaults to a `SharedSettings` seeded from config
    pub fn settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Windowing-layer display context to follow
    pub fn display_host(mut self, host: Arc<dyn HostDisplayContext>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn memory_probe(mut self, probe: impl MemoryProbe + Send + 'static) -> Self {
        self.memory_probe = Some(Box::new(probe));
        self
    }

    /// Spawn the owner thread, run `init` on it and wait until the native
    /// engine is ready.
    pub fn start<R, F>(self, init: F) -> RenderResult<RenderEngine>
    where
        R: Rasterizer + 'static,
        F: FnOnce() -> RenderResult<R> + Send + 'static,
    {
        let EngineBuilder {
            config,
            settings,
            host,
            memory_probe,
        } = self;

        let settings = settings
            .unwrap_or_else(|| Arc::new(SharedSettings::new(config.settings())) as Arc<dyn SettingsProvider>);
        let metrics = Arc::new(
            MetricsCollector::new(config.metrics.capacity).with_settings(Arc::clone(&settings)),
        );
        let monitor = DisplayMonitor::new(config.display.debounce, config.display.change_threshold);

        let owner = OwnerParts {
            config: config.clone(),
            settings: Arc::clone(&settings),
            metrics: Arc::clone(&metrics),
            memory_probe: memory_probe
                .unwrap_or_else(|| Box::new(SystemMemoryProbe) as Box<dyn MemoryProbe + Send>),
            display: host
                .as_ref()
                .map(|host| DisplayInfo::new(host.rasterization_scale()))
                .unwrap_or_default(),
            display_changes: host.as_ref().map(|host| monitor.observe(host.as_ref())),
        };

        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = sync_channel(1);

        let thread = thread::Builder::new()
            .name(OWNER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(RenderError::Io(e.to_string())));
                        return;
                    }
                };
                let local = LocalSet::new();
                local.block_on(&runtime, run_owner(init, owner, receiver, ready_tx));
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(RenderError::NativeEngine(
                    "render owner thread exited during startup".to_string(),
                ));
            }
        }

        tracing::info!(
            cache_capacity = config.render.cache_capacity,
            max_concurrent = config.render.max_concurrent,
            "Render engine started"
        );

        Ok(RenderEngine {
            commands,
            thread: Mutex::new(Some(thread)),
            metrics,
            settings,
            host,
            monitor,
        })
    }
}

/// Everything the owner thread needs besides the rasterizer
struct OwnerParts {
    config: EngineConfig,
    settings: Arc<dyn SettingsProvider>,
    metrics: Arc<MetricsCollector>,
    memory_probe: Box<dyn MemoryProbe + Send>,
    display: DisplayInfo,
    display_changes: Option<BoxStream<'static, DisplayInfo>>,
}

async fn run_owner<R, F>(
    init: F,
    parts: OwnerParts,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: SyncSender<RenderResult<()>>,
) where
    R: Rasterizer + 'static,
    F: FnOnce() -> RenderResult<R>,
{
    let engine = match init() {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize native engine");
            let _ = ready.send(Err(e));
            return;
        }
    };

    let cache = BitmapCache::new(parts.config.render.cache_capacity)
        .with_max_age(parts.config.render.cache_max_age);
    let coordinator = RenderCoordinator::builder(NativeEngineGateway::initialize(engine))
        .cache(cache)
        .settings(parts.settings)
        .metrics(parts.metrics)
        .memory_probe(parts.memory_probe)
        .config(CoordinatorConfig::from(&parts.config.render))
        .display(parts.display)
        .build();

    if let Some(mut changes) = parts.display_changes {
        let coordinator = coordinator.clone();
        tokio::task::spawn_local(async move {
            while let Some(display) = changes.next().await {
                coordinator.set_display(display);
            }
        });
    }

    let _ = ready.send(Ok(()));

    while let Some(command) = commands.recv().await {
        match command {
            Command::Render { request, mut reply } => {
                let coordinator = coordinator.clone();
                tokio::task::spawn_local(async move {
                    let cancel = request.cancel.clone();
                    let render = coordinator.render(request);
                    tokio::pin!(render);

                    let result = tokio::select! {
                        result = &mut render => result,
                        _ = reply.closed() => {
                            // Caller went away; release its claim on the work
                            cancel.cancel();
                            render.await
                        }
                    };
                    let _ = reply.send(result);
                });
            }
            Command::PageCount { document, reply } => {
                let coordinator = coordinator.clone();
                tokio::task::spawn_local(async move {
                    let _ = reply.send(coordinator.page_count(&document).await);
                });
            }
            Command::SetDisplay(display) => coordinator.set_display(display),
            Command::RemoveDocument { document_id, reply } => {
                let _ = reply.send(coordinator.remove_document(&document_id));
            }
            Command::Stats { reply } => {
                let _ = reply.send((coordinator.stats(), coordinator.display()));
            }
            Command::Shutdown { reply } => {
                coordinator.shutdown();
                let _ = reply.send(());
                break;
            }
        }
    }

    coordinator.shutdown();
    tracing::info!("Render owner thread exiting");
}

/// Handle to the render engine; cheap to share across threads
pub struct RenderEngine {
    commands: mpsc::UnboundedSender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsCollector>,
    settings: Arc<dyn SettingsProvider>,
    host: Option<Arc<dyn HostDisplayContext>>,
    monitor: DisplayMonitor,
}

impl RenderEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            settings: None,
            host: None,
            memory_probe: None,
        }
    }

    /// Render a page and open a PNG stream over it
    pub async fn render_page(
        &self,
        document: DocumentHandle,
        page_number: u32,
        zoom: f64,
        quality: Option<RenderingQuality>,
    ) -> RenderResult<ImageStream> {
        let mut request = PageRenderRequest::new(document, page_number, zoom);
        request.quality = quality;
        let page = self.submit(request).await?;
        page.open_stream()
    }

    /// Submit a prepared request
    pub async fn submit(&self, request: PageRenderRequest) -> RenderResult<Arc<RenderedPage>> {
        self.call(|reply| Command::Render { request, reply })
            .await?
    }

    /// Number of pages in a document
    pub async fn page_count(&self, document: DocumentHandle) -> RenderResult<usize> {
        self.call(|reply| Command::PageCount { document, reply })
            .await?
    }

    /// Debounced, significance-filtered display changes from the host.
    ///
    /// Empty when the engine was started without a display host.
    pub fn observe_display_changes(&self) -> BoxStream<'static, DisplayInfo> {
        match &self.host {
            Some(host) => self.monitor.observe(host.as_ref()),
            None => stream::empty().boxed(),
        }
    }

    /// Push a display change directly (hosts without a display context)
    pub fn set_display(&self, display: DisplayInfo) -> RenderResult<()> {
        self.commands
            .send(Command::SetDisplay(display))
            .map_err(|_| RenderError::EngineShutdown)
    }

    pub fn current_metrics(&self) -> Option<PerformanceSample> {
        self.metrics.current_snapshot()
    }

    pub fn metrics_history(&self, window: Duration) -> Vec<PerformanceSample> {
        self.metrics.history(window)
    }

    /// Record a host frame; native memory is filled in from the cache
    pub fn record_frame(&self, fps: f64, managed_memory_mb: f64) -> Option<PerformanceSample> {
        self.metrics.record_frame(fps, managed_memory_mb)
    }

    pub fn export_metrics(&self, path: &Path, format: ExportFormat) -> Result<usize, ExportError> {
        self.metrics.export(path, format)
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn settings(&self) -> &Arc<dyn SettingsProvider> {
        &self.settings
    }

    pub async fn stats(&self) -> RenderResult<EngineStats> {
        let (render, display) = self.call(|reply| Command::Stats { reply }).await?;
        Ok(EngineStats {
            render,
            display,
            metrics_samples: self.metrics.len(),
            performance_level: self.metrics.current_level(),
        })
    }

    /// Drop a document's cached pages; returns how many were removed
    pub async fn remove_document(&self, document_id: &str) -> RenderResult<usize> {
        let document_id = document_id.to_string();
        self.call(|reply| Command::RemoveDocument { document_id, reply })
            .await
    }

    /// Tear the native engine down on its owner thread and wait for it to exit
    pub async fn shutdown(&self) -> RenderResult<()> {
        let sent = self.call(|reply| Command::Shutdown { reply }).await;

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| RenderError::Io(e.to_string()))?
                .map_err(|_| RenderError::NativeEngine("render owner thread panicked".to_string()))?;
        }

        match sent {
            Ok(()) | Err(RenderError::EngineShutdown) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> RenderResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| RenderError::EngineShutdown)?;
        response.await.map_err(|_| RenderError::EngineShutdown)
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        // Closing the channel ends the owner loop, which shuts the engine
        // down on its own thread. Not joined here to avoid blocking a runtime.
        if self.thread.get_mut().is_some() {
            tracing::debug!("Render engine handle dropped; owner thread will exit");
        }
    }
}
