//! Rendering coordinator
//!
//! Turns page requests into cached bitmaps on the render-owner thread.
//!
//! ```text
//! render(request)
//!   ├─ validate → resolve quality → effective resolution → CacheKey
//!   ├─ cache hit ──────────────────────────────────────▶ Arc<RenderedPage>
//!   ├─ key in flight → attach as waiter ───────┐
//!   └─ spawn_local(operation) ─────────────────┤
//!        admission slot → strategy → gateway   │
//!        → cache insert                        ▼
//!                               per-waiter cancel / timeout
//! ```
//!
//! The coordinator is `!Send`: it must be created and driven inside a
//! `tokio::task::LocalSet` on the thread that owns the native engine.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::config::RenderConfig;
use crate::display::{calculate_effective_resolution, DisplayInfo, RenderingQuality, MIN_RESOLUTION};
use crate::error::{RenderError, RenderResult};
use crate::metrics::MetricsCollector;
use crate::native::{DocumentHandle, NativeEngineGateway, Rasterizer};
use crate::settings::{SettingsProvider, SharedSettings};

use super::cache::{BitmapCache, CacheStats};
use super::strategy::{
    select_strategy, MemoryProbe, RenderStrategy, SelectionInputs, SystemMemoryProbe,
    DEFAULT_LOW_MEMORY_THRESHOLD_MB,
};
use super::types::{CacheKey, CancelSignal, PageRenderRequest, RenderState, RenderedPage};

/// Terminal states remembered for `state_of` after an operation ends
const RECENT_STATES_CAPACITY: usize = 256;

/// Coordinator tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Native renders allowed at once
    pub max_concurrent: usize,
    /// Per-waiter timeout; `None` waits forever
    pub timeout: Option<Duration>,
    pub low_memory_threshold_mb: u64,
    pub temp_dir: Option<PathBuf>,
    /// Resolution factor for the out-of-memory retry
    pub oom_retry_scale: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout: Some(Duration::from_secs(30)),
            low_memory_threshold_mb: DEFAULT_LOW_MEMORY_THRESHOLD_MB,
            temp_dir: None,
            oom_retry_scale: 0.5,
        }
    }
}

impl From<&RenderConfig> for CoordinatorConfig {
    fn from(config: &RenderConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            timeout: config.timeout,
            low_memory_threshold_mb: config.low_memory_threshold_mb,
            temp_dir: config.temp_dir.clone(),
            oom_retry_scale: config.oom_retry_scale,
        }
    }
}

/// Bounded concurrency ceiling for native renders
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a slot. Fails once the gate is closed.
    pub async fn acquire(&self) -> RenderResult<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RenderError::EngineShutdown)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Fail every pending and future `acquire`
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub requests: u64,
    pub cache_hits: u64,
    /// Requests that joined an operation already in flight
    pub deduplicated: u64,
    /// Operations scheduled
    pub operations: u64,
    pub completed: u64,
    pub failed: u64,
    /// Operations dropped before starting because every waiter cancelled
    pub skipped: u64,
    pub cancelled_waiters: u64,
    pub timed_out_waiters: u64,
    pub oom_retries: u64,
    pub in_flight: usize,
    pub native_calls: u64,
    pub admission_available: usize,
    pub cache: CacheStats,
}

/// Shared bookkeeping for one in-flight operation
struct OpControl {
    state: Cell<RenderState>,
    active: Cell<usize>,
    cancelled_exits: Cell<usize>,
    other_exits: Cell<usize>,
    abandoned: Cell<bool>,
    abandon: Notify,
}

impl OpControl {
    fn new() -> Self {
        Self {
            state: Cell::new(RenderState::Queued),
            active: Cell::new(0),
            cancelled_exits: Cell::new(0),
            other_exits: Cell::new(0),
            abandoned: Cell::new(false),
            abandon: Notify::new(),
        }
    }

    fn transition(&self, next: RenderState) {
        let current = self.state.get();
        debug_assert!(
            current.can_transition_to(next),
            "invalid render state transition {:?} -> {:?}",
            current,
            next
        );
        self.state.set(next);
    }

    fn join(&self) {
        self.active.set(self.active.get() + 1);
    }

    /// A waiter left. Abandons the operation once every waiter so far has
    /// cancelled and it has not started.
    fn leave(&self, cancelled: bool) {
        self.active.set(self.active.get().saturating_sub(1));
        if cancelled {
            self.cancelled_exits.set(self.cancelled_exits.get() + 1);
        } else {
            self.other_exits.set(self.other_exits.get() + 1);
        }

        if self.active.get() == 0
            && self.other_exits.get() == 0
            && self.state.get() == RenderState::Queued
            && !self.abandoned.get()
        {
            self.abandoned.set(true);
            self.abandon.notify_one();
        }
    }
}

/// Registration of one caller on an operation; leaves on drop
struct Waiter {
    control: Rc<OpControl>,
    cancelled: bool,
}

impl Waiter {
    fn new(control: Rc<OpControl>) -> Self {
        control.join();
        Self {
            control,
            cancelled: false,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.control.leave(self.cancelled);
    }
}

type SharedRender = Shared<LocalBoxFuture<'static, RenderResult<Arc<RenderedPage>>>>;

#[derive(Clone)]
struct InFlightOp {
    id: u64,
    shared: SharedRender,
    control: Rc<OpControl>,
}

struct Inner<R: Rasterizer> {
    gateway: NativeEngineGateway<R>,
    cache: RefCell<BitmapCache>,
    in_flight: RefCell<HashMap<CacheKey, InFlightOp>>,
    recent_states: RefCell<LruCache<CacheKey, RenderState>>,
    admission: AdmissionGate,
    display: Cell<DisplayInfo>,
    settings: Arc<dyn SettingsProvider>,
    metrics: Arc<MetricsCollector>,
    memory: Box<dyn MemoryProbe>,
    config: CoordinatorConfig,
    stats: RefCell<CoordinatorStats>,
    next_op: Cell<u64>,
    shut_down: Cell<bool>,
}

/// Builder for [`RenderCoordinator`]
pub struct CoordinatorBuilder<R: Rasterizer> {
    gateway: NativeEngineGateway<R>,
    cache: Option<BitmapCache>,
    settings: Option<Arc<dyn SettingsProvider>>,
    metrics: Option<Arc<MetricsCollector>>,
    memory: Option<Box<dyn MemoryProbe>>,
    config: CoordinatorConfig,
    display: DisplayInfo,
}

impl<R: Rasterizer + 'static> CoordinatorBuilder<R> {
    pub fn cache(mut self, cache: BitmapCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn memory_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.memory = Some(Box::new(probe));
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn display(mut self, display: DisplayInfo) -> Self {
        self.display = display;
        self
    }

    pub fn build(self) -> RenderCoordinator<R> {
        let admission = AdmissionGate::new(self.config.max_concurrent);
        let recent_capacity = NonZeroUsize::new(RECENT_STATES_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        RenderCoordinator {
            inner: Rc::new(Inner {
                gateway: self.gateway,
                cache: RefCell::new(self.cache.unwrap_or_default()),
                in_flight: RefCell::new(HashMap::new()),
                recent_states: RefCell::new(LruCache::new(recent_capacity)),
                admission,
                display: Cell::new(self.display),
                settings: self
                    .settings
                    .unwrap_or_else(|| Arc::new(SharedSettings::default()) as Arc<dyn SettingsProvider>),
                metrics: self.metrics.unwrap_or_default(),
                memory: self
                    .memory
                    .unwrap_or_else(|| Box::new(SystemMemoryProbe) as Box<dyn MemoryProbe>),
                config: self.config,
                stats: RefCell::new(CoordinatorStats::default()),
                next_op: Cell::new(0),
                shut_down: Cell::new(false),
            }),
        }
    }
}

/// Deduplicating, concurrency-bounded front end to the strategies and cache
pub struct RenderCoordinator<R: Rasterizer + 'static> {
    inner: Rc<Inner<R>>,
}

impl<R: Rasterizer + 'static> Clone for RenderCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<R: Rasterizer + 'static> RenderCoordinator<R> {
    pub fn builder(gateway: NativeEngineGateway<R>) -> CoordinatorBuilder<R> {
        CoordinatorBuilder {
            gateway,
            cache: None,
            settings: None,
            metrics: None,
            memory: None,
            config: CoordinatorConfig::default(),
            display: DisplayInfo::default(),
        }
    }

    /// Render a page, sharing work with concurrent requests for the same key
    pub async fn render(&self, request: PageRenderRequest) -> RenderResult<Arc<RenderedPage>> {
        let inner = &self.inner;
        if inner.shut_down.get() {
            return Err(RenderError::EngineShutdown);
        }
        request.validate()?;
        if request.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        inner.stats.borrow_mut().requests += 1;

        let key = self.cache_key(&request);
        let cached = inner.cache.borrow_mut().get(&key);
        if let Some(page) = cached {
            inner.stats.borrow_mut().cache_hits += 1;
            return Ok(page);
        }

        let op = self.attach_or_start(&key, &request);
        let mut waiter = Waiter::new(Rc::clone(&op.control));

        let outcome = self.wait(op.shared, &request.cancel).await;
        match &outcome {
            Err(RenderError::Cancelled) => {
                waiter.cancelled = true;
                inner.stats.borrow_mut().cancelled_waiters += 1;
                tracing::debug!(key = %key, "Waiter cancelled");
            }
            Err(RenderError::Timeout(limit)) => {
                inner.stats.borrow_mut().timed_out_waiters += 1;
                tracing::warn!(key = %key, timeout_ms = limit.as_millis() as u64, "Render wait timed out");
            }
            _ => {}
        }
        drop(waiter);

        outcome
    }

    /// Page count through the gateway
    pub async fn page_count(&self, document: &DocumentHandle) -> RenderResult<usize> {
        if self.inner.shut_down.get() {
            return Err(RenderError::EngineShutdown);
        }
        self.inner
            .gateway
            .execute_async(|engine| engine.page_count(document))
            .await
    }

    /// Key a request would be cached under with the current display and settings
    pub fn cache_key(&self, request: &PageRenderRequest) -> CacheKey {
        let quality = self.resolve_quality(request);
        let resolution = calculate_effective_resolution(&self.inner.display.get(), request.zoom, quality);
        CacheKey::new(request.document.id(), request.page_number, resolution)
    }

    fn resolve_quality(&self, request: &PageRenderRequest) -> RenderingQuality {
        let settings = &self.inner.settings;
        let requested = request.quality.unwrap_or_else(|| settings.quality());
        if !settings.adaptive_quality() {
            return requested;
        }

        let suggested = self.inner.metrics.suggest_quality(requested);
        if suggested != requested {
            tracing::debug!(%requested, %suggested, "Adaptive quality stepped down");
        }
        suggested
    }

    fn attach_or_start(&self, key: &CacheKey, request: &PageRenderRequest) -> InFlightOp {
        match self.inner.joinable(key) {
            Some(op) => {
                self.inner.stats.borrow_mut().deduplicated += 1;
                tracing::debug!(key = %key, "Joining in-flight render");
                op
            }
            None => self.inner.start(key.clone(), request.clone(), true),
        }
    }

    async fn wait(&self, shared: SharedRender, cancel: &CancelSignal) -> RenderResult<Arc<RenderedPage>> {
        let waited = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RenderError::Cancelled),
                result = shared => result,
            }
        };

        match self.inner.config.timeout {
            Some(limit) => tokio::time::timeout(limit, waited)
                .await
                .unwrap_or(Err(RenderError::Timeout(limit))),
            None => waited.await,
        }
    }

    /// Replace the display used for new requests
    pub fn set_display(&self, info: DisplayInfo) {
        tracing::info!(
            scale = info.rasterization_scale,
            base_resolution = info.base_resolution,
            "Display changed"
        );
        self.inner.display.set(info);
    }

    pub fn display(&self) -> DisplayInfo {
        self.inner.display.get()
    }

    /// Current or last known state of a key
    pub fn state_of(&self, key: &CacheKey) -> Option<RenderState> {
        if let Some(op) = self.inner.in_flight.borrow().get(key) {
            return Some(op.control.state.get());
        }
        if self.inner.cache.borrow().contains(key) {
            return Some(RenderState::Completed);
        }
        self.inner.recent_states.borrow().peek(key).copied()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.borrow().len()
    }

    /// The admission gate; holding a permit blocks one render slot
    pub fn admission(&self) -> &AdmissionGate {
        &self.inner.admission
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    /// Cached page for a key, without touching recency
    pub fn cached(&self, key: &CacheKey) -> Option<Arc<RenderedPage>> {
        self.inner.cache.borrow().peek(key)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let inner = &self.inner;
        let mut stats = inner.stats.borrow().clone();
        stats.in_flight = inner.in_flight.borrow().len();
        stats.native_calls = inner.gateway.native_calls();
        stats.admission_available = inner.admission.available();
        stats.cache = inner.cache.borrow().stats();
        stats
    }

    /// Drop a document's cached pages and native state
    pub fn remove_document(&self, document_id: &str) -> usize {
        let inner = &self.inner;
        let removed = inner.cache.borrow_mut().remove_document(document_id);
        inner.metrics.set_native_memory_bytes(inner.cache.borrow().resident_bytes() as u64);

        if !inner.gateway.is_shut_down() {
            let forgotten = inner.gateway.execute(|engine| {
                engine.forget_document(document_id);
                Ok(())
            });
            if let Err(e) = forgotten {
                tracing::warn!(document_id, error = %e, "Failed to release native document state");
            }
        }

        tracing::info!(document_id, removed, "Document removed from render cache");
        removed
    }

    /// Stop accepting work and tear the native engine down
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.replace(true) {
            return;
        }

        tracing::info!(
            in_flight = inner.in_flight.borrow().len(),
            cached = inner.cache.borrow().len(),
            "Shutting down render coordinator"
        );
        inner.admission.close();
        inner.cache.borrow_mut().clear();
        inner.metrics.set_native_memory_bytes(0);
        inner.gateway.shutdown();
    }
}

impl<R: Rasterizer + 'static> Inner<R> {
    /// In-flight operation for `key` that new waiters may still join
    fn joinable(&self, key: &CacheKey) -> Option<InFlightOp> {
        self.in_flight
            .borrow()
            .get(key)
            .filter(|op| !op.control.abandoned.get())
            .cloned()
    }

    /// Register and spawn an operation for `key`
    fn start(self: &Rc<Self>, key: CacheKey, request: PageRenderRequest, retry_oom: bool) -> InFlightOp {
        let id = self.next_op.get();
        self.next_op.set(id + 1);

        let control = Rc::new(OpControl::new());
        let task = tokio::task::spawn_local(Rc::clone(self).run_operation(
            id,
            key.clone(),
            request,
            Rc::clone(&control),
            retry_oom,
        ));
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(RenderError::NativeEngine(format!("render task failed: {}", e))),
            }
        }
        .boxed_local()
        .shared();

        let op = InFlightOp {
            id,
            shared,
            control,
        };
        self.in_flight.borrow_mut().insert(key.clone(), op.clone());
        self.stats.borrow_mut().operations += 1;
        tracing::debug!(key = %key, op = id, "Scheduled render");
        op
    }

    async fn run_operation(
        self: Rc<Self>,
        id: u64,
        key: CacheKey,
        request: PageRenderRequest,
        control: Rc<OpControl>,
        retry_oom: bool,
    ) -> RenderResult<Arc<RenderedPage>> {
        let permit = tokio::select! {
            biased;
            _ = control.abandon.notified() => None,
            permit = self.admission.acquire() => Some(permit),
        };

        let result = match permit {
            None => {
                control.transition(RenderState::Cancelled);
                self.stats.borrow_mut().skipped += 1;
                tracing::debug!(key = %key, op = id, "Skipping render; every waiter cancelled");
                Err(RenderError::Cancelled)
            }
            Some(Err(e)) => {
                control.transition(RenderState::Failed);
                Err(e)
            }
            Some(Ok(permit)) => {
                control.transition(RenderState::InFlight);
                let result = match self.produce(&request, &key).await {
                    Err(RenderError::OutOfMemory { resolution }) if retry_oom => {
                        let reduced = key.with_resolution(
                            (resolution * self.config.oom_retry_scale).max(MIN_RESOLUTION),
                        );
                        self.stats.borrow_mut().oom_retries += 1;
                        tracing::warn!(
                            key = %key,
                            resolution,
                            reduced = reduced.resolution(),
                            "Out of memory; retrying at reduced resolution"
                        );

                        if reduced == key {
                            self.produce(&request, &key).await
                        } else {
                            // The reduced key may need this slot
                            drop(permit);
                            self.render_reduced(reduced, &request).await
                        }
                    }
                    other => other,
                };

                match &result {
                    Ok(page) if page.key == key => {
                        self.complete(page);
                        control.transition(RenderState::Completed);
                    }
                    Ok(_) => {
                        self.stats.borrow_mut().completed += 1;
                        control.transition(RenderState::Completed);
                    }
                    Err(e) => {
                        self.stats.borrow_mut().failed += 1;
                        tracing::warn!(key = %key, error = %e, "Render failed");
                        control.transition(RenderState::Failed);
                    }
                }
                result
            }
        };

        self.finish(id, &key, control.state.get());
        result
    }

    /// Resolve the reduced key of an out-of-memory retry like a fresh
    /// request: cached page, then an in-flight operation, then a new one.
    /// The retry itself is not retried again.
    async fn render_reduced(
        self: &Rc<Self>,
        key: CacheKey,
        request: &PageRenderRequest,
    ) -> RenderResult<Arc<RenderedPage>> {
        let cached = self.cache.borrow_mut().get(&key);
        if let Some(page) = cached {
            tracing::debug!(key = %key, "Reduced resolution already cached");
            return Ok(page);
        }

        let op = match self.joinable(&key) {
            Some(op) => {
                self.stats.borrow_mut().deduplicated += 1;
                tracing::debug!(key = %key, "Joining in-flight render at reduced resolution");
                op
            }
            None => self.start(key, request.clone(), false),
        };

        let _waiter = Waiter::new(Rc::clone(&op.control));
        op.shared.await
    }

    async fn produce(&self, request: &PageRenderRequest, key: &CacheKey) -> RenderResult<Arc<RenderedPage>> {
        let kind = select_strategy(SelectionInputs {
            context: request.context,
            available_memory_mb: self.memory.available_memory_mb(),
            low_memory_threshold_mb: self.config.low_memory_threshold_mb,
        });
        let strategy = RenderStrategy::from_kind(kind, self.config.temp_dir.as_deref());
        let page = strategy.render(&self.gateway, request, key).await?;
        Ok(Arc::new(page))
    }

    fn complete(&self, page: &Arc<RenderedPage>) {
        self.stats.borrow_mut().completed += 1;
        if !self.shut_down.get() {
            let mut cache = self.cache.borrow_mut();
            cache.insert(Arc::clone(page));
            self.metrics.set_native_memory_bytes(cache.resident_bytes() as u64);
        }
        self.metrics.record_render(page.render_time);
    }

    fn finish(&self, id: u64, key: &CacheKey, state: RenderState) {
        let mut in_flight = self.in_flight.borrow_mut();
        if in_flight.get(key).map_or(false, |op| op.id == id) {
            in_flight.remove(key);
        }
        self.recent_states.borrow_mut().put(key.clone(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PerformanceLevel;
    use crate::render::strategy::FixedMemoryProbe;
    use crate::testing::{FakeProbe, FakeRasterizer, ScriptedFailure};
    use futures::future::join_all;
    use tokio::task::LocalSet;

    fn setup(max_concurrent: usize, timeout: Option<Duration>) -> (RenderCoordinator<FakeRasterizer>, FakeProbe) {
        let (fake, probe) = FakeRasterizer::new(5);
        let coordinator = RenderCoordinator::builder(NativeEngineGateway::initialize(fake))
            .config(CoordinatorConfig {
                max_concurrent,
                timeout,
                ..CoordinatorConfig::default()
            })
            .memory_probe(FixedMemoryProbe(None))
            .build();
        (coordinator, probe)
    }

    fn doc() -> DocumentHandle {
        DocumentHandle::from_bytes(b"%PDF-1.7 coordinator".to_vec())
    }

    fn request(page: u32) -> PageRenderRequest {
        PageRenderRequest::new(doc(), page, 1.0)
    }

    async fn drain(coordinator: &RenderCoordinator<FakeRasterizer>) {
        while coordinator.in_flight_len() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_native_call() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);

                let first = coordinator.render(request(1)).await.unwrap();
                let second = coordinator.render(request(1)).await.unwrap();

                assert!(Arc::ptr_eq(&first, &second));
                assert_eq!(probe.calls().len(), 1);
                assert_eq!(coordinator.stats().cache_hits, 1);
                assert_eq!(first.key.resolution(), 96.0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_deduplicated() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);

                let results = join_all((0..5).map(|_| coordinator.render(request(2)))).await;
                let pages: Vec<_> = results.into_iter().map(Result::unwrap).collect();

                let calls = probe.calls();
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].page_index, 1);
                assert_eq!(calls[0].document_id, doc().id());
                assert!(pages.iter().all(|page| Arc::ptr_eq(page, &pages[0])));

                let stats = coordinator.stats();
                assert_eq!(stats.deduplicated, 4);
                assert_eq!(stats.operations, 1);
                assert_eq!(stats.cache.entries, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_cancelling_one_waiter_keeps_the_others() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                let cancel = CancelSignal::new();

                let (r1, r2, r3, _) = tokio::join!(
                    coordinator.render(request(1)),
                    coordinator.render(request(1).with_cancel(cancel.clone())),
                    coordinator.render(request(1)),
                    async { cancel.cancel() },
                );

                assert_eq!(r2.err(), Some(RenderError::Cancelled));
                let (r1, r3) = (r1.unwrap(), r3.unwrap());
                assert!(Arc::ptr_eq(&r1, &r3));
                assert_eq!(probe.calls().len(), 1);
                assert!(coordinator.cached(&r1.key).is_some());
                assert_eq!(coordinator.stats().cancelled_waiters, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_all_waiters_cancelled_while_queued_skips_render() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(1, None);
                let held = coordinator.admission().acquire().await.unwrap();
                let cancel = CancelSignal::new();
                let key = coordinator.cache_key(&request(3));

                let (result, _) = tokio::join!(
                    coordinator.render(request(3).with_cancel(cancel.clone())),
                    async { cancel.cancel() },
                );
                assert_eq!(result.err(), Some(RenderError::Cancelled));

                drop(held);
                drain(&coordinator).await;

                assert_eq!(coordinator.state_of(&key), Some(RenderState::Cancelled));
                assert!(probe.calls().is_empty());
                assert_eq!(coordinator.stats().skipped, 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_work_running() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(1, Some(Duration::from_millis(50)));
                let held = coordinator.admission().acquire().await.unwrap();
                let key = coordinator.cache_key(&request(1));

                let result = coordinator.render(request(1)).await;
                assert_eq!(result.err(), Some(RenderError::Timeout(Duration::from_millis(50))));
                assert_eq!(coordinator.state_of(&key), Some(RenderState::Queued));

                drop(held);
                drain(&coordinator).await;

                assert_eq!(probe.calls().len(), 1);
                assert!(coordinator.cached(&key).is_some());
                assert_eq!(coordinator.state_of(&key), Some(RenderState::Completed));
                assert_eq!(coordinator.stats().timed_out_waiters, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_out_of_memory_retries_once_at_reduced_resolution() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                probe.fail_next(ScriptedFailure::OutOfMemory);

                let page = coordinator
                    .render(request(1).with_quality(RenderingQuality::Ultra))
                    .await
                    .unwrap();

                let dpis: Vec<f64> = probe.calls().iter().map(|call| call.dpi).collect();
                assert_eq!(dpis, vec![288.0, 144.0]);
                assert_eq!(page.key.resolution(), 144.0);
                assert!(coordinator.cached(&page.key).is_some());
                assert!(coordinator.cached(&page.key.with_resolution(288.0)).is_none());
                assert_eq!(coordinator.stats().oom_retries, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_repeated_out_of_memory_is_surfaced() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                probe.fail_next(ScriptedFailure::OutOfMemory);
                probe.fail_next(ScriptedFailure::OutOfMemory);

                let result = coordinator.render(request(1)).await;
                assert_eq!(result.err(), Some(RenderError::OutOfMemory { resolution: 50.0 }));
                assert_eq!(probe.calls().len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn test_out_of_memory_retry_joins_in_flight_reduced_key() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                probe.fail_at(288.0, ScriptedFailure::OutOfMemory);

                let (ultra, medium) = tokio::join!(
                    coordinator.render(request(1).with_quality(RenderingQuality::Ultra)),
                    coordinator.render(request(1).with_quality(RenderingQuality::Medium)),
                );
                let (ultra, medium) = (ultra.unwrap(), medium.unwrap());

                let mut dpis = probe.dpis();
                dpis.sort_by(f64::total_cmp);
                assert_eq!(dpis, vec![144.0, 288.0]);
                assert!(Arc::ptr_eq(&ultra, &medium));
                assert_eq!(ultra.key.resolution(), 144.0);
                assert_eq!(coordinator.stats().oom_retries, 1);
                assert_eq!(coordinator.in_flight_len(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_out_of_memory_retry_uses_cached_reduced_page() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                let medium = coordinator
                    .render(request(1).with_quality(RenderingQuality::Medium))
                    .await
                    .unwrap();

                probe.fail_at(288.0, ScriptedFailure::OutOfMemory);
                let ultra = coordinator
                    .render(request(1).with_quality(RenderingQuality::Ultra))
                    .await
                    .unwrap();

                assert_eq!(probe.dpis(), vec![144.0, 288.0]);
                assert!(Arc::ptr_eq(&ultra, &medium));
                let cached = coordinator.cached(&medium.key).unwrap();
                assert!(Arc::ptr_eq(&cached, &medium));
                assert_eq!(coordinator.stats().cache.evictions, 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_out_of_memory_retry_releases_its_admission_slot() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(1, None);
                probe.fail_next(ScriptedFailure::OutOfMemory);

                let page = coordinator
                    .render(request(2).with_quality(RenderingQuality::High))
                    .await
                    .unwrap();

                assert_eq!(probe.dpis(), vec![192.0, 96.0]);
                assert_eq!(page.key.resolution(), 96.0);
                assert_eq!(coordinator.admission().available(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_out_of_memory_at_resolution_floor_retries_in_place() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                probe.fail_next(ScriptedFailure::OutOfMemory);

                let floor = PageRenderRequest::new(doc(), 1, 0.25).with_quality(RenderingQuality::Low);
                let page = coordinator.render(floor).await.unwrap();

                assert_eq!(probe.dpis(), vec![50.0, 50.0]);
                assert_eq!(page.key.resolution(), 50.0);
                assert!(coordinator.cached(&page.key).is_some());
                assert_eq!(coordinator.stats().operations, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_completed_renders_feed_metrics_history() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, _probe) = setup(4, None);
                for page in 1..=3 {
                    coordinator.render(request(page)).await.unwrap();
                }

                let metrics = coordinator.metrics();
                assert_eq!(metrics.len(), 3);
                let snapshot = metrics.current_snapshot().unwrap();
                assert!(snapshot.native_memory_mb > 0.0);
                assert_eq!(snapshot.native_memory_mb, metrics.native_memory_mb());

                // Cache hits are not renders
                coordinator.render(request(1)).await.unwrap();
                assert_eq!(metrics.len(), 3);

                metrics.record_frame(24.0, 64.0);
                coordinator.render(request(4)).await.unwrap();
                let latest = metrics.current_snapshot().unwrap();
                assert_eq!((latest.fps, latest.managed_memory_mb), (24.0, 64.0));
                assert_eq!(latest.level, PerformanceLevel::Warning);
            })
            .await;
    }

    #[tokio::test]
    async fn test_failure_reaches_all_waiters_and_is_not_cached() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                probe.fail_next(ScriptedFailure::Native("corrupt xref".to_string()));

                let (r1, r2) = tokio::join!(coordinator.render(request(4)), coordinator.render(request(4)));
                let expected = Some(RenderError::NativeEngine("corrupt xref".to_string()));
                assert_eq!(r1.err(), expected);
                assert_eq!(r2.err(), expected);

                let key = coordinator.cache_key(&request(4));
                assert_eq!(coordinator.state_of(&key), Some(RenderState::Failed));

                // Failures are not cached; the next request renders again
                assert!(coordinator.render(request(4)).await.is_ok());
                assert_eq!(probe.calls().len(), 2);
                assert_eq!(coordinator.stats().failed, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_and_cancelled_requests() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);

                let zero = coordinator.render(request(0)).await;
                assert!(matches!(zero, Err(RenderError::InvalidRequest(_))));

                let out_of_range = coordinator.render(request(99)).await;
                assert_eq!(
                    out_of_range.err(),
                    Some(RenderError::PageOutOfRange { page: 99, page_count: 5 })
                );

                let cancel = CancelSignal::new();
                cancel.cancel();
                let cancelled = coordinator.render(request(1).with_cancel(cancel)).await;
                assert_eq!(cancelled.err(), Some(RenderError::Cancelled));
                assert_eq!(probe.calls().len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_display_and_adaptive_quality_change_the_key() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, _probe) = setup(4, None);
                assert_eq!(coordinator.cache_key(&request(1)).resolution(), 96.0);

                coordinator.set_display(DisplayInfo::new(2.0));
                assert_eq!(coordinator.display().rasterization_scale, 2.0);
                assert_eq!(coordinator.cache_key(&request(1)).resolution(), 192.0);

                // Critical performance pins Low quality
                coordinator.metrics().record_sample(8.0, 100.0, 0.0);
                let pinned = request(1).with_quality(RenderingQuality::Ultra);
                assert_eq!(coordinator.cache_key(&pinned).resolution(), 96.0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_native_calls_stay_on_owner_thread() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(2, None);
                let renders = (1..=5).map(|page| coordinator.render(request(page)));
                for result in join_all(renders).await {
                    result.unwrap();
                }

                let owner = std::thread::current().id();
                assert_eq!(probe.threads().len(), 5);
                assert!(probe.threads().iter().all(|thread| *thread == owner));
                assert!(coordinator.metrics().native_memory_mb() > 0.0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_remove_document_and_shutdown() {
        LocalSet::new()
            .run_until(async {
                let (coordinator, probe) = setup(4, None);
                coordinator.render(request(1)).await.unwrap();
                coordinator.render(request(2)).await.unwrap();

                assert_eq!(coordinator.remove_document(doc().id()), 2);
                assert_eq!(coordinator.stats().cache.entries, 0);

                coordinator.shutdown();
                assert!(probe.was_shut_down());
                assert_eq!(
                    coordinator.render(request(1)).await.err(),
                    Some(RenderError::EngineShutdown)
                );
            })
            .await;
    }
}
