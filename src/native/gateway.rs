//! Native engine gateway
//!
//! The rasterizer is **NOT thread-safe**: calling it from any thread other
//! than the one that initialized it corrupts memory. The gateway owns the
//! rasterizer and the identity of that thread.
//!
//! # Design
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                    NativeEngineGateway                         │
//! │                                                                │
//! │  initialize() → [capture ThreadId] → owns Rasterizer          │
//! │                                                                │
//! │  execute(op)        → enforce affinity → op(&engine)          │
//! │  execute_async(op)  → enforce affinity → yield_now()          │
//! │                       → enforce affinity → op(&engine)        │
//! │                                                                │
//! │  shutdown()         → enforce affinity → engine.shutdown()    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `execute_async` is a cooperative suspension point, not a thread handoff.
//! Never wrap a gateway call in `spawn_blocking`.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use crate::error::{AffinityViolation, RenderError, RenderResult};

use super::Rasterizer;

/// Identity of the thread allowed to touch the native engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityGuard {
    owner: ThreadId,
}

impl AffinityGuard {
    /// Capture the calling thread as owner
    pub fn capture() -> Self {
        Self {
            owner: thread::current().id(),
        }
    }

    /// Owner thread
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Check the calling thread against the owner
    pub fn check(&self) -> Result<(), AffinityViolation> {
        let actual = thread::current().id();
        if actual == self.owner {
            Ok(())
        } else {
            Err(AffinityViolation {
                expected: self.owner,
                actual,
            })
        }
    }

    /// Panic on mismatch. There is no recovery path for this.
    #[track_caller]
    pub fn enforce(&self) {
        if let Err(violation) = self.check() {
            tracing::error!(
                expected = ?violation.expected,
                actual = ?violation.actual,
                "Native engine called off its owner thread"
            );
            panic!("{}", violation);
        }
    }
}

/// Single point of entry into the native rasterizer
pub struct NativeEngineGateway<R: Rasterizer> {
    guard: AffinityGuard,
    /// `None` after shutdown
    engine: RefCell<Option<R>>,
    /// Native invocations issued (for stats and tests)
    calls: Cell<u64>,
}

impl<R: Rasterizer> NativeEngineGateway<R> {
    /// Take ownership of an initialized rasterizer on the current thread
    pub fn initialize(engine: R) -> Self {
        let guard = AffinityGuard::capture();
        tracing::info!(
            backend = engine.name(),
            owner = ?guard.owner(),
            "Native engine gateway initialized"
        );
        Self {
            guard,
            engine: RefCell::new(Some(engine)),
            calls: Cell::new(0),
        }
    }

    /// Affinity guard of this gateway
    pub fn guard(&self) -> AffinityGuard {
        self.guard
    }

    /// Number of native calls issued so far
    pub fn native_calls(&self) -> u64 {
        self.calls.get()
    }

    /// Whether `shutdown` has run
    pub fn is_shut_down(&self) -> bool {
        self.engine.borrow().is_none()
    }

    /// Run `op` inline against the native engine.
    ///
    /// Panics with `AffinityViolation` when called off the owner thread.
    /// Panics raised by the native call itself are caught and returned as
    /// `RenderError::NativeEngine`.
    #[track_caller]
    pub fn execute<T, F>(&self, op: F) -> RenderResult<T>
    where
        F: FnOnce(&R) -> RenderResult<T>,
    {
        self.guard.enforce();

        let slot = self.engine.borrow();
        let engine = slot.as_ref().ok_or(RenderError::EngineShutdown)?;

        self.calls.set(self.calls.get() + 1);

        match panic::catch_unwind(AssertUnwindSafe(|| op(engine))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(%message, "Native engine call panicked");
                Err(RenderError::NativeEngine(format!("native call panicked: {}", message)))
            }
        }
    }

    /// Yield to the scheduler once, then run `op` inline on this thread.
    pub async fn execute_async<T, F>(&self, op: F) -> RenderResult<T>
    where
        F: FnOnce(&R) -> RenderResult<T>,
    {
        self.guard.enforce();
        tokio::task::yield_now().await;
        self.execute(op)
    }

    /// Tear down the native engine on the owner thread
    #[track_caller]
    pub fn shutdown(&self) {
        self.guard.enforce();
        if let Some(mut engine) = self.engine.borrow_mut().take() {
            tracing::info!(
                backend = engine.name(),
                native_calls = self.calls.get(),
                "Shutting down native engine"
            );
            engine.shutdown();
        }
    }
}

impl<R: Rasterizer> Drop for NativeEngineGateway<R> {
    fn drop(&mut self) {
        if self.guard.check().is_ok() {
            self.shutdown();
            return;
        }

        // Tearing the engine down here would run native code off-thread
        if let Some(engine) = self.engine.get_mut().take() {
            tracing::error!(
                owner = ?self.guard.owner(),
                "Gateway dropped off its owner thread; leaking native engine"
            );
            std::mem::forget(engine);
        }
    }
}
