//! Mutex-guarded engine handles

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::core::engine::{
    BackendKind, SynthesisEngine, SynthesisError, SynthesisRequest, SynthesisResult,
    SynthesizedAudio,
};

pub(crate) type EngineSlot = Arc<Mutex<Option<Box<dyn SynthesisEngine>>>>;

/// Lifecycle of a backend
///
/// `Uninitialized -> Ready -> Busy -> Ready` in normal operation,
/// `Ready | Busy -> Draining -> Uninitialized` on recycle, and `Failed` when
/// the engine could not be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Uninitialized,
    Ready,
    Busy,
    Draining,
    Failed,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Uninitialized => write!(f, "uninitialized"),
            BackendState::Ready => write!(f, "ready"),
            BackendState::Busy => write!(f, "busy"),
            BackendState::Draining => write!(f, "draining"),
            BackendState::Failed => write!(f, "failed"),
        }
    }
}

/// One engine instance of a given kind
///
/// The engine mutex is the claim: whoever holds it is the only caller
/// running a synthesis on this backend. The state field is an advisory
/// mirror used for routing probes and reporting.
pub struct Backend {
    kind: BackendKind,
    engine: EngineSlot,
    engine_name: Option<String>,
    state: parking_lot::Mutex<BackendState>,
    failure: Option<String>,
}

impl Backend {
    pub(crate) fn ready(kind: BackendKind, engine: Box<dyn SynthesisEngine>) -> Self {
        Self {
            kind,
            engine_name: Some(engine.name().to_string()),
            engine: Arc::new(Mutex::new(Some(engine))),
            state: parking_lot::Mutex::new(BackendState::Ready),
            failure: None,
        }
    }

    pub(crate) fn failed(kind: BackendKind, reason: String) -> Self {
        Self {
            kind,
            engine: Arc::new(Mutex::new(None)),
            engine_name: None,
            state: parking_lot::Mutex::new(BackendState::Failed),
            failure: Some(reason),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Initialized and accepting claims
    pub fn is_available(&self) -> bool {
        matches!(self.state(), BackendState::Ready | BackendState::Busy)
    }

    /// Advisory idle probe; a later claim may still lose a race
    pub fn is_idle(&self) -> bool {
        self.state() == BackendState::Ready
    }

    /// Claim the backend without waiting
    pub fn try_claim(self: &Arc<Self>) -> Option<BackendClaim> {
        if !self.is_available() {
            return None;
        }
        let guard = Arc::clone(&self.engine).try_lock_owned().ok()?;
        self.activate(guard)
    }

    /// Wait for the backend, returning `None` if it started draining meanwhile
    pub async fn claim(self: &Arc<Self>) -> Option<BackendClaim> {
        if !self.is_available() {
            return None;
        }
        let guard = Arc::clone(&self.engine).lock_owned().await;
        self.activate(guard)
    }

    fn activate(
        self: &Arc<Self>,
        guard: OwnedMutexGuard<Option<Box<dyn SynthesisEngine>>>,
    ) -> Option<BackendClaim> {
        if guard.is_none() {
            return None;
        }
        let mut state = self.state.lock();
        if !matches!(*state, BackendState::Ready | BackendState::Busy) {
            return None;
        }
        *state = BackendState::Busy;
        drop(state);

        Some(BackendClaim {
            guard,
            backend: Arc::clone(self),
        })
    }

    /// Stop accepting new claims; in-flight calls keep running
    pub(crate) fn begin_drain(&self) {
        let mut state = self.state.lock();
        if matches!(*state, BackendState::Ready | BackendState::Busy) {
            *state = BackendState::Draining;
        }
    }

    pub(crate) fn mark_uninitialized(&self) {
        *self.state.lock() = BackendState::Uninitialized;
    }

    pub(crate) fn engine_slot(&self) -> EngineSlot {
        Arc::clone(&self.engine)
    }

    /// Hold the backend out of service until the gate is dropped
    ///
    /// Claims wait on the engine lock meanwhile. Returns `None` for a backend
    /// without an engine.
    pub(crate) fn hold(self: &Arc<Self>) -> Option<BackendGate> {
        let guard = Arc::clone(&self.engine).try_lock_owned().ok()?;
        if guard.is_none() {
            return None;
        }
        let mut state = self.state.lock();
        if *state == BackendState::Ready {
            *state = BackendState::Busy;
        }
        drop(state);
        Some(BackendGate {
            guard,
            backend: Arc::clone(self),
        })
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: self.kind,
            state: self.state(),
            engine: self.engine_name.clone(),
            failure: self.failure.clone(),
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // Engines left behind by a timed-out drain are released with the last handle
        if let Ok(mut slot) = self.engine.try_lock()
            && let Some(mut engine) = slot.take()
        {
            debug!(backend = %self.kind, "Tearing down engine on handle drop");
            engine.teardown();
        }
    }
}

/// Exclusive use of one backend; released on drop
///
/// Fields drop in declaration order: the engine lock is released before the
/// backend handle, so a last-handle drop can still reach the engine.
pub struct BackendClaim {
    guard: OwnedMutexGuard<Option<Box<dyn SynthesisEngine>>>,
    backend: Arc<Backend>,
}

impl BackendClaim {
    pub fn kind(&self) -> BackendKind {
        self.backend.kind
    }

    /// Run the engine; blocks the calling thread
    pub fn synthesize(&mut self, request: &SynthesisRequest) -> SynthesisResult<SynthesizedAudio> {
        match self.guard.as_mut() {
            Some(engine) => engine.synthesize(request),
            None => Err(SynthesisError::Transient(format!(
                "{} backend was torn down",
                self.backend.kind
            ))),
        }
    }
}

impl Drop for BackendClaim {
    fn drop(&mut self) {
        let mut state = self.backend.state.lock();
        if *state == BackendState::Busy {
            *state = BackendState::Ready;
        }
    }
}

/// Keeps a freshly built backend closed while its predecessor is still running
pub(crate) struct BackendGate {
    guard: OwnedMutexGuard<Option<Box<dyn SynthesisEngine>>>,
    backend: Arc<Backend>,
}

impl BackendGate {
    pub(crate) fn kind(&self) -> BackendKind {
        self.backend.kind
    }
}

impl Drop for BackendGate {
    fn drop(&mut self) {
        let mut state = self.backend.state.lock();
        if *state == BackendState::Busy {
            *state = BackendState::Ready;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub state: BackendState,
    pub engine: Option<String>,
    pub failure: Option<String>,
}
