//! Backend pool
//!
//! Owns one [`Backend`] per supported [`BackendKind`], the global concurrency
//! semaphore and the routing heuristic. [`BackendPool::process`] is the only
//! way synthesis work reaches an engine:
//!
//! 1. acquire one permit from the global semaphore
//! 2. wait for the pool to be `Ready`
//! 3. route the segment and claim a backend (the claim is authoritative)
//! 4. run the engine on a blocking thread
//! 5. release the backend, then the permit
//!
//! A transient failure on an accelerated backend is retried exactly once on
//! the baseline backend.
//!
//! # Recycling
//!
//! [`BackendPool::recycle`] drains every backend (in-flight calls finish
//! naturally), tears the engines down, asks the factory to reclaim shared
//! resources and rebuilds the topology. Only the teardown and rebuild run in
//! the exclusive section; draining does not block other pool readers.
//!
//! A backend whose call outlives the drain timeout is left to finish. Its
//! replacement stays closed until that call returns, and the old engine is
//! torn down (followed by another reclaim) as soon as it is released.

pub mod backend;
pub mod router;
pub mod stats;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::core::engine::{
    BackendKind, EngineFactory, HardwareCapabilities, SynthesisEngine, SynthesisError,
    SynthesisRequest, SynthesisResult, SynthesizedAudio,
};

use backend::BackendGate;
pub use backend::{Backend, BackendClaim, BackendInfo, BackendState};
pub use router::{
    BackendStatus, ComplexityTier, Router, RoutingConfig, SchedulingDecision,
};
pub use stats::{BackendUtilization, UtilizationSnapshot, UtilizationStats};

/// Pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Global bound on simultaneously executing synthesis calls
    pub max_concurrent_segments: usize,
    pub enable_accelerated_a: bool,
    pub enable_accelerated_b: bool,
    /// Physical cores required before the mid-capability kind is enabled
    pub accelerated_b_min_cores: usize,
    /// Upper bound on the drain wait during a recycle
    pub drain_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_segments: 2,
            enable_accelerated_a: false,
            enable_accelerated_b: false,
            accelerated_b_min_cores: 4,
            drain_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("No synthesis backend is available")]
    BackendUnavailable,

    #[error("Backend pool is shut down")]
    Closed,

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

/// Pool-wide lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    Initializing,
    Ready,
    Draining,
    /// Baseline failed to initialize; every request fails until a successful recycle
    Unavailable,
    Closed,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPhase::Initializing => write!(f, "initializing"),
            PoolPhase::Ready => write!(f, "ready"),
            PoolPhase::Draining => write!(f, "draining"),
            PoolPhase::Unavailable => write!(f, "unavailable"),
            PoolPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Coarse health for the HTTP surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Ready,
    Degraded,
    Unavailable,
}

/// Successful output of [`BackendPool::process`]
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub audio: SynthesizedAudio,
    /// Backend that produced the audio
    pub backend: BackendKind,
    pub retried: bool,
    pub decision: SchedulingDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecycleReport {
    pub generation: u64,
    pub reason: String,
    pub duration_ms: u64,
    pub ready: Vec<BackendKind>,
    pub failed: Vec<BackendKind>,
    /// Backends still busy when the drain timeout expired
    pub drain_timed_out: Vec<BackendKind>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecycleOutcome {
    Completed(RecycleReport),
    /// Another recycle was already running; nothing was done
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub phase: PoolPhase,
    pub health: PoolHealth,
    pub generation: u64,
    pub max_concurrent_segments: usize,
    pub available_permits: usize,
    pub backends: Vec<BackendInfo>,
}

struct Topology {
    generation: u64,
    backends: Vec<Arc<Backend>>,
}

impl Topology {
    fn backend(&self, kind: BackendKind) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.kind() == kind)
    }

    fn statuses(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus {
                kind: b.kind(),
                available: b.is_available(),
                idle: b.is_idle(),
            })
            .collect()
    }

    fn baseline_ready(&self) -> bool {
        self.backend(BackendKind::Baseline)
            .is_some_and(|b| b.is_available())
    }

    fn kinds_where(&self, pred: impl Fn(&Backend) -> bool) -> Vec<BackendKind> {
        self.backends
            .iter()
            .filter_map(|b| pred(b).then(|| b.kind()))
            .collect()
    }
}

pub struct BackendPool {
    config: PoolConfig,
    router: Router,
    factory: Arc<dyn EngineFactory>,
    capabilities: HardwareCapabilities,
    topology: RwLock<Arc<Topology>>,
    semaphore: Arc<Semaphore>,
    phase: watch::Sender<PoolPhase>,
    stats: Arc<UtilizationStats>,
    completions: Arc<Notify>,
    recycling: AtomicBool,
    exclusive: tokio::sync::Mutex<()>,
}

impl BackendPool {
    /// Build every supported backend
    ///
    /// Accelerated kinds that fail to initialize leave the pool degraded.
    /// Fails only if the baseline backend cannot be constructed.
    pub async fn initialize(
        config: PoolConfig,
        routing: RoutingConfig,
        factory: Arc<dyn EngineFactory>,
        capabilities: HardwareCapabilities,
    ) -> Result<Arc<Self>, PoolError> {
        let (phase, _) = watch::channel(PoolPhase::Initializing);
        let max = config.max_concurrent_segments.max(1);

        let backends = build_backends(&factory, &capabilities).await;
        let topology = Topology {
            generation: 1,
            backends,
        };
        if !topology.baseline_ready() {
            error!("Baseline backend failed to initialize");
            return Err(PoolError::BackendUnavailable);
        }

        info!(
            max_concurrent_segments = max,
            ready = ?topology.kinds_where(Backend::is_available),
            failed = ?topology.kinds_where(|b| !b.is_available()),
            "Backend pool initialized"
        );

        phase.send_replace(PoolPhase::Ready);
        Ok(Arc::new(Self {
            config,
            router: Router::new(routing),
            factory,
            capabilities,
            topology: RwLock::new(Arc::new(topology)),
            semaphore: Arc::new(Semaphore::new(max)),
            phase,
            stats: Arc::new(UtilizationStats::new()),
            completions: Arc::new(Notify::new()),
            recycling: AtomicBool::new(false),
            exclusive: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &HardwareCapabilities {
        &self.capabilities
    }

    pub fn stats(&self) -> &Arc<UtilizationStats> {
        &self.stats
    }

    /// Signalled after every synthesis completion
    pub fn completions(&self) -> Arc<Notify> {
        Arc::clone(&self.completions)
    }

    pub fn phase(&self) -> PoolPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<PoolPhase> {
        self.phase.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.topology().generation
    }

    pub fn is_recycling(&self) -> bool {
        self.recycling.load(Ordering::Acquire)
    }

    fn topology(&self) -> Arc<Topology> {
        self.topology.read().clone()
    }

    pub fn health(&self) -> PoolHealth {
        match self.phase() {
            PoolPhase::Unavailable | PoolPhase::Closed => PoolHealth::Unavailable,
            _ => {
                let topology = self.topology();
                let expected = candidate_kinds(&self.factory, &self.capabilities).len();
                let live = topology
                    .backends
                    .iter()
                    .filter(|b| b.state() != BackendState::Failed)
                    .count();
                if live < expected {
                    PoolHealth::Degraded
                } else {
                    PoolHealth::Ready
                }
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let topology = self.topology();
        PoolStatus {
            phase: self.phase(),
            health: self.health(),
            generation: topology.generation,
            max_concurrent_segments: self.config.max_concurrent_segments.max(1),
            available_permits: self.semaphore.available_permits(),
            backends: topology.backends.iter().map(|b| b.info()).collect(),
        }
    }

    /// Backend kinds currently accepting work, highest capability first
    pub fn available_kinds(&self) -> Vec<BackendKind> {
        self.topology().kinds_where(Backend::is_available)
    }

    /// Routing decision for a segment against the current backend states
    pub fn route(&self, segment_index: usize, text: &str) -> SchedulingDecision {
        let topology = self.topology();
        self.router
            .decide(segment_index, text, &topology.statuses())
    }

    /// Synthesize one segment
    pub async fn process(
        &self,
        segment_index: usize,
        request: SynthesisRequest,
    ) -> Result<ProcessOutput, PoolError> {
        let permit = self.acquire_permit().await?;
        let (claim, decision) = self.claim_routed(segment_index, &request.text).await?;
        let kind = claim.kind();
        debug!(
            segment = segment_index,
            backend = %kind,
            complexity = decision.complexity,
            "Dispatching segment"
        );

        let (result, permit) = self.run_claimed(claim, request.clone(), permit).await;
        match result {
            Ok(audio) => Ok(ProcessOutput {
                audio,
                backend: kind,
                retried: false,
                decision,
            }),
            Err(SynthesisError::Transient(reason)) if kind != BackendKind::Baseline => {
                warn!(
                    segment = segment_index,
                    backend = %kind,
                    %reason,
                    "Transient failure, retrying on baseline"
                );
                self.stats.record_retry(kind);

                let permit = match permit {
                    Some(permit) => permit,
                    None => self.acquire_permit().await?,
                };
                let claim = self.claim_kind(BackendKind::Baseline).await?;
                let (result, _permit) = self.run_claimed(claim, request, permit).await;
                Ok(ProcessOutput {
                    audio: result?,
                    backend: BackendKind::Baseline,
                    retried: true,
                    decision,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)
    }

    async fn wait_until_ready(&self) -> Result<(), PoolError> {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                PoolPhase::Ready => return Ok(()),
                PoolPhase::Unavailable => return Err(PoolError::BackendUnavailable),
                PoolPhase::Closed => return Err(PoolError::Closed),
                PoolPhase::Initializing | PoolPhase::Draining => {}
            }
            rx.changed().await.map_err(|_| PoolError::Closed)?;
        }
    }

    async fn claim_routed(
        &self,
        segment_index: usize,
        text: &str,
    ) -> Result<(BackendClaim, SchedulingDecision), PoolError> {
        loop {
            self.wait_until_ready().await?;
            let topology = self.topology();
            let decision = self
                .router
                .decide(segment_index, text, &topology.statuses());

            // Preferred kind first, then any other backend by capability
            let preferred = topology.backend(decision.backend);
            let others = topology
                .backends
                .iter()
                .filter(|b| b.kind() != decision.backend);
            if let Some(claim) = preferred
                .into_iter()
                .chain(others)
                .find_map(|b| b.try_claim())
            {
                return Ok((claim, decision));
            }

            let backend = preferred
                .or_else(|| topology.backend(BackendKind::Baseline))
                .ok_or(PoolError::BackendUnavailable)?;
            if let Some(claim) = backend.claim().await {
                return Ok((claim, decision));
            }
            // Backend started draining while we waited
            tokio::task::yield_now().await;
        }
    }

    async fn claim_kind(&self, kind: BackendKind) -> Result<BackendClaim, PoolError> {
        loop {
            self.wait_until_ready().await?;
            let topology = self.topology();
            let backend = topology
                .backend(kind)
                .ok_or(PoolError::BackendUnavailable)?;
            if !backend.is_available() && self.phase() == PoolPhase::Ready {
                return Err(PoolError::BackendUnavailable);
            }
            if let Some(claim) = backend.claim().await {
                return Ok(claim);
            }
            tokio::task::yield_now().await;
        }
    }

    async fn run_claimed(
        &self,
        mut claim: BackendClaim,
        request: SynthesisRequest,
        permit: OwnedSemaphorePermit,
    ) -> (SynthesisResult<SynthesizedAudio>, Option<OwnedSemaphorePermit>) {
        let kind = claim.kind();
        let active = self.stats.begin(kind);
        let stats = Arc::clone(&self.stats);
        let completions = Arc::clone(&self.completions);

        let joined = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = claim.synthesize(&request);
            let elapsed = started.elapsed();

            drop(claim);
            drop(active);
            stats.record(kind, elapsed, result.is_ok());
            completions.notify_one();
            (result, permit)
        })
        .await;

        match joined {
            Ok((result, permit)) => (result, Some(permit)),
            Err(e) => {
                error!(backend = %kind, error = %e, "Synthesis task failed");
                self.stats.record(kind, Duration::ZERO, false);
                self.completions.notify_one();
                (
                    Err(SynthesisError::Fatal(format!("synthesis task failed: {e}"))),
                    None,
                )
            }
        }
    }

    /// Drain, tear down and rebuild every backend
    ///
    /// A second call while one is running returns
    /// [`RecycleOutcome::AlreadyRunning`] without doing anything. Returns
    /// `BackendUnavailable` if the baseline could not be rebuilt; the pool then
    /// rejects all work until a later recycle succeeds.
    pub async fn recycle(&self, reason: &str) -> Result<RecycleOutcome, PoolError> {
        if self.recycling.swap(true, Ordering::AcqRel) {
            debug!(%reason, "Recycle already in progress");
            return Ok(RecycleOutcome::AlreadyRunning);
        }
        let _running = ResetOnDrop(&self.recycling);

        if self.phase() == PoolPhase::Closed {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        info!(%reason, "Recycling backend pool");
        self.phase.send_replace(PoolPhase::Draining);

        let old = self.topology();
        let drained = self.drain(&old).await;
        let drain_timed_out: Vec<BackendKind> =
            drained.stragglers.iter().map(|b| b.kind()).collect();

        let _exclusive = self.exclusive.lock().await;
        teardown_engines(drained.engines, &self.factory).await;

        let backends = build_backends(&self.factory, &self.capabilities).await;
        let topology = Arc::new(Topology {
            generation: old.generation + 1,
            backends,
        });

        // At most one engine per kind runs at a time
        for straggler in drained.stragglers {
            let gate = topology
                .backend(straggler.kind())
                .and_then(|backend| backend.hold());
            self.release_straggler(straggler, gate);
        }
        let baseline_ready = topology.baseline_ready();
        let report = RecycleReport {
            generation: topology.generation,
            reason: reason.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            ready: topology.kinds_where(Backend::is_available),
            failed: topology.kinds_where(|b| !b.is_available()),
            drain_timed_out,
        };
        *self.topology.write() = topology;
        drop(old);

        let next = if baseline_ready {
            PoolPhase::Ready
        } else {
            PoolPhase::Unavailable
        };
        self.phase.send_if_modified(|phase| {
            if *phase == PoolPhase::Closed {
                false
            } else {
                *phase = next;
                true
            }
        });

        if !baseline_ready {
            error!(
                generation = report.generation,
                "Baseline backend failed to reinitialize, pool unavailable"
            );
            return Err(PoolError::BackendUnavailable);
        }

        info!(
            generation = report.generation,
            duration_ms = report.duration_ms,
            ready = ?report.ready,
            failed = ?report.failed,
            "Backend pool recycled"
        );
        Ok(RecycleOutcome::Completed(report))
    }

    /// Stop accepting work and tear down every backend
    pub async fn shutdown(&self) {
        if self.phase.send_replace(PoolPhase::Closed) == PoolPhase::Closed {
            return;
        }
        self.semaphore.close();
        info!("Shutting down backend pool");

        let old = self.topology();
        let drained = self.drain(&old).await;
        let _exclusive = self.exclusive.lock().await;
        teardown_engines(drained.engines, &self.factory).await;
        for straggler in drained.stragglers {
            self.release_straggler(straggler, None);
        }
    }

    async fn drain(&self, topology: &Topology) -> Drained {
        for backend in &topology.backends {
            backend.begin_drain();
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        let mut drained = Drained {
            engines: Vec::new(),
            stragglers: Vec::new(),
        };

        for backend in &topology.backends {
            let slot = backend.engine_slot();
            match tokio::time::timeout_at(deadline, slot.lock_owned()).await {
                Ok(mut guard) => {
                    if let Some(engine) = guard.take() {
                        drained.engines.push((backend.kind(), engine));
                    }
                    if backend.state() != BackendState::Failed {
                        backend.mark_uninitialized();
                    }
                }
                Err(_) => {
                    warn!(
                        backend = %backend.kind(),
                        timeout_ms = self.config.drain_timeout_ms,
                        "Drain timed out, engine released when its call finishes"
                    );
                    drained.stragglers.push(Arc::clone(backend));
                }
            }
        }

        drained
    }

    /// Tear down a timed-out backend's engine once its call returns, then open `gate`
    fn release_straggler(&self, backend: Arc<Backend>, gate: Option<BackendGate>) {
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            let mut slot = backend.engine_slot().lock_owned().await;
            let engine = slot.take();
            drop(slot);
            backend.mark_uninitialized();

            if let Some(engine) = engine {
                info!(backend = %backend.kind(), "Straggling call finished, releasing engine");
                teardown_engines(vec![(backend.kind(), engine)], &factory).await;
            }
            if let Some(gate) = gate {
                debug!(backend = %gate.kind(), "Replacement backend open");
            }
        });
    }
}

/// Result of draining one topology
struct Drained {
    engines: Vec<(BackendKind, Box<dyn SynthesisEngine>)>,
    /// Backends whose call outlived the drain timeout
    stragglers: Vec<Arc<Backend>>,
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Kinds to construct: supported by the host and the factory, baseline always
fn candidate_kinds(
    factory: &Arc<dyn EngineFactory>,
    capabilities: &HardwareCapabilities,
) -> Vec<BackendKind> {
    let supported = factory.supported_kinds();
    capabilities
        .available_kinds()
        .into_iter()
        .filter(|kind| *kind == BackendKind::Baseline || supported.contains(kind))
        .collect()
}

async fn build_backends(
    factory: &Arc<dyn EngineFactory>,
    capabilities: &HardwareCapabilities,
) -> Vec<Arc<Backend>> {
    let mut backends = Vec::new();
    for kind in candidate_kinds(factory, capabilities) {
        let factory = Arc::clone(factory);
        let caps = capabilities.clone();
        let created = tokio::task::spawn_blocking(move || factory.create(kind, &caps)).await;

        let backend = match created {
            Ok(Ok(engine)) => {
                info!(backend = %kind, engine = engine.name(), "Backend ready");
                Backend::ready(kind, engine)
            }
            Ok(Err(e)) => {
                warn!(backend = %kind, error = %e, "Backend failed to initialize");
                Backend::failed(kind, e.to_string())
            }
            Err(e) => {
                warn!(backend = %kind, error = %e, "Backend initialization task failed");
                Backend::failed(kind, e.to_string())
            }
        };
        backends.push(Arc::new(backend));
    }
    backends
}

async fn teardown_engines(
    engines: Vec<(BackendKind, Box<dyn SynthesisEngine>)>,
    factory: &Arc<dyn EngineFactory>,
) {
    let factory = Arc::clone(factory);
    let result = tokio::task::spawn_blocking(move || {
        for (kind, mut engine) in engines {
            debug!(backend = %kind, engine = engine.name(), "Tearing down engine");
            engine.teardown();
            drop(engine);
        }
        factory.reclaim();
    })
    .await;

    if let Err(e) = result {
        error!(error = %e, "Engine teardown task failed");
    }
}
