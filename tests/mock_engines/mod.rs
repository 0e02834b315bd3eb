//! Programmable synthesis engines for integration tests
//!
//! Engines render audio with the built-in tone engine, so output depends only
//! on the request and never on which backend produced it. On top of that the
//! factory can inject:
//! - per-call latency, globally or for texts containing a marker
//! - transient or fatal failures per backend kind or per text marker
//! - initialization failures per backend kind
//!
//! Every call is recorded in an [`EngineProbe`] that tracks global and
//! per-backend concurrency.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use cadence_gateway::core::engine::{
    BackendKind, EngineFactory, EngineInitError, HardwareCapabilities, SynthesisEngine,
    SynthesisError, SynthesisRequest, SynthesisResult, SynthesizedAudio, ToneEngine,
    ToneEngineConfig,
};
use cadence_gateway::core::watchdog::{MemoryProbe, MemoryReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Transient,
    Fatal,
}

impl FailureMode {
    fn error(self, detail: &str) -> SynthesisError {
        match self {
            FailureMode::Transient => SynthesisError::Transient(format!("mock: {detail}")),
            FailureMode::Fatal => SynthesisError::Fatal(format!("mock: {detail}")),
        }
    }
}

/// Concurrency and call instrumentation shared by all engines of a factory
#[derive(Debug, Default)]
pub struct EngineProbe {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    active_per_kind: [AtomicUsize; 3],
    calls_per_kind: [AtomicUsize; 3],
    overlap_violations: AtomicUsize,
    completed: AtomicUsize,
}

impl EngineProbe {
    fn enter(&self, kind: BackendKind) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        self.calls_per_kind[kind.slot()].fetch_add(1, Ordering::SeqCst);
        if self.active_per_kind[kind.slot()].fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlap_violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit(&self, kind: BackendKind) {
        self.active_per_kind[kind.slot()].fetch_sub(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneously executing calls
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// Times a call started while another call ran on the same backend
    pub fn overlap_violations(&self) -> usize {
        self.overlap_violations.load(Ordering::SeqCst)
    }

    pub fn calls(&self, kind: BackendKind) -> usize {
        self.calls_per_kind[kind.slot()].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        BackendKind::ALL.iter().map(|kind| self.calls(*kind)).sum()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
struct Behavior {
    latency: Duration,
    slow_marker: Option<(String, Duration)>,
    kind_failures: HashMap<BackendKind, FailureMode>,
    text_failures: Vec<(String, FailureMode)>,
}

/// Engine factory with scripted behavior
pub struct MockEngineFactory {
    behavior: Arc<Behavior>,
    probe: Arc<EngineProbe>,
    init_failures: Mutex<HashSet<BackendKind>>,
    creates: AtomicUsize,
    teardowns: Arc<AtomicUsize>,
    reclaims: AtomicUsize,
}

impl Default for MockEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::from_behavior(Behavior::default())
    }

    fn from_behavior(behavior: Behavior) -> Self {
        Self {
            behavior: Arc::new(behavior),
            probe: Arc::new(EngineProbe::default()),
            init_failures: Mutex::new(HashSet::new()),
            creates: AtomicUsize::new(0),
            teardowns: Arc::new(AtomicUsize::new(0)),
            reclaims: AtomicUsize::new(0),
        }
    }

    fn with(self, change: impl FnOnce(&mut Behavior)) -> Self {
        let mut behavior = (*self.behavior).clone();
        change(&mut behavior);
        Self::from_behavior(behavior)
    }

    /// Sleep this long in every call
    pub fn with_latency(self, latency: Duration) -> Self {
        self.with(|b| b.latency = latency)
    }

    /// Sleep `latency` instead when the text contains `marker`
    pub fn with_slow_text(self, marker: &str, latency: Duration) -> Self {
        self.with(|b| b.slow_marker = Some((marker.to_string(), latency)))
    }

    /// Every call on `kind` fails with `mode`
    pub fn failing_kind(self, kind: BackendKind, mode: FailureMode) -> Self {
        self.with(|b| {
            b.kind_failures.insert(kind, mode);
        })
    }

    /// Every call whose text contains `marker` fails with `mode`
    pub fn failing_text(self, marker: &str, mode: FailureMode) -> Self {
        self.with(|b| b.text_failures.push((marker.to_string(), mode)))
    }

    /// Make `create` fail for `kind` until cleared
    pub fn fail_init(&self, kind: BackendKind, fail: bool) {
        let mut failures = self.init_failures.lock();
        if fail {
            failures.insert(kind);
        } else {
            failures.remove(&kind);
        }
    }

    pub fn probe(&self) -> Arc<EngineProbe> {
        Arc::clone(&self.probe)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        kind: BackendKind,
        _capabilities: &HardwareCapabilities,
    ) -> Result<Box<dyn SynthesisEngine>, EngineInitError> {
        if self.init_failures.lock().contains(&kind) {
            return Err(EngineInitError::Failed {
                kind,
                reason: "mock init failure".to_string(),
            });
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            kind,
            tone: ToneEngine::new(kind, &ToneEngineConfig::default()),
            behavior: Arc::clone(&self.behavior),
            probe: Arc::clone(&self.probe),
            teardowns: Arc::clone(&self.teardowns),
        }))
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockEngine {
    kind: BackendKind,
    tone: ToneEngine,
    behavior: Arc<Behavior>,
    probe: Arc<EngineProbe>,
    teardowns: Arc<AtomicUsize>,
}

impl SynthesisEngine for MockEngine {
    fn synthesize(&mut self, request: &SynthesisRequest) -> SynthesisResult<SynthesizedAudio> {
        self.probe.enter(self.kind);

        let latency = match &self.behavior.slow_marker {
            Some((marker, slow)) if request.text.contains(marker.as_str()) => *slow,
            _ => self.behavior.latency,
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let failure = self.behavior.kind_failures.get(&self.kind).copied().or_else(|| {
            self.behavior
                .text_failures
                .iter()
                .find(|(marker, _)| request.text.contains(marker.as_str()))
                .map(|(_, mode)| *mode)
        });
        let result = match failure {
            Some(mode) => Err(mode.error(self.kind.as_str())),
            None => self.tone.synthesize(request),
        };

        self.probe.exit(self.kind);
        result
    }

    fn teardown(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Memory probe returning a scripted resident size
#[derive(Debug)]
pub struct ScriptedMemory {
    resident_mb: AtomicUsize,
}

impl ScriptedMemory {
    pub fn new(resident_mb: usize) -> Arc<Self> {
        Arc::new(Self {
            resident_mb: AtomicUsize::new(resident_mb),
        })
    }

    pub fn set(&self, resident_mb: usize) {
        self.resident_mb.store(resident_mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for ScriptedMemory {
    fn read(&self) -> Option<MemoryReading> {
        let resident = self.resident_mb.load(Ordering::SeqCst) as u64 * 1024 * 1024;
        Some(MemoryReading {
            resident_bytes: resident,
            virtual_bytes: resident * 2,
        })
    }
}
