//! Resource watchdog
//!
//! Samples process memory on a timer and after synthesis completions, and
//! recycles the backend pool when native memory use looks unhealthy:
//!
//! - the recycle interval has elapsed since the last recycle
//! - resident memory stayed more than `memory_delta_mb` above the startup
//!   baseline for `consecutive_checks` reactive checks in a row
//! - the fragmentation estimate (share of virtual memory not resident)
//!   exceeds `fragmentation_threshold_pct`, when configured
//!
//! Recycles are spaced by at least `cooldown_secs`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::pool::{BackendPool, PoolError, RecycleOutcome};

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Unconditional recycle interval
    pub interval_secs: u64,
    /// Periodic sampling interval
    pub sample_interval_secs: u64,
    /// Allowed growth over the baseline before a reactive check counts
    pub memory_delta_mb: u64,
    /// Consecutive over-delta reactive checks that trigger a recycle
    pub consecutive_checks: u32,
    /// Fragmentation estimate (percent) that triggers a recycle; unset disables the check
    pub fragmentation_threshold_pct: Option<f64>,
    /// Minimum spacing between recycles
    pub cooldown_secs: u64,
    /// Minimum spacing between reactive checks
    pub min_check_spacing_ms: u64,
    /// Samples retained for reporting
    pub sample_capacity: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            sample_interval_secs: 30,
            memory_delta_mb: 512,
            consecutive_checks: 3,
            fragmentation_threshold_pct: None,
            cooldown_secs: 60,
            min_check_spacing_ms: 1000,
            sample_capacity: 120,
        }
    }
}

/// Raw process memory reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

impl MemoryReading {
    pub fn resident_mb(&self) -> f64 {
        self.resident_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Share of virtual memory that is not resident, in percent
    pub fn fragmentation_pct(&self) -> f64 {
        if self.virtual_bytes == 0 || self.resident_bytes >= self.virtual_bytes {
            return 0.0;
        }
        (1.0 - self.resident_bytes as f64 / self.virtual_bytes as f64) * 100.0
    }
}

/// Source of process memory readings
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> Option<MemoryReading>;
}

/// Reads the current process through `sysinfo`
pub struct SysinfoProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!("Unable to resolve current pid: {}", e))
            .ok();
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn read(&self) -> Option<MemoryReading> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        let process = system.process(pid)?;
        Some(MemoryReading {
            resident_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FragmentationSample {
    /// Unix time in milliseconds
    pub timestamp_ms: u64,
    pub memory_mb: f64,
    pub fragmentation_pct: f64,
}

/// Memory pressure relative to the configured delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressureLevel::Normal => write!(f, "normal"),
            PressureLevel::Elevated => write!(f, "elevated"),
            PressureLevel::High => write!(f, "high"),
            PressureLevel::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecycleReason {
    Interval,
    MemoryGrowth { growth_mb: f64 },
    Fragmentation { pct: f64 },
    Manual,
}

impl std::fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecycleReason::Interval => write!(f, "interval elapsed"),
            RecycleReason::MemoryGrowth { growth_mb } => {
                write!(f, "memory grew {growth_mb:.1} MB over baseline")
            }
            RecycleReason::Fragmentation { pct } => write!(f, "fragmentation at {pct:.1}%"),
            RecycleReason::Manual => write!(f, "manual"),
        }
    }
}

/// What prompted a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTrigger {
    Periodic,
    /// After a synthesis completion
    Reactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStats {
    pub cleanup_count: u64,
    /// Seconds since the last recycle, if any has happened
    pub last_cleanup_age_secs: Option<u64>,
    pub pressure_level: PressureLevel,
    pub baseline_memory_mb: Option<f64>,
    pub last_sample: Option<FragmentationSample>,
    pub consecutive_over_threshold: u32,
    pub last_reason: Option<RecycleReason>,
    pub samples_retained: usize,
    pub running: bool,
}

struct WatchdogState {
    samples: VecDeque<FragmentationSample>,
    baseline_mb: Option<f64>,
    consecutive_over: u32,
    pressure: PressureLevel,
    started: Instant,
    last_cleanup: Option<Instant>,
    last_reactive_check: Option<Instant>,
    last_reason: Option<RecycleReason>,
}

pub struct ResourceWatchdog {
    config: WatchdogConfig,
    pool: Arc<BackendPool>,
    probe: Arc<dyn MemoryProbe>,
    state: Mutex<WatchdogState>,
    cleanup_count: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceWatchdog {
    /// Create a watchdog; the memory baseline is taken now
    pub fn new(
        config: WatchdogConfig,
        pool: Arc<BackendPool>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Arc<Self> {
        let baseline_mb = probe.read().map(|r| r.resident_mb());
        if let Some(mb) = baseline_mb {
            info!(baseline_mb = mb, "Watchdog memory baseline");
        }

        Arc::new(Self {
            state: Mutex::new(WatchdogState {
                samples: VecDeque::with_capacity(config.sample_capacity.max(1)),
                baseline_mb,
                consecutive_over: 0,
                pressure: PressureLevel::Normal,
                started: Instant::now(),
                last_cleanup: None,
                last_reactive_check: None,
                last_reason: None,
            }),
            config,
            pool,
            probe,
            cleanup_count: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Spawn the background task; no-op when disabled or already running
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Resource watchdog disabled");
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let watchdog = Arc::clone(self);
        *task = Some(tokio::spawn(async move { watchdog.run().await }));
        info!(
            interval_secs = self.config.interval_secs,
            memory_delta_mb = self.config.memory_delta_mb,
            consecutive_checks = self.config.consecutive_checks,
            "Resource watchdog started"
        );
    }

    /// Stop the background task and wait for it to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Watchdog task failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn run(self: Arc<Self>) {
        let completions = self.pool.completions();
        let period = Duration::from_secs(self.config.sample_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_and_recycle(CheckTrigger::Periodic).await;
                }
                _ = completions.notified() => {
                    self.check_and_recycle(CheckTrigger::Reactive).await;
                }
            }
        }
        debug!("Resource watchdog stopped");
    }

    /// Sample memory and decide whether a recycle is due
    pub fn check(&self, trigger: CheckTrigger) -> Option<RecycleReason> {
        let now = Instant::now();

        if trigger == CheckTrigger::Reactive {
            let mut state = self.state.lock();
            let spacing = Duration::from_millis(self.config.min_check_spacing_ms);
            if state
                .last_reactive_check
                .is_some_and(|last| now.duration_since(last) < spacing)
            {
                return None;
            }
            state.last_reactive_check = Some(now);
        }

        // Reading memory may refresh process info; never do it with the state locked
        let reading = self.probe.read();
        let mut state = self.state.lock();
        let mut reason = None;

        if let Some(reading) = reading {
            let sample = FragmentationSample {
                timestamp_ms: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default(),
                memory_mb: reading.resident_mb(),
                fragmentation_pct: reading.fragmentation_pct(),
            };
            if state.samples.len() >= self.config.sample_capacity.max(1) {
                state.samples.pop_front();
            }
            state.samples.push_back(sample);

            let growth_mb = state
                .baseline_mb
                .map(|baseline| sample.memory_mb - baseline)
                .unwrap_or(0.0);
            let delta = self.config.memory_delta_mb as f64;
            let over = growth_mb > delta;

            if trigger == CheckTrigger::Reactive {
                if over {
                    state.consecutive_over += 1;
                } else {
                    state.consecutive_over = 0;
                }
            }

            let pressure = pressure_level(
                growth_mb,
                delta,
                state.consecutive_over,
                self.config.consecutive_checks,
            );
            if pressure != state.pressure {
                if pressure > state.pressure {
                    warn!(
                        from = %state.pressure,
                        to = %pressure,
                        memory_mb = sample.memory_mb,
                        "Memory pressure rising"
                    );
                } else {
                    info!(from = %state.pressure, to = %pressure, "Memory pressure easing");
                }
                state.pressure = pressure;
            }

            if over && state.consecutive_over >= self.config.consecutive_checks.max(1) {
                reason = Some(RecycleReason::MemoryGrowth { growth_mb });
            } else if let Some(threshold) = self.config.fragmentation_threshold_pct
                && sample.fragmentation_pct > threshold
            {
                reason = Some(RecycleReason::Fragmentation {
                    pct: sample.fragmentation_pct,
                });
            }
        }

        let since_cleanup = now.duration_since(state.last_cleanup.unwrap_or(state.started));
        if reason.is_none() && since_cleanup >= Duration::from_secs(self.config.interval_secs) {
            reason = Some(RecycleReason::Interval);
        }

        if reason.is_some()
            && let Some(last) = state.last_cleanup
            && now.duration_since(last) < Duration::from_secs(self.config.cooldown_secs)
        {
            debug!(reason = ?reason, "Recycle suppressed by cooldown");
            return None;
        }

        reason
    }

    async fn check_and_recycle(&self, trigger: CheckTrigger) {
        if let Some(reason) = self.check(trigger)
            && let Err(e) = self.recycle(reason).await
        {
            error!("Watchdog recycle failed: {}", e);
        }
    }

    /// Recycle the pool now, recording `reason`
    pub async fn recycle(&self, reason: RecycleReason) -> Result<RecycleOutcome, PoolError> {
        info!(%reason, "Watchdog triggering pool recycle");
        let result = self.pool.recycle(&reason.to_string()).await;

        let completed = !matches!(result, Ok(RecycleOutcome::AlreadyRunning));
        if completed {
            let mut state = self.state.lock();
            state.last_cleanup = Some(Instant::now());
            state.consecutive_over = 0;
            state.last_reason = Some(reason);
            drop(state);
            self.cleanup_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn stats(&self) -> WatchdogStats {
        let state = self.state.lock();
        WatchdogStats {
            cleanup_count: self.cleanup_count.load(Ordering::Relaxed),
            last_cleanup_age_secs: state.last_cleanup.map(|t| t.elapsed().as_secs()),
            pressure_level: state.pressure,
            baseline_memory_mb: state.baseline_mb,
            last_sample: state.samples.back().copied(),
            consecutive_over_threshold: state.consecutive_over,
            last_reason: state.last_reason.clone(),
            samples_retained: state.samples.len(),
            running: self.is_running(),
        }
    }

    /// Retained samples, oldest first
    pub fn samples(&self) -> Vec<FragmentationSample> {
        self.state.lock().samples.iter().copied().collect()
    }
}

fn pressure_level(growth_mb: f64, delta_mb: f64, consecutive: u32, k: u32) -> PressureLevel {
    if delta_mb <= 0.0 {
        return PressureLevel::Normal;
    }
    let ratio = growth_mb / delta_mb;
    if ratio >= 1.0 && consecutive >= k.max(1) {
        PressureLevel::Critical
    } else if ratio >= 1.0 {
        PressureLevel::High
    } else if ratio >= 0.5 {
        PressureLevel::Elevated
    } else {
        PressureLevel::Normal
    }
}
