//! Backend kinds and host capability detection

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::core::pool::PoolConfig;

/// One of the interchangeable synthesis backend configurations
///
/// Kinds differ in cost and hardware affinity, never in output correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Highest-capability accelerated configuration
    AcceleratedA,
    /// Mid-capability accelerated configuration
    AcceleratedB,
    /// Portable configuration that must always initialize
    Baseline,
}

impl BackendKind {
    /// All kinds, highest capability first
    pub const ALL: [BackendKind; 3] = [
        BackendKind::AcceleratedA,
        BackendKind::AcceleratedB,
        BackendKind::Baseline,
    ];

    /// Relative capability, higher is faster
    pub fn capability_rank(self) -> u8 {
        match self {
            BackendKind::AcceleratedA => 2,
            BackendKind::AcceleratedB => 1,
            BackendKind::Baseline => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::AcceleratedA => "accelerated-a",
            BackendKind::AcceleratedB => "accelerated-b",
            BackendKind::Baseline => "baseline",
        }
    }

    /// Dense index for per-kind counter arrays
    pub fn slot(self) -> usize {
        match self {
            BackendKind::AcceleratedA => 0,
            BackendKind::AcceleratedB => 1,
            BackendKind::Baseline => 2,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed host capabilities, computed once at pool initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareCapabilities {
    pub accelerated_a: bool,
    pub accelerated_b: bool,
    pub logical_cores: usize,
    pub physical_cores: usize,
    pub memory_mb: u64,
}

impl HardwareCapabilities {
    /// Probe the host
    ///
    /// Accelerated kinds are opt-in through the pool configuration; the
    /// mid-capability kind additionally needs enough physical cores to run
    /// alongside the baseline without starving it.
    pub fn detect(config: &PoolConfig) -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();

        let mut system = System::new();
        system.refresh_memory();
        let memory_mb = system.total_memory() / (1024 * 1024);

        let caps = Self {
            accelerated_a: config.enable_accelerated_a,
            accelerated_b: config.enable_accelerated_b
                && physical_cores >= config.accelerated_b_min_cores,
            logical_cores,
            physical_cores,
            memory_mb,
        };

        tracing::info!(
            logical_cores,
            physical_cores,
            memory_mb,
            kinds = ?caps.available_kinds(),
            "Detected hardware capabilities"
        );

        caps
    }

    /// Capabilities that only support the baseline kind
    pub fn baseline_only() -> Self {
        Self {
            accelerated_a: false,
            accelerated_b: false,
            logical_cores: 1,
            physical_cores: 1,
            memory_mb: 0,
        }
    }

    /// Capabilities that support every kind
    pub fn all_kinds() -> Self {
        Self {
            accelerated_a: true,
            accelerated_b: true,
            ..Self::baseline_only()
        }
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::AcceleratedA => self.accelerated_a,
            BackendKind::AcceleratedB => self.accelerated_b,
            BackendKind::Baseline => true,
        }
    }

    /// Supported kinds, highest capability first
    pub fn available_kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .collect()
    }
}
