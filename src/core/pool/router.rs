//! Complexity-based backend routing
//!
//! Scores segment text in [0, 1] from three normalized features (length,
//! character diversity and symbol density) and maps the score to a tier.
//! Each tier has a preference order over the backends that are available and
//! idle at decision time. Idleness is advisory; the caller's claim on the
//! backend is what actually reserves it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::engine::BackendKind;

/// Routing heuristic weights and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub length_weight: f32,
    pub diversity_weight: f32,
    pub special_weight: f32,
    /// Character count that saturates the length feature
    pub length_norm: usize,
    /// Distinct character count that saturates the diversity feature
    pub diversity_norm: usize,
    /// Symbol density that saturates the special-character feature
    pub special_norm: f32,
    pub high_threshold: f32,
    pub medium_threshold: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            length_weight: 0.5,
            diversity_weight: 0.3,
            special_weight: 0.2,
            length_norm: 200,
            diversity_norm: 32,
            special_norm: 0.15,
            high_threshold: 0.6,
            medium_threshold: 0.35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Low,
    Medium,
    High,
}

/// Routing-time view of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStatus {
    pub kind: BackendKind,
    /// Initialized and accepting work
    pub available: bool,
    /// Not currently executing a call
    pub idle: bool,
}

/// Transient routing record, used for dispatch and logging only
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SchedulingDecision {
    pub segment_index: usize,
    pub backend: BackendKind,
    pub complexity: f32,
    pub tier: ComplexityTier,
}

#[derive(Debug, Clone, Default)]
pub struct Router {
    config: RoutingConfig,
}

impl Router {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Complexity score in [0, 1]
    pub fn complexity(&self, text: &str) -> f32 {
        let cfg = &self.config;
        let total_weight = cfg.length_weight + cfg.diversity_weight + cfg.special_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }

        let mut chars = 0usize;
        let mut specials = 0usize;
        let mut distinct = HashSet::new();
        for c in text.chars() {
            chars += 1;
            if c.is_whitespace() {
                continue;
            }
            if !c.is_alphanumeric() {
                specials += 1;
            }
            distinct.extend(c.to_lowercase());
        }
        if chars == 0 {
            return 0.0;
        }

        let length = saturate(chars as f32, cfg.length_norm as f32);
        let diversity = saturate(distinct.len() as f32, cfg.diversity_norm as f32);
        let special = saturate(specials as f32 / chars as f32, cfg.special_norm);

        let score = (cfg.length_weight * length
            + cfg.diversity_weight * diversity
            + cfg.special_weight * special)
            / total_weight;
        score.clamp(0.0, 1.0)
    }

    pub fn tier(&self, score: f32) -> ComplexityTier {
        if score > self.config.high_threshold {
            ComplexityTier::High
        } else if score > self.config.medium_threshold {
            ComplexityTier::Medium
        } else {
            ComplexityTier::Low
        }
    }

    /// Choose a backend kind for a segment
    pub fn decide(
        &self,
        segment_index: usize,
        text: &str,
        backends: &[BackendStatus],
    ) -> SchedulingDecision {
        let complexity = self.complexity(text);
        let tier = self.tier(complexity);
        SchedulingDecision {
            segment_index,
            backend: select(tier, backends),
            complexity,
            tier,
        }
    }
}

fn saturate(value: f32, norm: f32) -> f32 {
    if norm <= 0.0 {
        return 1.0;
    }
    (value / norm).min(1.0)
}

fn select(tier: ComplexityTier, backends: &[BackendStatus]) -> BackendKind {
    let mut available: Vec<&BackendStatus> = backends.iter().filter(|b| b.available).collect();
    available.sort_by_key(|b| std::cmp::Reverse(b.kind.capability_rank()));

    let is = |kind: BackendKind, need_idle: bool| {
        available
            .iter()
            .any(|b| b.kind == kind && (!need_idle || b.idle))
    };
    let first_idle = || available.iter().find(|b| b.idle).map(|b| b.kind);
    let fallback = || {
        if is(BackendKind::Baseline, false) {
            BackendKind::Baseline
        } else {
            available
                .first()
                .map(|b| b.kind)
                .unwrap_or(BackendKind::Baseline)
        }
    };

    match tier {
        ComplexityTier::High => first_idle()
            .or_else(|| available.first().map(|b| b.kind))
            .unwrap_or(BackendKind::Baseline),
        ComplexityTier::Medium => {
            if is(BackendKind::AcceleratedB, true) {
                BackendKind::AcceleratedB
            } else if let Some(kind) = first_idle() {
                kind
            } else if is(BackendKind::AcceleratedB, false) {
                BackendKind::AcceleratedB
            } else {
                fallback()
            }
        }
        ComplexityTier::Low => {
            if is(BackendKind::Baseline, true) {
                BackendKind::Baseline
            } else {
                available
                    .iter()
                    .rev()
                    .find(|b| b.idle)
                    .map(|b| b.kind)
                    .unwrap_or_else(fallback)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(kind: BackendKind, idle: bool) -> BackendStatus {
        BackendStatus {
            kind,
            available: true,
            idle,
        }
    }

    fn all_idle() -> Vec<BackendStatus> {
        BackendKind::ALL.into_iter().map(|k| status(k, true)).collect()
    }

    #[test]
    fn test_complexity_is_bounded_and_monotonic_in_length() {
        let router = Router::default();
        assert_eq!(router.complexity(""), 0.0);

        let short = router.complexity("ok");
        let longer = router.complexity(&"ok ".repeat(40));
        assert!(short < longer);
        assert!((0.0..=1.0).contains(&router.complexity(&"x!?#".repeat(500))));
    }

    #[test]
    fn test_symbols_raise_complexity() {
        let router = Router::default();
        let plain = router.complexity("the cat sat on the mat");
        let symbolic = router.complexity("the $cat; sat (on) #the mat!");
        assert!(symbolic > plain);
    }

    #[test]
    fn test_tiers() {
        let router = Router::default();
        assert_eq!(router.tier(0.9), ComplexityTier::High);
        assert_eq!(router.tier(0.5), ComplexityTier::Medium);
        assert_eq!(router.tier(0.1), ComplexityTier::Low);
    }

    #[test]
    fn test_high_prefers_most_capable_idle() {
        assert_eq!(
            select(ComplexityTier::High, &all_idle()),
            BackendKind::AcceleratedA
        );

        let busy_a = vec![
            status(BackendKind::AcceleratedA, false),
            status(BackendKind::AcceleratedB, true),
            status(BackendKind::Baseline, true),
        ];
        assert_eq!(
            select(ComplexityTier::High, &busy_a),
            BackendKind::AcceleratedB
        );

        let all_busy: Vec<_> = BackendKind::ALL.into_iter().map(|k| status(k, false)).collect();
        assert_eq!(
            select(ComplexityTier::High, &all_busy),
            BackendKind::AcceleratedA
        );
    }

    #[test]
    fn test_medium_prefers_mid_capability() {
        assert_eq!(
            select(ComplexityTier::Medium, &all_idle()),
            BackendKind::AcceleratedB
        );

        let no_b = vec![
            status(BackendKind::AcceleratedA, true),
            status(BackendKind::Baseline, true),
        ];
        assert_eq!(
            select(ComplexityTier::Medium, &no_b),
            BackendKind::AcceleratedA
        );
    }

    #[test]
    fn test_low_prefers_idle_then_baseline() {
        assert_eq!(
            select(ComplexityTier::Low, &all_idle()),
            BackendKind::Baseline
        );

        let baseline_busy = vec![
            status(BackendKind::AcceleratedA, true),
            status(BackendKind::AcceleratedB, false),
            status(BackendKind::Baseline, false),
        ];
        assert_eq!(
            select(ComplexityTier::Low, &baseline_busy),
            BackendKind::AcceleratedA
        );

        let all_busy: Vec<_> = BackendKind::ALL.into_iter().map(|k| status(k, false)).collect();
        assert_eq!(select(ComplexityTier::Low, &all_busy), BackendKind::Baseline);
    }

    #[test]
    fn test_unavailable_backends_are_skipped() {
        let statuses = vec![
            BackendStatus {
                kind: BackendKind::AcceleratedA,
                available: false,
                idle: false,
            },
            status(BackendKind::Baseline, true),
        ];
        for tier in [
            ComplexityTier::High,
            ComplexityTier::Medium,
            ComplexityTier::Low,
        ] {
            assert_eq!(select(tier, &statuses), BackendKind::Baseline);
        }
    }

    #[test]
    fn test_decision_records_score() {
        let router = Router::default();
        let decision = router.decide(3, "Short.", &all_idle());
        assert_eq!(decision.segment_index, 3);
        assert_eq!(decision.tier, ComplexityTier::Low);
        assert_eq!(decision.backend, BackendKind::Baseline);
    }
}
