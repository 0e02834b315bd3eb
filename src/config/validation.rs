use super::{ConfigError, ServerConfig};
use crate::core::engine::{BackendKind, EngineKind};

/// Validate the merged configuration
pub fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    validate_pool(config)?;
    validate_segmenter(config)?;
    validate_routing(config)?;
    validate_watchdog(config)?;
    validate_engine(config)?;
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn validate_pool(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.pool.max_concurrent_segments == 0 {
        return Err(invalid("pool.max_concurrent_segments must be at least 1"));
    }
    Ok(())
}

fn validate_segmenter(config: &ServerConfig) -> Result<(), ConfigError> {
    let segmenter = &config.segmenter;
    if segmenter.max_segment_len == 0 {
        return Err(invalid("segmenter.max_segment_len must be at least 1"));
    }
    if segmenter.first_segment_min_len > segmenter.max_segment_len {
        return Err(invalid(format!(
            "segmenter.first_segment_min_len ({}) exceeds max_segment_len ({})",
            segmenter.first_segment_min_len, segmenter.max_segment_len
        )));
    }
    Ok(())
}

fn validate_routing(config: &ServerConfig) -> Result<(), ConfigError> {
    let routing = &config.routing;
    let weights = [
        routing.length_weight,
        routing.diversity_weight,
        routing.special_weight,
    ];
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(invalid("routing weights must be finite and non-negative"));
    }
    if weights.iter().sum::<f32>() <= 0.0 {
        return Err(invalid("routing weights must sum to a positive value"));
    }
    if routing.medium_threshold > routing.high_threshold {
        return Err(invalid(
            "routing.medium_threshold must not exceed routing.high_threshold",
        ));
    }
    Ok(())
}

fn validate_watchdog(config: &ServerConfig) -> Result<(), ConfigError> {
    let watchdog = &config.watchdog;
    if !watchdog.enabled {
        return Ok(());
    }
    if watchdog.sample_interval_secs == 0 {
        return Err(invalid("watchdog.sample_interval_secs must be at least 1"));
    }
    if watchdog.consecutive_checks == 0 {
        return Err(invalid("watchdog.consecutive_checks must be at least 1"));
    }
    if let Some(pct) = watchdog.fragmentation_threshold_pct
        && !(0.0..=100.0).contains(&pct)
    {
        return Err(invalid(format!(
            "watchdog.fragmentation_threshold_pct must be within 0-100, got {pct}"
        )));
    }
    Ok(())
}

fn validate_engine(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.engine.kind == EngineKind::Remote
        && config
            .engine
            .remote
            .endpoint_for(BackendKind::Baseline)
            .is_none()
    {
        return Err(invalid(
            "engine.kind 'remote' requires a baseline endpoint (engine.remote.endpoints.baseline or REMOTE_BASELINE_URL)",
        ));
    }
    Ok(())
}
