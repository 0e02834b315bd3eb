use std::path::PathBuf;

use super::env::EnvConfig;
use super::yaml::YamlConfig;
use super::{ServerConfig, TlsConfig};

/// Overwrite `target` when `value` is set
fn apply<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Merge environment values (base) with YAML overrides
///
/// Starts from defaults, applies the environment, then applies YAML.
pub fn merge_config(yaml: Option<YamlConfig>, env: &EnvConfig) -> ServerConfig {
    let mut config = ServerConfig::default();
    apply_env(&mut config, env);
    if let Some(yaml) = yaml {
        apply_yaml(&mut config, yaml);
    }
    config
}

fn apply_env(config: &mut ServerConfig, env: &EnvConfig) {
    apply(&mut config.host, env.host.clone());
    apply(&mut config.port, env.port);
    if env.tls.is_some() {
        config.tls = env.tls.clone();
    }

    if env.cors_allowed_origins.is_some() {
        config.cors_allowed_origins = env.cors_allowed_origins.clone();
    }
    apply(
        &mut config.rate_limit_requests_per_second,
        env.rate_limit_requests_per_second,
    );
    apply(&mut config.rate_limit_burst_size, env.rate_limit_burst_size);

    let pool = &mut config.pool;
    apply(&mut pool.max_concurrent_segments, env.max_concurrent_segments);
    apply(&mut pool.enable_accelerated_a, env.enable_accelerated_a);
    apply(&mut pool.enable_accelerated_b, env.enable_accelerated_b);
    apply(&mut pool.drain_timeout_ms, env.drain_timeout_ms);

    let watchdog = &mut config.watchdog;
    apply(&mut watchdog.enabled, env.watchdog_enabled);
    apply(&mut watchdog.interval_secs, env.watchdog_interval_secs);
    apply(&mut watchdog.memory_delta_mb, env.watchdog_memory_delta_mb);

    let cache = &mut config.cache;
    apply(&mut cache.enabled, env.cache_enabled);
    apply(&mut cache.capacity, env.cache_capacity);
    apply(&mut cache.ttl_secs, env.cache_ttl_secs);

    let engine = &mut config.engine;
    apply(&mut engine.kind, env.engine_kind);
    engine.remote.endpoints.extend(
        env.remote_endpoints
            .iter()
            .map(|(kind, url)| (kind.clone(), url.clone())),
    );
    if env.remote_api_key.is_some() {
        engine.remote.api_key = env.remote_api_key.clone();
    }
    apply(&mut engine.remote.timeout_ms, env.remote_timeout_ms);
}

fn apply_yaml(config: &mut ServerConfig, yaml: YamlConfig) {
    if let Some(server) = yaml.server {
        apply(&mut config.host, server.host);
        apply(&mut config.port, server.port);
        if let Some(tls) = server.tls {
            match tls.enabled {
                Some(false) => config.tls = None,
                _ => {
                    if let (Some(cert_path), Some(key_path)) = (tls.cert_path, tls.key_path) {
                        config.tls = Some(TlsConfig {
                            cert_path: PathBuf::from(cert_path),
                            key_path: PathBuf::from(key_path),
                        });
                    }
                }
            }
        }
    }

    if let Some(security) = yaml.security {
        if security.cors_allowed_origins.is_some() {
            config.cors_allowed_origins = security.cors_allowed_origins;
        }
        apply(
            &mut config.rate_limit_requests_per_second,
            security.rate_limit_requests_per_second,
        );
        apply(&mut config.rate_limit_burst_size, security.rate_limit_burst_size);
    }

    apply(&mut config.segmenter, yaml.segmenter);
    apply(&mut config.routing, yaml.routing);
    apply(&mut config.chunking, yaml.chunking);

    if let Some(pool_yaml) = yaml.pool {
        let pool = &mut config.pool;
        apply(&mut pool.max_concurrent_segments, pool_yaml.max_concurrent_segments);
        apply(&mut pool.enable_accelerated_a, pool_yaml.enable_accelerated_a);
        apply(&mut pool.enable_accelerated_b, pool_yaml.enable_accelerated_b);
        apply(&mut pool.accelerated_b_min_cores, pool_yaml.accelerated_b_min_cores);
        apply(&mut pool.drain_timeout_ms, pool_yaml.drain_timeout_ms);
    }

    if let Some(watchdog_yaml) = yaml.watchdog {
        let watchdog = &mut config.watchdog;
        apply(&mut watchdog.enabled, watchdog_yaml.enabled);
        apply(&mut watchdog.interval_secs, watchdog_yaml.interval_secs);
        apply(&mut watchdog.sample_interval_secs, watchdog_yaml.sample_interval_secs);
        apply(&mut watchdog.memory_delta_mb, watchdog_yaml.memory_delta_mb);
        apply(&mut watchdog.consecutive_checks, watchdog_yaml.consecutive_checks);
        if watchdog_yaml.fragmentation_threshold_pct.is_some() {
            watchdog.fragmentation_threshold_pct = watchdog_yaml.fragmentation_threshold_pct;
        }
        apply(&mut watchdog.cooldown_secs, watchdog_yaml.cooldown_secs);
        apply(&mut watchdog.min_check_spacing_ms, watchdog_yaml.min_check_spacing_ms);
        apply(&mut watchdog.sample_capacity, watchdog_yaml.sample_capacity);
    }

    if let Some(cache_yaml) = yaml.cache {
        let cache = &mut config.cache;
        apply(&mut cache.enabled, cache_yaml.enabled);
        apply(&mut cache.capacity, cache_yaml.capacity);
        apply(&mut cache.ttl_secs, cache_yaml.ttl_secs);
    }

    if let Some(engine_yaml) = yaml.engine {
        let engine = &mut config.engine;
        apply(&mut engine.kind, engine_yaml.kind);
        apply(&mut engine.tone, engine_yaml.tone);
        if let Some(remote) = engine_yaml.remote {
            engine.remote.endpoints.extend(remote.endpoints);
            if remote.api_key.is_some() {
                engine.remote.api_key = remote.api_key;
            }
            apply(&mut engine.remote.timeout_ms, remote.timeout_ms);
            apply(&mut engine.remote.connect_timeout_ms, remote.connect_timeout_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{BackendKind, EngineKind};

    #[test]
    fn test_merge_defaults() {
        let config = merge_config(None, &EnvConfig::default());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3001);
        assert_eq!(config.rate_limit_requests_per_second, 60);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_yaml_overrides_env() {
        let env = EnvConfig {
            host: Some("10.0.0.1".to_string()),
            port: Some(9000),
            max_concurrent_segments: Some(8),
            watchdog_memory_delta_mb: Some(1024),
            ..Default::default()
        };
        let yaml = YamlConfig::parse(
            "server:\n  port: 4000\npool:\n  max_concurrent_segments: 3\n",
        )
        .unwrap();

        let config = merge_config(Some(yaml), &env);
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 4000);
        assert_eq!(config.pool.max_concurrent_segments, 3);
        assert_eq!(config.watchdog.memory_delta_mb, 1024);
    }

    #[test]
    fn test_remote_endpoints_merge_per_kind() {
        let mut env = EnvConfig {
            engine_kind: Some(EngineKind::Remote),
            remote_api_key: Some("env-key".to_string()),
            ..Default::default()
        };
        env.remote_endpoints
            .insert("baseline".to_string(), "http://env-cpu/synthesize".to_string());
        env.remote_endpoints
            .insert("accelerated_a".to_string(), "http://env-gpu/synthesize".to_string());

        let yaml = YamlConfig::parse(
            "engine:\n  remote:\n    endpoints:\n      accelerated_a: \"http://yaml-gpu/synthesize\"\n",
        )
        .unwrap();

        let config = merge_config(Some(yaml), &env);
        let remote = &config.engine.remote;
        assert_eq!(config.engine.kind, EngineKind::Remote);
        assert_eq!(
            remote.endpoint_for(BackendKind::Baseline),
            Some("http://env-cpu/synthesize")
        );
        assert_eq!(
            remote.endpoint_for(BackendKind::AcceleratedA),
            Some("http://yaml-gpu/synthesize")
        );
        assert_eq!(remote.api_key.as_deref(), Some("env-key"));
    }

    #[test]
    fn test_yaml_can_disable_env_tls() {
        let env = EnvConfig {
            tls: Some(TlsConfig {
                cert_path: PathBuf::from("/a"),
                key_path: PathBuf::from("/b"),
            }),
            ..Default::default()
        };
        let yaml = YamlConfig::parse("server:\n  tls:\n    enabled: false\n").unwrap();
        assert!(merge_config(Some(yaml), &env).tls.is_none());
    }
}
