use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::core::Severity;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub engine: EngineConfig,
    pub heuristics: HeuristicConfig,
    pub stats: StatsConfig,
    pub dispatcher: DispatcherConfig,
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    pub zmq_endpoint: String,
    pub topic: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub shards: usize,
    pub shard_queue_capacity: usize,
    pub recent_tx_capacity: usize,
    pub detection_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeuristicConfig {
    /// Confidence multipliers keyed by heuristic name. 0 disables a heuristic.
    pub weights: HashMap<String, f64>,
    pub alert_thresholds: AlertThresholds,
    /// Per-address activity entries kept for heuristic context.
    pub activity_window: usize,
    pub front_run_window_ms: i64,
    pub front_run_percentile: f64,
    pub front_run_min_samples: usize,
    pub sandwich_window_ms: i64,
    pub volume_stddev_threshold: f64,
    pub volume_min_samples: usize,
    pub gas_multiple: f64,
    pub gas_min_samples: usize,
    pub reentrancy_window_ms: i64,
    pub reentrancy_min_repeats: usize,
    pub honeypot_min_failed: usize,
    /// Detections older than this stop contributing to a contract's threat level.
    pub threat_decay_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertThresholds {
    pub critical: u8,
    pub high: u8,
    pub medium: u8,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatsConfig {
    pub window_secs: i64,
    pub max_samples: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatcherConfig {
    pub subscriber_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub desktop: bool,
    pub min_severity: Severity,
    pub cooldown_seconds: u64,
    pub webhook_url: Option<String>,
    pub webhook_user: Option<String>,
    pub webhook_password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            engine: EngineConfig::default(),
            heuristics: HeuristicConfig::default(),
            stats: StatsConfig::default(),
            dispatcher: DispatcherConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            zmq_endpoint: "tcp://127.0.0.1:28400".into(),
            topic: "pendingtx".into(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            shard_queue_capacity: 4096,
            recent_tx_capacity: 10_000,
            detection_capacity: 1_000,
        }
    }
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            weights: HashMap::new(),
            alert_thresholds: AlertThresholds::default(),
            activity_window: 256,
            front_run_window_ms: 12_000,
            front_run_percentile: 0.9,
            front_run_min_samples: 2,
            sandwich_window_ms: 12_000,
            volume_stddev_threshold: 3.0,
            volume_min_samples: 5,
            gas_multiple: 3.0,
            gas_min_samples: 3,
            reentrancy_window_ms: 30_000,
            reentrancy_min_repeats: 3,
            honeypot_min_failed: 2,
            threat_decay_secs: 900,
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            critical: 80,
            high: 60,
            medium: 40,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_samples: 10_000,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1_000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8645".into(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "data/txsentry.db".into(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            desktop: true,
            min_severity: Severity::High,
            cooldown_seconds: 30,
            webhook_url: None,
            webhook_user: None,
            webhook_password: None,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/txsentry.toml");
        assert_eq!(config.engine.recent_tx_capacity, 10_000);
        assert_eq!(config.dispatcher.subscriber_capacity, 1_000);
        assert_eq!(config.notifications.min_severity, Severity::High);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            shards = 2

            [heuristics]
            gas_multiple = 5.0
            weights = { sandwich = 0.0 }

            [notifications]
            min_severity = "critical"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.shards, 2);
        assert_eq!(config.engine.shard_queue_capacity, 4096);
        assert_eq!(config.heuristics.gas_multiple, 5.0);
        assert_eq!(config.heuristics.weights.get("sandwich"), Some(&0.0));
        assert_eq!(config.heuristics.alert_thresholds.critical, 80);
        assert_eq!(config.notifications.min_severity, Severity::Critical);
    }

    #[test]
    fn invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "engine = [[[").unwrap();
        let config = Config::load(&path);
        assert_eq!(config.engine.shards, 4);
    }
}
