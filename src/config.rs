use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::protocol::MAX_PATTERNS_PER_RESPONSE;
use crate::core::GraphLimits;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub validator: ValidatorConfig,
    pub ingress: IngressConfig,
    pub verification: VerificationConfig,
    pub dedup: DedupConfig,
    pub discovery: DiscoveryConfig,
    pub gaming: GamingConfig,
    pub reputation: ReputationConfig,
    pub scoring: ScoringConfig,
    pub database: DatabaseConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ValidatorConfig {
    pub hotkey: String,
    /// Seconds between dedup index / discovery registry prunes.
    pub prune_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngressConfig {
    pub max_patterns_per_response: usize,
    pub max_nodes: usize,
    pub max_edges: usize,
    pub miner_patterns_per_hour: usize,
    /// Buffered responses between the reader thread and the pipeline.
    pub queue_capacity: usize,
    /// Newline-delimited JSON responses to replay; stdin when unset.
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VerificationConfig {
    pub timeout_secs: u64,
    pub max_concurrent: usize,
    pub requests_per_minute: u32,
    pub amount_tolerance: f64,
    pub timestamp_tolerance_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
    pub candidate_threshold: f64,
    pub retention_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub grace_period_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GamingConfig {
    pub new_address_window_days: i64,
    pub new_address_ratio: f64,
    pub new_address_penalty: f64,
    pub filler_ratio: f64,
    pub coordination_threshold: f64,
    pub coordination_window_secs: i64,
    pub coordination_penalty: f64,
    pub coordination_reject_strikes: u32,
    pub farming_threshold: usize,
    pub farming_window_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReputationConfig {
    pub recent_window_days: i64,
    pub ratio_window: usize,
    pub smoothing: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    /// Per-rule weight overrides, keyed by rule name.
    pub weights: BTreeMap<String, f64>,
    /// Per-asset volume at which volume significance reaches 0.5.
    pub volume_reference: BTreeMap<String, f64>,
    pub default_volume_reference: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub writes_per_minute: u32,
    pub queue_capacity: usize,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OracleConfig {
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Bitcoin,
    Evm,
    Fixture,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// Blockchain identifier as it appears on patterns, e.g. "ethereum".
    pub blockchain: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub rpc_user: Option<String>,
    #[serde(default)]
    pub rpc_password: Option<String>,
    /// JSON file for the fixture backend.
    #[serde(default)]
    pub fixture_path: Option<String>,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_requests_per_second() -> u32 {
    10
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            hotkey: "validator".into(),
            prune_interval_secs: 60,
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_patterns_per_response: MAX_PATTERNS_PER_RESPONSE,
            max_nodes: 100,
            max_edges: 500,
            miner_patterns_per_hour: 10,
            queue_capacity: 256,
            source: None,
        }
    }
}

impl IngressConfig {
    pub fn limits(&self) -> GraphLimits {
        GraphLimits {
            max_nodes: self.max_nodes,
            max_edges: self.max_edges,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_concurrent: 8,
            requests_per_minute: 50,
            amount_tolerance: 1e-6,
            timestamp_tolerance_secs: 3600,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            candidate_threshold: 0.7,
            retention_secs: 24 * 3600,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 300,
        }
    }
}

impl Default for GamingConfig {
    fn default() -> Self {
        Self {
            new_address_window_days: 30,
            new_address_ratio: 0.7,
            new_address_penalty: 0.5,
            filler_ratio: 0.3,
            coordination_threshold: 0.6,
            coordination_window_secs: 3600,
            coordination_penalty: 0.8,
            coordination_reject_strikes: 5,
            farming_threshold: 5,
            farming_window_secs: 3600,
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            recent_window_days: 7,
            ratio_window: 100,
            smoothing: 0.25,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            volume_reference: BTreeMap::new(),
            default_volume_reference: 1000.0,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/patterns.db".into(),
            writes_per_minute: 1000,
            queue_capacity: 4096,
            batch_size: 50,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default().normalized();
        }
        let config: Self = match std::fs::read_to_string(path) {
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
        };
        config.normalized()
    }

    /// Repairs settings that would break pipeline invariants.
    pub fn normalized(mut self) -> Self {
        if self.dedup.retention_secs < self.discovery.grace_period_secs {
            tracing::warn!(
                "dedup retention {}s is shorter than the grace period, raising to {}s",
                self.dedup.retention_secs,
                self.discovery.grace_period_secs
            );
            self.dedup.retention_secs = self.discovery.grace_period_secs;
        }
        if self.verification.max_concurrent == 0 {
            self.verification.max_concurrent = 1;
        }
        if self.verification.requests_per_minute == 0 {
            self.verification.requests_per_minute = 1;
        }
        if self.database.batch_size == 0 {
            self.database.batch_size = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [discovery]
            grace_period_secs = 120

            [[oracle.chains]]
            blockchain = "ethereum"
            kind = "evm"
            rpc_url = "http://127.0.0.1:8545"
            "#,
        )
        .unwrap();
        assert_eq!(config.discovery.grace_period_secs, 120);
        assert_eq!(config.dedup.similarity_threshold, 0.85);
        assert_eq!(config.oracle.chains.len(), 1);
        assert_eq!(config.oracle.chains[0].kind, BackendKind::Evm);
        assert_eq!(config.oracle.chains[0].requests_per_second, 10);
    }

    #[test]
    fn retention_raised_to_grace_period() {
        let mut config = Config::default();
        config.dedup.retention_secs = 10;
        let config = config.normalized();
        assert_eq!(config.dedup.retention_secs, 300);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/pattern-validator.toml");
        assert_eq!(config.ingress.max_patterns_per_response, 10);
        assert_eq!(config.verification.timeout_secs, 30);
    }
}
