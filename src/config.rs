use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub monitor: MonitorConfig,
    pub database: DatabaseConfig,
    pub processors: ProcessorsConfig,
    pub store: StoreConfig,
    pub insight: InsightConfig,
    pub fanout: FanoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    /// Depth of the recent-block window used for reorg detection.
    pub reorg_window: usize,
    pub anomaly_window: usize,
    pub anomaly_min_samples: usize,
    pub anomaly_sigma: f64,
    pub max_consecutive_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub entities_csv: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProcessorsConfig {
    pub mempool: MempoolProcessorConfig,
    pub exchange_flow: ExchangeFlowConfig,
    pub miner_treasury: MinerTreasuryConfig,
    pub whale: WhaleConfig,
    pub predictive: PredictiveConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MempoolProcessorConfig {
    pub enabled: bool,
    pub window: usize,
    pub min_samples: usize,
    /// Relative change vs the trailing mean required before a signal fires.
    pub relative_threshold: f64,
    /// z-score at which confidence saturates to 1.0.
    pub z_saturation: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExchangeFlowConfig {
    pub enabled: bool,
    pub window: usize,
    pub min_absolute_flow: u64,
    /// Flow must also exceed this multiple of the entity's rolling baseline.
    pub relative_multiple: f64,
    /// Multiple of baseline at which confidence saturates to 1.0.
    pub saturation_multiple: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MinerTreasuryConfig {
    pub enabled: bool,
    pub window: usize,
    pub min_blocks: usize,
    pub min_cumulative: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WhaleConfig {
    pub enabled: bool,
    /// Smallest per-block balance move worth tracking.
    pub min_move: u64,
    pub min_streak: usize,
    pub min_total: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PredictiveConfig {
    pub enabled: bool,
    pub window: usize,
    pub min_points: usize,
    pub horizon_blocks: u64,
    /// Emit a fresh forecast every this many blocks.
    pub emit_every: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub dedup_window_secs: u64,
    pub claim_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InsightConfig {
    pub min_confidence: f64,
    pub batch_size: usize,
    pub workers: u32,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    pub retries_per_attempt: u32,
    pub retry_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub headline_max_chars: usize,
    pub providers: Vec<ProviderEndpointConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderEndpointConfig {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FanoutConfig {
    pub listen_addr: String,
    pub queue_capacity: usize,
    pub heartbeat_secs: u64,
    pub missed_heartbeat_limit: u32,
    /// How many recent insights anonymous connections get replayed on connect.
    pub recent_window: usize,
    /// Bearer tokens granting the full feed; connections without one are
    /// limited to recent insights.
    pub auth_tokens: Vec<AuthTokenEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthTokenEntry {
    pub token: String,
    pub subject: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8332".into(),
            rpc_user: None,
            rpc_password: None,
            poll_interval_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reorg_window: 12,
            anomaly_window: 120,
            anomaly_min_samples: 10,
            anomaly_sigma: 3.0,
            max_consecutive_failures: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/chainpulse.db".into(),
            entities_csv: Some("data/entities.csv".into()),
        }
    }
}

impl Default for MempoolProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 20,
            min_samples: 10,
            relative_threshold: 0.5,
            z_saturation: 5.0,
        }
    }
}

impl Default for ExchangeFlowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 30,
            min_absolute_flow: 50_0000_0000,
            relative_multiple: 3.0,
            saturation_multiple: 10.0,
        }
    }
}

impl Default for MinerTreasuryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 36,
            min_blocks: 6,
            min_cumulative: 10_0000_0000,
        }
    }
}

impl Default for WhaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_move: 100_0000_0000,
            min_streak: 3,
            min_total: 500_0000_0000,
        }
    }
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 30,
            min_points: 10,
            horizon_blocks: 6,
            emit_every: 5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 600,
            claim_ttl_secs: 120,
        }
    }
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            batch_size: 8,
            workers: 2,
            poll_interval_secs: 5,
            max_attempts: 3,
            retries_per_attempt: 2,
            retry_backoff_ms: 1000,
            request_timeout_secs: 30,
            headline_max_chars: 80,
            providers: Vec::new(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9800".into(),
            queue_capacity: 64,
            heartbeat_secs: 30,
            missed_heartbeat_limit: 3,
            recent_window: 25,
            auth_tokens: Vec::new(),
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
