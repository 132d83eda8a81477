//! TOML configuration for the Cardea edge and brain daemons.
//!
//! A layered configuration model with compiled-in defaults, an environment
//! variable override for the config file path, and a standard filesystem
//! location. Every tunable of the pipeline lives here; nothing downstream
//! hard-codes a window, rate or bound.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CARDEA_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/cardea/cardea.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration shared by both the edge and brain processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardeaConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub threshold: ThresholdConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CardeaConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded cardea configuration");
        Ok(config)
    }

    /// Reject values that deserialize fine but would break a bound
    /// downstream (TOML accepts `nan` and `inf` for floats).
    pub fn validate(&self) -> Result<()> {
        self.threshold.validate()?;
        self.edge.validate()?;
        Ok(())
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (from `--config`), which must load.
    /// 2. The path in the `CARDEA_CONFIG` environment variable.
    /// 3. `/etc/cardea/cardea.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Fallback chain without an explicit path. Never fails.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CARDEA_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// On-disk locations for the SQLite databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Brain database: dedup cache, token buckets, incident archive.
    pub brain_db_path: PathBuf,
    /// Edge database: the durable per-source queue.
    pub edge_db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            brain_db_path: PathBuf::from("data/cardea-brain.db"),
            edge_db_path: PathBuf::from("data/cardea-edge.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// Which backend holds the dedup cache and token buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local maps. Suitable for a single brain instance and tests.
    Memory,
    /// Shared SQLite tables, so several brain processes share one view.
    Sqlite,
}

/// Ingress gate: deduplication and the expensive-path token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// An identical fingerprint seen within this window is suppressed.
    pub dedup_window_sec: u64,
    /// `observed_at` is rounded down to this bucket before fingerprinting.
    pub fingerprint_bucket_sec: u64,
    /// Token bucket burst capacity.
    pub bucket_capacity: u32,
    /// Tokens added per minute.
    pub refill_per_minute: u32,
    pub store: StoreBackend,
    /// How often expired dedup entries are purged.
    pub purge_interval_sec: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            dedup_window_sec: 60,
            fingerprint_bucket_sec: 10,
            bucket_capacity: 10,
            refill_per_minute: 50,
            store: StoreBackend::Memory,
            purge_interval_sec: 60,
        }
    }
}

impl IngressConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_sec)
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Correlator windows and sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Default grace after `window_end` before an incident closes.
    pub grace_sec: u64,
    /// Shortened grace once an incident holds a critical event.
    pub critical_grace_sec: u64,
    /// Sweep tick promoting expired OPEN incidents to SCORING.
    pub sweep_interval_sec: u64,
    /// Number of lock partitions for spatial keys.
    pub shards: usize,
    /// How long a SCORED incident stays in memory before it is closed and archived.
    pub retention_sec: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            grace_sec: 120,
            critical_grace_sec: 15,
            sweep_interval_sec: 10,
            shards: 16,
            retention_sec: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Weights of the deterministic formula. They are normalized at use, so they
/// need not sum to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterministicWeights {
    pub severity: f64,
    pub volume: f64,
    pub diversity: f64,
    pub model: f64,
    /// Event count at which the volume component saturates.
    pub volume_saturation: u32,
}

impl Default for DeterministicWeights {
    fn default() -> Self {
        Self {
            severity: 0.45,
            volume: 0.20,
            diversity: 0.15,
            model: 0.20,
            volume_saturation: 20,
        }
    }
}

/// Scoring strategies and the reasoning-service client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Global switch for the AI strategy.
    pub ai_enabled: bool,
    /// Reasoning service endpoint (POST, JSON).
    pub ai_endpoint: String,
    /// Name of the environment variable carrying the reasoning-service API key.
    pub ai_api_key_env: String,
    pub ai_timeout_sec: u64,
    /// Budget for the context document sent to the reasoning service.
    pub ai_max_context_tokens: usize,
    /// Budget for the reasoning service's answer.
    pub ai_max_response_tokens: u32,
    /// Simultaneous outstanding reasoning calls.
    pub ai_max_concurrent: usize,
    /// More than this many AI failures within one minute opens the breaker.
    pub ai_failure_threshold: u32,
    /// How long the open breaker skips the AI strategy.
    pub ai_breaker_cooldown_sec: u64,
    /// Fixed confidence reported by the deterministic strategy.
    pub deterministic_confidence: f64,
    pub weights: DeterministicWeights,
    /// Lookback for similar closed incidents included in the AI context.
    pub similar_lookback_hours: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            ai_endpoint: "http://127.0.0.1:8700/v1/assess".to_string(),
            ai_api_key_env: "CARDEA_AI_KEY".to_string(),
            ai_timeout_sec: 10,
            ai_max_context_tokens: 4000,
            ai_max_response_tokens: 512,
            ai_max_concurrent: 4,
            ai_failure_threshold: 5,
            ai_breaker_cooldown_sec: 60,
            deterministic_confidence: 0.6,
            weights: DeterministicWeights::default(),
            similar_lookback_hours: 24,
        }
    }
}

impl ScoringConfig {
    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Threshold controller
// ---------------------------------------------------------------------------

/// Threshold controller decision bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub period_sec: u64,
    pub lookback_sec: u64,
    /// Incidents/hour below which volume counts as low.
    pub low_rate_floor: f64,
    /// Incidents/hour above which volume counts as high.
    pub high_rate_ceiling: f64,
    /// High/critical fraction below which traffic counts as noise.
    pub low_fraction_floor: f64,
    /// High/critical fraction above which traffic counts as severe.
    pub high_fraction_ceiling: f64,
    /// Nominal adjustment per cycle.
    pub step: f64,
    /// Hard cap on the adjustment per cycle.
    pub max_delta: f64,
    /// Sensitivity assumed for a target that has never been adjusted.
    pub initial_value: f64,
    /// Sensor targets evaluated each cycle.
    pub targets: Vec<String>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            period_sec: 600,
            lookback_sec: 3600,
            low_rate_floor: 2.0,
            high_rate_ceiling: 30.0,
            low_fraction_floor: 0.1,
            high_fraction_ceiling: 0.5,
            step: 0.01,
            max_delta: 0.02,
            initial_value: 0.95,
            targets: vec![
                "network-monitor".to_string(),
                "intrusion-detector".to_string(),
                "anomaly-model".to_string(),
            ],
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_delta.is_finite() && self.max_delta >= 0.0,
            "threshold.max_delta must be a finite non-negative number, got {}",
            self.max_delta
        );
        ensure!(
            self.step.is_finite() && self.step >= 0.0,
            "threshold.step must be a finite non-negative number, got {}",
            self.step
        );
        ensure!(
            (0.0..=1.0).contains(&self.initial_value),
            "threshold.initial_value must be within [0, 1], got {}",
            self.initial_value
        );
        for (name, v) in [
            ("low_rate_floor", self.low_rate_floor),
            ("high_rate_ceiling", self.high_rate_ceiling),
            ("low_fraction_floor", self.low_fraction_floor),
            ("high_fraction_ceiling", self.high_fraction_ceiling),
        ] {
            ensure!(v.is_finite(), "threshold.{} must be finite, got {}", name, v);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Edge queue, uplink and feedback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Base URL of the brain, e.g. `http://brain:8080`.
    pub brain_url: String,
    /// Identifier sent with every uplink batch.
    pub edge_id: String,
    /// Maximum queued events per sensor source.
    pub queue_capacity: usize,
    /// Maximum events per uplink call.
    pub batch_size: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Idle wait between drains when the queue is empty.
    pub flush_interval_ms: u64,
    pub uplink_timeout_sec: u64,
    pub feedback_poll_sec: u64,
    /// Absolute clamp applied to any received sensitivity.
    pub sensitivity_min: f64,
    pub sensitivity_max: f64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            brain_url: "http://127.0.0.1:8080".to_string(),
            edge_id: "edge-01".to_string(),
            queue_capacity: 10_000,
            batch_size: 100,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            flush_interval_ms: 1_000,
            uplink_timeout_sec: 10,
            feedback_poll_sec: 60,
            sensitivity_min: 0.80,
            sensitivity_max: 0.99,
        }
    }
}

impl EdgeConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.sensitivity_min)
                && (0.0..=1.0).contains(&self.sensitivity_max)
                && self.sensitivity_min <= self.sensitivity_max,
            "edge sensitivity clamp [{}, {}] must be an ordered range within [0, 1]",
            self.sensitivity_min,
            self.sensitivity_max
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Listener addresses for the two daemons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub brain_bind: String,
    pub edge_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            brain_bind: "0.0.0.0:8080".to_string(),
            edge_bind: "0.0.0.0:8001".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
