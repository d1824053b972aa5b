use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::sync::{BackoffKind, ScheduleConfig, SyncConfig};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub keydb: KeyDbConfig,
    pub sync: SyncSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    pub action: ActionConfig,
    #[serde(default)]
    pub http: Option<HttpConfig>,
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    2
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryBackoff {
    #[default]
    None,
    ExponentialJitter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    /// Prefix for every coordination key.  Processes that should stagger
    /// against each other must share it.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Length of the shared cadence window in seconds.
    pub cadence_secs: u64,
    /// How often (ms) each instance re-checks liveness and rank.
    #[serde(default = "default_resync_frequency_ms")]
    pub resync_frequency_ms: u64,
    /// Health-marker TTL (ms).  Must exceed `resync_frequency_ms`.
    #[serde(default = "default_health_expiration_ms")]
    pub health_expiration_ms: u64,
    /// TTL (ms) refreshed on the shared instance list.
    #[serde(default = "default_list_expiration_ms")]
    pub list_expiration_ms: u64,
    /// Identity override.  Generated from the hostname when absent.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub lock_wait_timeout_ms: u64,
    /// Resync loop restarts before the process gives up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
}

fn default_namespace() -> String {
    "stagger".to_string()
}

fn default_resync_frequency_ms() -> u64 {
    2_000
}

fn default_health_expiration_ms() -> u64 {
    4_000
}

fn default_list_expiration_ms() -> u64 {
    5_000
}

fn default_lock_ttl_ms() -> u64 {
    5_000
}

fn default_lock_wait_timeout_ms() -> u64 {
    2_000
}

fn default_retry_attempts() -> u32 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    /// Upper bound (seconds) on one action invocation.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    /// Random start delay of up to `cadence / jitter`.  0 disables it.
    #[serde(default)]
    pub jitter: u32,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout_secs(),
            jitter: 0,
        }
    }
}

fn default_action_timeout_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    /// Program and arguments run on every tick.
    pub command: Vec<String>,
    /// Extra environment for the command.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address for `/healthz` and `/metrics` (e.g. `0.0.0.0:9090`).
    pub listen: String,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl Config {
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.sync.cadence_secs)
    }

    pub fn sync_config(&self) -> SyncConfig {
        let s = &self.sync;
        SyncConfig {
            identity: s.identity.clone(),
            namespace: s.namespace.clone(),
            resync_frequency: Duration::from_millis(s.resync_frequency_ms),
            health_expiration: Duration::from_millis(s.health_expiration_ms),
            list_expiration: Duration::from_millis(s.list_expiration_ms),
            lock_ttl: Duration::from_millis(s.lock_ttl_ms),
            lock_wait_timeout: Duration::from_millis(s.lock_wait_timeout_ms),
            retry_attempts: s.retry_attempts,
            retry_backoff: match s.retry_backoff {
                RetryBackoff::None => BackoffKind::None,
                RetryBackoff::ExponentialJitter => BackoffKind::ExponentialJitter(None),
            },
        }
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            action_timeout: Duration::from_secs(self.schedule.action_timeout_secs),
            jitter: self.schedule.jitter,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file at `path`, apply `STAGGER_*`
/// environment overrides and validate it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config)?;
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<Config> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Override selected settings from the environment.  Unparseable values
/// are logged and ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let positive = |key: &str| -> Option<u64> {
        let raw = lookup(key)?;
        match raw.trim().parse::<u64>() {
            Ok(value) if value > 0 => Some(value),
            _ => {
                tracing::warn!(%key, value = %raw, "ignoring invalid override");
                None
            }
        }
    };

    if let Some(ms) = positive("STAGGER_SYNC_INTERVAL_MS") {
        config.sync.resync_frequency_ms = ms;
    }
    if let Some(ms) = positive("STAGGER_SYNC_EXPIRATION_MS") {
        config.sync.health_expiration_ms = ms;
    }
    if let Some(secs) = positive("STAGGER_CADENCE_SECS") {
        config.sync.cadence_secs = secs;
    }
    if let Some(identity) = lookup("STAGGER_IDENTITY").filter(|v| !v.is_empty()) {
        config.sync.identity = Some(identity);
    }
    if let Some(namespace) = lookup("STAGGER_NAMESPACE").filter(|v| !v.is_empty()) {
        config.sync.namespace = namespace;
    }
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.sync.cadence_secs > 0, "cadence_secs must be positive");
    anyhow::ensure!(
        config.sync.health_expiration_ms > config.sync.resync_frequency_ms,
        "health_expiration_ms must exceed resync_frequency_ms"
    );
    anyhow::ensure!(
        config.schedule.action_timeout_secs > 0,
        "action_timeout_secs must be positive"
    );
    anyhow::ensure!(
        !config.action.command.is_empty(),
        "action.command must name a program"
    );
    config.sync_config().validate()
}
