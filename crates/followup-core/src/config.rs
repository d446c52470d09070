use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::credentials::RefreshPolicy;
use crate::dispatch::{DeliverySettings, DEFAULT_FALLBACK_SUBJECT, DEFAULT_LABEL};
use crate::error::Result;
use crate::queue::{Backoff, JobOptions};
use crate::worker::WorkerSettings;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local wall-clock hour of the daily run.
    #[serde(default = "default_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

fn default_true() -> bool {
    true
}

fn default_hour() -> u32 {
    12
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: default_hour(),
            minute: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
    #[serde(default = "default_true")]
    pub remove_on_complete: bool,
    #[serde(default)]
    pub remove_on_fail: bool,
    #[serde(default = "default_lock_secs")]
    pub lock_duration_secs: u64,
    #[serde(default = "default_lock_secs")]
    pub stalled_interval_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_queue_name() -> String {
    "follow-ups".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_delay_ms() -> u64 {
    5000
}

fn default_lock_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            attempts: default_attempts(),
            backoff_delay_ms: default_backoff_delay_ms(),
            remove_on_complete: true,
            remove_on_fail: false,
            lock_duration_secs: default_lock_secs(),
            stalled_interval_secs: default_lock_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    /// Options for the daily follow-up job.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts,
            backoff: Some(Backoff::exponential(self.backoff_delay_ms)),
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: std::time::Duration::from_millis(self.poll_interval_ms),
            lock_duration: secs(self.lock_duration_secs),
            stalled_interval: secs(self.stalled_interval_secs),
        }
    }
}

/// Longest configurable duration. Larger values are clamped so adding them
/// to a timestamp cannot overflow.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn secs(n: u64) -> Duration {
    let clamped = n.min(MAX_DURATION_SECS);
    Duration::seconds(i64::try_from(clamped).unwrap_or(0))
}

// ---------------------------------------------------------------------------
// CredentialsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_expiry_buffer_secs")]
    pub expiry_buffer_secs: u64,
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_expiry_buffer_secs() -> u64 {
    600
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            expiry_buffer_secs: default_expiry_buffer_secs(),
        }
    }
}

impl CredentialsConfig {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            lock_ttl: secs(self.lock_ttl_secs),
            expiry_buffer: secs(self.expiry_buffer_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_fallback_subject")]
    pub fallback_subject: String,
    #[serde(default = "default_label")]
    pub label: String,
    /// Booking page linked from the email postscript; `{tenant_id}` is
    /// substituted. No postscript when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_url: Option<String>,
}

fn default_fallback_subject() -> String {
    DEFAULT_FALLBACK_SUBJECT.to_string()
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            fallback_subject: default_fallback_subject(),
            label: default_label(),
            booking_url: None,
        }
    }
}

impl DeliveryConfig {
    pub fn settings(&self) -> DeliverySettings {
        DeliverySettings {
            fallback_subject: self.fallback_subject.clone(),
            label: self.label.clone(),
            booking_url: self.booking_url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// StorageConfig / ServerConfig / GenerationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/state.redb")
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue.redb")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            queue_path: default_queue_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reported by the health endpoint.
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_port() -> u16 {
    3000
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            environment: default_environment(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    380
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message });
        };

        if self.schedule.hour > 23 || self.schedule.minute > 59 {
            push(
                WarnLevel::Error,
                format!(
                    "schedule time {:02}:{:02} is not a valid time of day",
                    self.schedule.hour, self.schedule.minute
                ),
            );
        }

        if self.queue.attempts == 0 {
            push(
                WarnLevel::Error,
                "queue.attempts must be at least 1".to_string(),
            );
        }
        if self.queue.poll_interval_ms == 0 {
            push(
                WarnLevel::Warning,
                "queue.poll_interval_ms is 0; the worker will spin".to_string(),
            );
        }

        if self.credentials.lock_ttl_secs == 0 {
            push(
                WarnLevel::Error,
                "credentials.lock_ttl_secs is 0; refreshes are not mutually exclusive".to_string(),
            );
        }
        if self.credentials.expiry_buffer_secs < self.credentials.lock_ttl_secs {
            push(
                WarnLevel::Warning,
                format!(
                    "credentials.expiry_buffer_secs ({}) is shorter than lock_ttl_secs ({}); \
                     a stale token may expire while another worker holds the refresh lock",
                    self.credentials.expiry_buffer_secs, self.credentials.lock_ttl_secs
                ),
            );
        }

        if let Some(url) = &self.delivery.booking_url {
            if !url.contains("{tenant_id}") {
                push(
                    WarnLevel::Warning,
                    "delivery.booking_url has no {tenant_id} placeholder; every tenant gets the same link"
                        .to_string(),
                );
            }
        }

        if self.storage.state_path == self.storage.queue_path {
            push(
                WarnLevel::Error,
                format!(
                    "storage.state_path and storage.queue_path are both '{}'",
                    self.storage.state_path.display()
                ),
            );
        }

        if self.generation.max_tokens == 0 {
            push(
                WarnLevel::Error,
                "generation.max_tokens must be positive".to_string(),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
