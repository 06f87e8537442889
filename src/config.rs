//! Engine configuration.
//!
//! All tunables live in one [`AppConfig`] split into an `ai` section (model
//! endpoint and pacing) and a `storage` section (cache and history bounds).
//! The config is loaded once at startup from a JSON file; unknown keys are
//! ignored and missing keys take the documented defaults, so older config
//! files keep working across releases.
//!
//! Mutations go through [`ConfigHandle::update`], which swaps the whole
//! config atomically: in-flight requests keep the snapshot they started
//! with, the next request sees the new values.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Remote model endpoint and request pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Base URL of the OpenAI-compatible endpoint, without a trailing slash.
    pub base_url: String,

    /// Bearer token sent as `Authorization: Bearer <api_key>`.
    pub api_key: String,

    /// Vision model used for page recognition.
    pub ocr_model: String,

    /// Text model used for user-directed transformations.
    pub text_model: String,

    /// Per-request timeout in seconds. Each retry gets its own timeout.
    pub timeout_s: u64,

    /// Minimum interval between outbound requests in seconds (token refill
    /// period of the rate limiter). Fractional values are allowed.
    pub request_interval_s: f64,

    /// Token-bucket capacity; also bounds the worker pool of a batch job.
    pub burst_limit: usize,

    /// Retry attempts after the first try for transient failures.
    pub max_retries: u32,

    /// Base retry delay in seconds; attempt N waits `retry_delay_s × N`.
    pub retry_delay_s: f64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            ocr_model: "gpt-4.1-mini".to_string(),
            text_model: "gpt-4.1-mini".to_string(),
            timeout_s: 90,
            request_interval_s: 0.5,
            burst_limit: 4,
            max_retries: 3,
            retry_delay_s: 2.0,
        }
    }
}

/// Cache and history retention bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum age of a cache entry in seconds before it reads as a miss.
    pub cache_ttl: u64,

    /// In-memory cache budget in bytes; LRU-evicted beyond this.
    pub max_cache_size: u64,

    /// History records older than this many days are removed by the
    /// retention sweep.
    pub history_retention: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_ttl: 60 * 60 * 24 * 30,
            max_cache_size: 64 * 1024 * 1024,
            history_retention: 180,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ai: AiConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; a present but malformed file is
    /// an error — silently ignoring a typo'd config hides real mistakes.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EngineError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.ai.burst_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "ai.burst_limit must be ≥ 1".into(),
            ));
        }
        if self.ai.timeout_s == 0 {
            return Err(EngineError::InvalidConfig("ai.timeout_s must be ≥ 1".into()));
        }
        if self.ai.request_interval_s < 0.0 || !self.ai.request_interval_s.is_finite() {
            return Err(EngineError::InvalidConfig(
                "ai.request_interval_s must be a non-negative number".into(),
            ));
        }
        if self.ai.retry_delay_s < 0.0 || !self.ai.retry_delay_s.is_finite() {
            return Err(EngineError::InvalidConfig(
                "ai.retry_delay_s must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.ai.timeout_s)
    }

    /// Token refill interval as a [`Duration`]. A zero interval is clamped
    /// to one millisecond so the bucket still refills deterministically.
    pub fn request_interval(&self) -> Duration {
        let secs = self.ai.request_interval_s.max(0.001);
        Duration::from_secs_f64(secs)
    }

    /// Cache TTL as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.cache_ttl)
    }
}

/// Shared, atomically-swappable configuration handle.
///
/// Readers take a cheap `Arc` snapshot; [`update`](Self::update) replaces
/// the whole config in one step. Holding a snapshot across an await is fine
/// and intended — a request sees one consistent config for its lifetime.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<AppConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current config snapshot.
    pub fn current(&self) -> Arc<AppConfig> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Atomically replace the configuration.
    pub fn update(&self, config: AppConfig) -> Result<(), EngineError> {
        config.validate()?;
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
        Ok(())
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ai.burst_limit, 4);
        assert_eq!(config.storage.history_retention, 180);
    }

    #[test]
    fn unknown_keys_are_ignored_and_missing_keys_defaulted() {
        let raw = r#"{
            "ai": { "ocr_model": "qwen-vl-max", "future_knob": true },
            "storage": { "cache_ttl": 60 },
            "window": { "width": 1024 }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.ai.ocr_model, "qwen-vl-max");
        assert_eq!(config.ai.max_retries, AiConfig::default().max_retries);
        assert_eq!(config.storage.cache_ttl, 60);
        assert_eq!(
            config.storage.max_cache_size,
            StorageConfig::default().max_cache_size
        );
    }

    #[test]
    fn zero_burst_rejected() {
        let mut config = AppConfig::default();
        config.ai.burst_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_clamped() {
        let mut config = AppConfig::default();
        config.ai.request_interval_s = 0.0;
        assert!(config.request_interval() >= Duration::from_millis(1));
    }

    #[test]
    fn handle_swap_is_visible_to_next_reader() {
        let handle = ConfigHandle::new(AppConfig::default());
        let before = handle.current();
        let mut next = AppConfig::default();
        next.ai.ocr_model = "glm-4v".to_string();
        handle.update(next).unwrap();
        assert_eq!(before.ai.ocr_model, AiConfig::default().ocr_model);
        assert_eq!(handle.current().ai.ocr_model, "glm-4v");
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.ai.timeout_s, AiConfig::default().timeout_s);
    }
}
