use crate::dataset::{Example, DEFAULT_SEED};
use crate::models::{Lm, Module};
use crate::{FewShotError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_HOST_URL: &str = "http://localhost:8000";

/// Process configuration for talking to the rollout service.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Base URL of the service (e.g. http://localhost:8000).
    pub host_url: String,
    /// Per-request timeout. `None` leaves timeouts to the transport.
    pub timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host_url: DEFAULT_HOST_URL.to_string(),
            timeout: None,
        }
    }
}

impl Settings {
    pub fn new(host_url: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into().trim_end_matches('/').to_string(),
            timeout: None,
        }
    }

    /// Reads `HOST_URL` and `FEWSHOT_HTTP_TIMEOUT_MS`.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let host_url = std::env::var("HOST_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST_URL.to_string());
        let timeout = match std::env::var("FEWSHOT_HTTP_TIMEOUT_MS") {
            Ok(raw) => {
                let ms = raw.trim().parse::<u64>().map_err(|_| {
                    FewShotError::InvalidConfig(format!(
                        "FEWSHOT_HTTP_TIMEOUT_MS must be an integer, got {raw:?}"
                    ))
                })?;
                Some(Duration::from_millis(ms))
            }
            Err(_) => None,
        };
        let settings = Self {
            timeout,
            ..Self::new(host_url.trim())
        };
        settings.validate()?;
        Ok(settings)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.host_url.trim().is_empty() {
            return Err(FewShotError::InvalidConfig(
                "host_url is required".to_string(),
            ));
        }
        if !(self.host_url.starts_with("http://") || self.host_url.starts_with("https://")) {
            return Err(FewShotError::InvalidConfig(format!(
                "host_url must be an http(s) URL, got {}",
                self.host_url
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(FewShotError::InvalidConfig(
                "timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Accept a rollout when `score >= metric_threshold`. Unset means any
    /// score above zero.
    pub metric_threshold: Option<f64>,
    /// Reserved for teacher-side settings; carried but not interpreted.
    pub teacher_settings: serde_json::Map<String, serde_json::Value>,
    pub max_bootstrapped_demos: usize,
    pub max_labeled_demos: usize,
    /// Attempts per training example.
    pub max_rounds: usize,
    /// Rollout errors tolerated before compile aborts. Unset means unlimited.
    pub max_errors: Option<usize>,
    /// LM override for teacher rollouts.
    pub teacher_lm: Option<Lm>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            metric_threshold: None,
            teacher_settings: serde_json::Map::new(),
            max_bootstrapped_demos: 4,
            max_labeled_demos: 16,
            max_rounds: 1,
            max_errors: None,
            teacher_lm: None,
        }
    }
}

impl BootstrapConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.metric_threshold {
            if !t.is_finite() {
                return Err(FewShotError::InvalidConfig(
                    "metric_threshold must be finite".to_string(),
                ));
            }
        }
        if let Some(lm) = &self.teacher_lm {
            if lm.model.trim().is_empty() {
                return Err(FewShotError::InvalidConfig(
                    "teacher_lm.model must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Whether a rollout score clears the acceptance bar.
    pub fn accepts(&self, score: f64) -> bool {
        match self.metric_threshold {
            Some(threshold) => score >= threshold,
            None => score > 0.0,
        }
    }
}

/// Options for generating several candidate demo sets per predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSetConfig {
    pub max_labeled_demos: usize,
    pub max_bootstrapped_demos: usize,
    pub metric_threshold: Option<f64>,
    pub teacher_lm: Option<Lm>,
    pub max_rounds: usize,
    /// Sample labeled demos at random instead of taking a prefix.
    pub labeled_sample: bool,
    /// Lower bound for the random bootstrap size of shuffled sets.
    pub min_num_samples: usize,
    pub teacher: Option<Module>,
    pub valset: Option<Vec<Example>>,
    /// Emit the zero-shot and labels-only sets.
    pub include_non_bootstrapped: bool,
    pub seed: u64,
}

impl Default for DemoSetConfig {
    fn default() -> Self {
        Self {
            max_labeled_demos: 16,
            max_bootstrapped_demos: 4,
            metric_threshold: None,
            teacher_lm: None,
            max_rounds: 1,
            labeled_sample: true,
            min_num_samples: 1,
            teacher: None,
            valset: None,
            include_non_bootstrapped: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl DemoSetConfig {
    /// Bootstrap configuration for one generated set.
    pub fn bootstrap_config(&self, max_bootstrapped_demos: usize) -> BootstrapConfig {
        BootstrapConfig {
            metric_threshold: self.metric_threshold,
            max_bootstrapped_demos,
            max_labeled_demos: self.max_labeled_demos,
            max_rounds: self.max_rounds,
            teacher_lm: self.teacher_lm.clone(),
            ..BootstrapConfig::default()
        }
    }
}
