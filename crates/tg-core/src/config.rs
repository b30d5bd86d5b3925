//! Generator configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_ENDPOINT: &str = "https://api.stability.ai";

/// What the endpoint is asked to answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Raw image bytes
    #[default]
    Image,
    /// JSON envelope carrying base64 data or a download URL
    Json,
}

impl ResponseFormat {
    pub fn accept_header(&self) -> &'static str {
        match self {
            Self::Image => "image/*",
            Self::Json => "application/json",
        }
    }
}

/// What happens when a slot already has a job in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicy {
    #[default]
    Reject,
    Supersede,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Ceiling for any single delay
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1).min(30) as i32);
        let nanos = (self.initial_backoff.as_nanos() as f64 * factor).min(self.max_backoff.as_nanos() as f64);
        Duration::from_nanos(nanos.round() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Base URL of the generation service
    pub endpoint: String,
    pub api_key: Option<String>,
    pub response_format: ResponseFormat,
    /// Per-attempt transport timeout
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    /// Jobs allowed past admission at once
    pub max_concurrent_jobs: usize,
    pub slot_policy: SlotPolicy,
    /// Upper bound on Building through Committing for one job
    pub job_deadline: Duration,
    /// How long terminal jobs stay queryable
    pub retention: Duration,
    /// Largest width or height a spec may request
    pub max_request_dimension: u32,
    /// Largest width or height a payload may decode to
    pub max_decoded_dimension: u32,
    /// Destination used when the caller gives none
    pub default_asset_path: String,
    /// Prepended to every committed texture name
    pub texture_prefix: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            response_format: ResponseFormat::default(),
            request_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            max_concurrent_jobs: 4,
            slot_policy: SlotPolicy::default(),
            job_deadline: Duration::from_secs(300),
            retention: Duration::from_secs(600),
            max_request_dimension: 2048,
            max_decoded_dimension: 8192,
            default_asset_path: "Generated/".to_string(),
            texture_prefix: "T_".to_string(),
        }
    }
}

impl GeneratorConfig {
    /// Defaults overlaid with `TEXGEN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("TEXGEN_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config.api_key = lookup("TEXGEN_API_KEY")
            .or_else(|| lookup("STABILITY_API_KEY"))
            .filter(|key| !key.trim().is_empty());

        if let Some(format) = lookup("TEXGEN_RESPONSE_FORMAT") {
            config.response_format = match format.to_ascii_lowercase().as_str() {
                "image" => ResponseFormat::Image,
                "json" => ResponseFormat::Json,
                _ => return Err(invalid("TEXGEN_RESPONSE_FORMAT", format)),
            };
        }
        if let Some(policy) = lookup("TEXGEN_SLOT_POLICY") {
            config.slot_policy = match policy.to_ascii_lowercase().as_str() {
                "reject" => SlotPolicy::Reject,
                "supersede" => SlotPolicy::Supersede,
                _ => return Err(invalid("TEXGEN_SLOT_POLICY", policy)),
            };
        }

        if let Some(secs) = parse::<u64>(&lookup, "TEXGEN_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parse(&lookup, "TEXGEN_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TEXGEN_BACKOFF_MS")? {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "TEXGEN_MAX_BACKOFF_MS")? {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(jobs) = parse::<usize>(&lookup, "TEXGEN_MAX_JOBS")? {
            if jobs == 0 {
                return Err(invalid("TEXGEN_MAX_JOBS", "0"));
            }
            config.max_concurrent_jobs = jobs;
        }
        if let Some(secs) = parse::<u64>(&lookup, "TEXGEN_DEADLINE_SECS")? {
            config.job_deadline = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "TEXGEN_RETENTION_SECS")? {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(dim) = parse(&lookup, "TEXGEN_MAX_DIMENSION")? {
            config.max_request_dimension = dim;
        }
        if let Some(path) = lookup("TEXGEN_ASSET_PATH") {
            config.default_asset_path = path;
        }
        if let Some(prefix) = lookup("TEXGEN_TEXTURE_PREFIX") {
            config.texture_prefix = prefix;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, raw)),
        None => Ok(None),
    }
}

fn invalid(key: &str, value: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.into(),
    }
}
