use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use tg_core::{GeneratorConfig, ResponseFormat};

/// Per-invocation overrides taken from the command line.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub json: bool,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

/// `.env` (if present), then `TEXGEN_*` variables, then CLI overrides.
pub fn load(overrides: &Overrides) -> anyhow::Result<GeneratorConfig> {
    match dotenvy::dotenv() {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => debug!("No .env file found"),
        Err(e) => return Err(e).context("Failed to read .env file"),
    }

    let config = GeneratorConfig::from_env().context("Invalid TEXGEN_* configuration")?;
    Ok(apply(config, overrides))
}

fn apply(mut config: GeneratorConfig, overrides: &Overrides) -> GeneratorConfig {
    if let Some(endpoint) = &overrides.endpoint {
        config.endpoint = endpoint.clone();
    }
    if overrides.json {
        config.response_format = ResponseFormat::Json;
    }
    if let Some(secs) = overrides.timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(retries) = overrides.max_retries {
        config.retry.max_retries = retries;
    }
    config
}

/// Destination for a job: the flag if given, the configured default otherwise.
pub fn destination(config: &GeneratorConfig, dest: Option<&str>) -> String {
    match dest {
        Some(dest) => dest.to_string(),
        None => config.default_asset_path.trim_end_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_core::SlotPolicy;

    #[test]
    fn test_overrides_win() {
        let overrides = Overrides {
            endpoint: Some("http://localhost:9000".into()),
            json: true,
            max_retries: Some(0),
            ..Overrides::default()
        };
        let config = apply(GeneratorConfig::default(), &overrides);
        assert_eq!(config.endpoint, "http://localhost:9000");
        assert_eq!(config.response_format, ResponseFormat::Json);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.slot_policy, SlotPolicy::Reject);
        assert_eq!(config.request_timeout, GeneratorConfig::default().request_timeout);
    }

    #[test]
    fn test_destination_falls_back_to_default_path() {
        let config = GeneratorConfig::default();
        assert_eq!(destination(&config, None), "Generated");
        assert_eq!(destination(&config, Some("Textures/Rock")), "Textures/Rock");
    }
}
