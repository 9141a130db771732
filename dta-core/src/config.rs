//! Process-wide configuration threaded through the pipeline and judge engines.
//!
//! Kept as a single record rather than scattered globals (spec §9,
//! "Configuration plumbing").

use std::collections::HashMap;
use std::env;

use crate::provider::Provider;

/// Per-provider endpoint and retry configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

/// Stage weights used by the judge engine's weighted aggregation (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageWeights {
    pub stage1: f64,
    pub stage2: f64,
    pub stage3: f64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            stage1: 0.30,
            stage2: 0.35,
            stage3: 0.35,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub providers: HashMap<Provider, ProviderConfig>,
    pub judge_default_model: String,
    pub judge_default_temperature: f64,
    /// Raw key material for credential-at-rest encryption (32 bytes for AES-256-GCM).
    pub credential_encryption_key: [u8; 32],
    pub pipeline_stage_weights: StageWeights,
    pub evaluation_criteria_default: Vec<String>,
    pub stage_timeout_ms: u64,
    pub overall_judge_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            judge_default_model: "claude-3-5-sonnet-20241022".to_string(),
            judge_default_temperature: 0.0,
            credential_encryption_key: [0u8; 32],
            pipeline_stage_weights: StageWeights::default(),
            evaluation_criteria_default: default_evaluation_criteria(),
            stage_timeout_ms: 120_000,
            overall_judge_timeout_ms: 180_000,
        }
    }
}

/// Default evaluation criteria for the judge engine (spec §4.6).
pub fn default_evaluation_criteria() -> Vec<String> {
    vec![
        "groundedness".to_string(),
        "faithfulness".to_string(),
        "completeness".to_string(),
        "clarity".to_string(),
        "accuracy".to_string(),
    ]
}

impl Config {
    /// Build configuration from environment variables, following the naming
    /// scheme in spec §6 (`{provider}_base_url`, `{provider}_request_timeout_ms`,
    /// `{provider}_max_retries`, `judge_default_model`, `judge_default_temperature`,
    /// `credential_encryption_key`).
    pub fn from_env() -> crate::error::Result<Self> {
        let mut config = Self::default();

        for provider in [Provider::Anthropic, Provider::OpenAI, Provider::Google] {
            let prefix = provider.env_prefix();
            let base_url_var = format!("{prefix}_base_url");
            let timeout_var = format!("{prefix}_request_timeout_ms");
            let retries_var = format!("{prefix}_max_retries");

            let mut provider_config = ProviderConfig {
                base_url: provider.default_base_url().to_string(),
                request_timeout_ms: 120_000,
                max_retries: 2,
            };
            if let Ok(url) = env::var(&base_url_var) {
                provider_config.base_url = url;
            }
            if let Ok(timeout) = env::var(&timeout_var) {
                provider_config.request_timeout_ms = timeout.parse().map_err(|_| {
                    crate::error::Error::Config(format!("invalid {timeout_var}"))
                })?;
            }
            if let Ok(retries) = env::var(&retries_var) {
                provider_config.max_retries = retries
                    .parse()
                    .map_err(|_| crate::error::Error::Config(format!("invalid {retries_var}")))?;
            }
            config.providers.insert(provider, provider_config);
        }

        if let Ok(model) = env::var("judge_default_model") {
            config.judge_default_model = model;
        }
        if let Ok(temp) = env::var("judge_default_temperature") {
            config.judge_default_temperature = temp
                .parse()
                .map_err(|_| crate::error::Error::Config("invalid judge_default_temperature".into()))?;
        }
        if let Ok(key_hex) = env::var("credential_encryption_key") {
            config.credential_encryption_key = parse_key_hex(&key_hex)?;
        }

        Ok(config)
    }

    pub fn provider_config(&self, provider: Provider) -> ProviderConfig {
        self.providers.get(&provider).cloned().unwrap_or(ProviderConfig {
            base_url: provider.default_base_url().to_string(),
            request_timeout_ms: 120_000,
            max_retries: 2,
        })
    }
}

fn parse_key_hex(hex: &str) -> crate::error::Result<[u8; 32]> {
    if hex.len() != 64 {
        return Err(crate::error::Error::Config(
            "credential_encryption_key must be 64 hex characters (32 bytes)".into(),
        ));
    }
    let mut key = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk)
            .map_err(|_| crate::error::Error::Config("invalid credential_encryption_key".into()))?;
        key[i] = u8::from_str_radix(byte_str, 16)
            .map_err(|_| crate::error::Error::Config("invalid credential_encryption_key".into()))?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stage_weights_match_spec() {
        let weights = StageWeights::default();
        assert_eq!(weights.stage1, 0.30);
        assert_eq!(weights.stage2, 0.35);
        assert_eq!(weights.stage3, 0.35);
    }

    #[test]
    fn default_criteria_match_spec_order() {
        assert_eq!(
            default_evaluation_criteria(),
            vec!["groundedness", "faithfulness", "completeness", "clarity", "accuracy"]
        );
    }

    #[test]
    fn parse_key_hex_rejects_wrong_length() {
        assert!(parse_key_hex("abcd").is_err());
    }

    #[test]
    fn parse_key_hex_roundtrips() {
        let hex = "00".repeat(32);
        let key = parse_key_hex(&hex).unwrap();
        assert_eq!(key, [0u8; 32]);
    }
}
