//! Model Catalog (C3) — authoritative map of model name to provider, context
//! window, pricing, capability flags, and parameter-compatibility profile
//! (spec §4.3).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::{ParameterProfile, Pricing, Provider, ProviderFamily};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextWindow {
    pub input: u32,
    pub output: u32,
}

/// Process-wide reference-data record for a single model (spec §3).
#[derive(Clone)]
pub struct CatalogEntry {
    pub model_name: String,
    pub model_version: String,
    pub provider: Provider,
    pub pricing: Pricing,
    pub context_window: ContextWindow,
    pub capabilities: Vec<String>,
    pub active: bool,
    pub deprecated: bool,
    pub recommended: bool,
    pub parameter_profile: ParameterProfile,
}

/// Read-mostly, process-wide catalog. Safe for concurrent reads (spec §5);
/// writes (e.g. a background refresh) are serialized behind the `RwLock`.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    entries: Arc<RwLock<HashMap<String, CatalogEntry>>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Seeds the catalog with the small set of well-known models used in
    /// tests and documentation examples. A production deployment loads this
    /// from its own persisted catalog store instead.
    pub fn with_well_known_models() -> Self {
        let catalog = Self::new();
        catalog.upsert(CatalogEntry {
            model_name: "m-cheap".to_string(),
            model_version: "m-cheap-2024-01".to_string(),
            provider: Provider::Anthropic,
            pricing: Pricing {
                input_per_m: 1.0,
                output_per_m: 2.0,
            },
            context_window: ContextWindow {
                input: 200_000,
                output: 8_192,
            },
            capabilities: vec!["chat".to_string()],
            active: true,
            deprecated: false,
            recommended: true,
            parameter_profile: ParameterProfile::for_family(ProviderFamily::P1),
        });
        catalog.upsert(CatalogEntry {
            model_name: "claude-3-5-sonnet-20241022".to_string(),
            model_version: "claude-3-5-sonnet-20241022".to_string(),
            provider: Provider::Anthropic,
            pricing: Pricing {
                input_per_m: 3.0,
                output_per_m: 15.0,
            },
            context_window: ContextWindow {
                input: 200_000,
                output: 8_192,
            },
            capabilities: vec!["chat".to_string(), "judge".to_string()],
            active: true,
            deprecated: false,
            recommended: true,
            parameter_profile: ParameterProfile::for_family(ProviderFamily::P1),
        });
        catalog.upsert(CatalogEntry {
            model_name: "gpt-4o".to_string(),
            model_version: "gpt-4o-2024-08-06".to_string(),
            provider: Provider::OpenAI,
            pricing: Pricing {
                input_per_m: 2.5,
                output_per_m: 10.0,
            },
            context_window: ContextWindow {
                input: 128_000,
                output: 16_384,
            },
            capabilities: vec!["chat".to_string()],
            active: true,
            deprecated: false,
            recommended: false,
            parameter_profile: ParameterProfile::for_family(ProviderFamily::P2),
        });
        catalog.upsert(CatalogEntry {
            model_name: "o1-reasoning".to_string(),
            model_version: "o1-2024-12-17".to_string(),
            provider: Provider::OpenAI,
            pricing: Pricing {
                input_per_m: 15.0,
                output_per_m: 60.0,
            },
            context_window: ContextWindow {
                input: 200_000,
                output: 100_000,
            },
            capabilities: vec!["chat".to_string(), "reasoning".to_string()],
            active: true,
            deprecated: false,
            recommended: false,
            parameter_profile: ParameterProfile::for_family(ProviderFamily::P3),
        });
        catalog
    }

    pub fn upsert(&self, entry: CatalogEntry) {
        self.entries
            .write()
            .expect("catalog lock poisoned")
            .insert(entry.model_name.clone(), entry);
    }

    /// Fails with `UnknownModel` if the model is absent, inactive, or
    /// deprecated-and-blocked (spec §4.3).
    pub fn lookup(&self, model_name: &str) -> Result<CatalogEntry> {
        let entries = self.entries.read().expect("catalog lock poisoned");
        match entries.get(model_name) {
            Some(entry) if entry.active && !(entry.deprecated && !entry.recommended) => {
                Ok(entry.clone())
            }
            _ => Err(Error::unknown_model(model_name)),
        }
    }

    pub fn parameter_profile(&self, model_name: &str) -> Result<ParameterProfile> {
        Ok(self.lookup(model_name)?.parameter_profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_model_succeeds() {
        let catalog = ModelCatalog::with_well_known_models();
        let entry = catalog.lookup("m-cheap").unwrap();
        assert_eq!(entry.provider, Provider::Anthropic);
    }

    #[test]
    fn lookup_unknown_model_fails() {
        let catalog = ModelCatalog::with_well_known_models();
        let err = catalog.lookup("does-not-exist").unwrap_err();
        assert!(matches!(err, Error::UnknownModel(_)));
    }

    #[test]
    fn lookup_inactive_model_fails() {
        let catalog = ModelCatalog::new();
        catalog.upsert(CatalogEntry {
            model_name: "retired".to_string(),
            model_version: "retired-v1".to_string(),
            provider: Provider::Anthropic,
            pricing: Pricing {
                input_per_m: 1.0,
                output_per_m: 1.0,
            },
            context_window: ContextWindow { input: 1, output: 1 },
            capabilities: vec![],
            active: false,
            deprecated: false,
            recommended: false,
            parameter_profile: ParameterProfile::for_family(ProviderFamily::P1),
        });
        assert!(catalog.lookup("retired").is_err());
    }

    #[test]
    fn deprecated_and_not_recommended_is_blocked() {
        let catalog = ModelCatalog::new();
        catalog.upsert(CatalogEntry {
            model_name: "old-model".to_string(),
            model_version: "old-model-v1".to_string(),
            provider: Provider::Anthropic,
            pricing: Pricing {
                input_per_m: 1.0,
                output_per_m: 1.0,
            },
            context_window: ContextWindow { input: 1, output: 1 },
            capabilities: vec![],
            active: true,
            deprecated: true,
            recommended: false,
            parameter_profile: ParameterProfile::for_family(ProviderFamily::P1),
        });
        assert!(catalog.lookup("old-model").is_err());
    }
}
