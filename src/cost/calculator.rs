//! Model-aware token pricing with an optional registry file.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Conservative per-token rate applied to unknown models.
pub const DEFAULT_RATE: f64 = 1e-5;

/// Fallback rates for common models when no registry is present.
const FALLBACK_RATES: &[(&str, f64)] = &[
    ("gpt-4", 0.000_06),
    ("gpt-3.5-turbo", 0.000_002),
    ("claude-3", 0.000_08),
    ("claude-instant", 0.000_24),
];

#[derive(Debug, Deserialize)]
struct PricingRegistry {
    #[serde(default)]
    vendors: HashMap<String, Vendor>,
}

#[derive(Debug, Deserialize)]
struct Vendor {
    #[serde(default)]
    models: HashMap<String, ModelPricing>,
}

#[derive(Debug, Deserialize)]
struct ModelPricing {
    input_per_1k: Option<f64>,
    output_per_1k: Option<f64>,
    per_1k: Option<f64>,
}

impl ModelPricing {
    /// Per-1k rate: input/output averaged when both present, either alone
    /// otherwise, falling back to the flat rate.
    fn per_1k(&self) -> Option<f64> {
        match (self.input_per_1k, self.output_per_1k) {
            (Some(input), Some(output)) => Some((input + output) / 2.0),
            (Some(input), None) => Some(input),
            (None, Some(output)) => Some(output),
            (None, None) => self.per_1k,
        }
    }
}

/// Token-to-cost calculator consulting an optional YAML pricing registry.
///
/// The registry is read once and cached; a missing or invalid registry never
/// prevents operation.
pub struct CostCalculator {
    registry_path: Option<PathBuf>,
    cache: Mutex<Option<Option<HashMap<String, f64>>>>,
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl CostCalculator {
    /// Calculator using only the built-in fallback table.
    pub fn new() -> Self {
        Self {
            registry_path: None,
            cache: Mutex::new(None),
        }
    }

    /// Calculator backed by a pricing registry file. `~` is expanded.
    pub fn with_registry(path: impl AsRef<str>) -> Self {
        let expanded = shellexpand::tilde(path.as_ref()).into_owned();
        Self {
            registry_path: Some(PathBuf::from(expanded)),
            cache: Mutex::new(None),
        }
    }

    /// USD per token for a model.
    pub fn per_token(&self, model: &str) -> f64 {
        let key = model.trim().to_lowercase();
        let key = if key.is_empty() { "unknown" } else { key.as_str() };

        if let Some(rate) = self.registry_rate(key) {
            return rate;
        }
        FALLBACK_RATES
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, rate)| *rate)
            .unwrap_or(DEFAULT_RATE)
    }

    /// USD estimate for a token count.
    pub fn estimate(&self, model: &str, tokens: u64) -> f64 {
        tokens as f64 * self.per_token(model)
    }

    /// Drop the cached registry so the next lookup re-reads the file.
    pub fn reload(&self) {
        let mut cache = self.cache.lock().expect("pricing cache lock poisoned");
        *cache = None;
    }

    fn registry_rate(&self, model: &str) -> Option<f64> {
        let mut cache = self.cache.lock().expect("pricing cache lock poisoned");
        let rates = cache.get_or_insert_with(|| self.read_registry());
        rates.as_ref()?.get(model).copied()
    }

    fn read_registry(&self) -> Option<HashMap<String, f64>> {
        let path = self.registry_path.as_ref()?;
        let text = std::fs::read_to_string(path).ok()?;
        let registry: PricingRegistry = match serde_yaml::from_str(&text) {
            Ok(registry) => registry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed pricing registry");
                return None;
            }
        };

        let mut rates = HashMap::new();
        for vendor in registry.vendors.into_values() {
            for (model, pricing) in vendor.models {
                if let Some(per_1k) = pricing.per_1k() {
                    rates.insert(model.to_lowercase(), per_1k / 1000.0);
                }
            }
        }
        debug!(models = rates.len(), "loaded pricing registry");
        (!rates.is_empty()).then_some(rates)
    }
}
