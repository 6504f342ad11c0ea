use crate::config::PricingOverride;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FALLBACK_MODEL: &str = "claude-sonnet-4-6";

const TOKENS_PER_MILLION: i64 = 1_000_000;

/// Per-token USD rates for one model.
///
/// Cache writes are normally 1.25x the input rate and cache reads 0.10x.
/// That ratio is not checked here since published rates may diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model_id: String,
    pub input_rate: Decimal,
    pub output_rate: Decimal,
    pub cache_write_rate: Decimal,
    pub cache_read_rate: Decimal,
}

impl PricingEntry {
    /// Builds an entry from USD-per-million-token rates.
    pub fn per_million(
        model_id: impl Into<String>,
        input: Decimal,
        output: Decimal,
        cache_write: Decimal,
        cache_read: Decimal,
    ) -> Self {
        let million = Decimal::from(TOKENS_PER_MILLION);
        Self {
            model_id: model_id.into(),
            input_rate: input / million,
            output_rate: output / million,
            cache_write_rate: cache_write / million,
            cache_read_rate: cache_read / million,
        }
    }

    pub fn input_per_million(&self) -> Decimal {
        (self.input_rate * Decimal::from(TOKENS_PER_MILLION)).normalize()
    }

    pub fn output_per_million(&self) -> Decimal {
        (self.output_rate * Decimal::from(TOKENS_PER_MILLION)).normalize()
    }

    pub fn cache_write_per_million(&self) -> Decimal {
        (self.cache_write_rate * Decimal::from(TOKENS_PER_MILLION)).normalize()
    }

    pub fn cache_read_per_million(&self) -> Decimal {
        (self.cache_read_rate * Decimal::from(TOKENS_PER_MILLION)).normalize()
    }
}

impl From<&PricingOverride> for PricingEntry {
    fn from(ov: &PricingOverride) -> Self {
        let cache_write = ov
            .cache_write_per_1m
            .unwrap_or_else(|| ov.input_per_1m * Decimal::new(125, 2));
        let cache_read = ov
            .cache_read_per_1m
            .unwrap_or_else(|| ov.input_per_1m * Decimal::new(10, 2));
        PricingEntry::per_million(
            ov.model_id.clone(),
            ov.input_per_1m,
            ov.output_per_1m,
            cache_write,
            cache_read,
        )
    }
}

pub fn built_in_pricing() -> Vec<PricingEntry> {
    vec![
        PricingEntry::per_million(
            "claude-opus-4-6",
            Decimal::new(500, 2),
            Decimal::new(2500, 2),
            Decimal::new(625, 2),
            Decimal::new(50, 2),
        ),
        PricingEntry::per_million(
            "claude-sonnet-4-6",
            Decimal::new(300, 2),
            Decimal::new(1500, 2),
            Decimal::new(375, 2),
            Decimal::new(30, 2),
        ),
        PricingEntry::per_million(
            "claude-haiku-4-5-20251001",
            Decimal::new(80, 2),
            Decimal::new(400, 2),
            Decimal::new(100, 2),
            Decimal::new(8, 2),
        ),
    ]
}

/// Read-only rate table keyed by exact model identifier.
#[derive(Debug, Clone)]
pub struct PricingCatalog {
    entries: BTreeMap<String, PricingEntry>,
    fallback: PricingEntry,
}

impl PricingCatalog {
    /// `fallback` is used for any model that has no entry of its own.
    pub fn new(entries: Vec<PricingEntry>, fallback: PricingEntry) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| (e.model_id.clone(), e))
            .collect();
        Self { entries, fallback }
    }

    pub fn built_in() -> Self {
        Self::with_overrides(&[])
    }

    /// Built-in table with config overrides applied. An override for the
    /// fallback model also replaces the fallback rates.
    pub fn with_overrides(overrides: &[PricingOverride]) -> Self {
        let mut entries: BTreeMap<String, PricingEntry> = built_in_pricing()
            .into_iter()
            .map(|e| (e.model_id.clone(), e))
            .collect();
        for ov in overrides {
            entries.insert(ov.model_id.clone(), PricingEntry::from(ov));
        }

        let fallback = entries
            .get(FALLBACK_MODEL)
            .cloned()
            .unwrap_or_else(|| {
                PricingEntry::per_million(
                    FALLBACK_MODEL,
                    Decimal::new(300, 2),
                    Decimal::new(1500, 2),
                    Decimal::new(375, 2),
                    Decimal::new(30, 2),
                )
            });

        Self { entries, fallback }
    }

    pub fn get(&self, model: &str) -> Option<&PricingEntry> {
        self.entries.get(model)
    }

    /// Exact lookup, degrading to the fallback entry on a miss.
    pub fn resolve(&self, model: &str) -> &PricingEntry {
        self.entries.get(model).unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &PricingEntry {
        &self.fallback
    }

    pub fn entries(&self) -> impl Iterator<Item = &PricingEntry> {
        self.entries.values()
    }
}

impl Default for PricingCatalog {
    fn default() -> Self {
        Self::built_in()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_million_rates_convert_to_exact_per_token_rates() {
        let sonnet = PricingCatalog::built_in()
            .get("claude-sonnet-4-6")
            .cloned()
            .expect("sonnet is built in");
        assert_eq!(sonnet.input_rate, Decimal::new(3, 6));
        assert_eq!(sonnet.output_rate, Decimal::new(15, 6));
        assert_eq!(sonnet.cache_write_rate, Decimal::new(375, 8));
        assert_eq!(sonnet.cache_read_rate, Decimal::new(3, 7));
    }

    #[test]
    fn unknown_model_resolves_to_fallback() {
        let catalog = PricingCatalog::built_in();
        let entry = catalog.resolve("unknown-model-x");
        assert_eq!(entry.model_id, FALLBACK_MODEL);
        assert_eq!(entry, catalog.fallback());
    }

    #[test]
    fn override_adds_model_and_derives_cache_rates_from_input() {
        let catalog = PricingCatalog::with_overrides(&[PricingOverride {
            model_id: "tier-b".into(),
            input_per_1m: Decimal::new(2, 0),
            output_per_1m: Decimal::new(8, 0),
            cache_write_per_1m: None,
            cache_read_per_1m: None,
        }]);
        let entry = catalog.resolve("tier-b");
        assert_eq!(entry.model_id, "tier-b");
        assert_eq!(entry.cache_write_per_million(), Decimal::new(25, 1));
        assert_eq!(entry.cache_read_per_million(), Decimal::new(2, 1));
    }

    #[test]
    fn override_of_fallback_model_replaces_fallback_rates() {
        let catalog = PricingCatalog::with_overrides(&[PricingOverride {
            model_id: FALLBACK_MODEL.into(),
            input_per_1m: Decimal::new(4, 0),
            output_per_1m: Decimal::new(20, 0),
            cache_write_per_1m: Some(Decimal::new(5, 0)),
            cache_read_per_1m: Some(Decimal::new(4, 1)),
        }]);
        assert_eq!(catalog.fallback().input_per_million(), Decimal::new(4, 0));
        assert_eq!(
            catalog.resolve("something-new").output_per_million(),
            Decimal::new(20, 0)
        );
    }
}
