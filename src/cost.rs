use crate::models::{CostBreakdown, TokenUsage};
use crate::pricing::PricingCatalog;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;

pub const USD_SCALE: u32 = 6;

const MICROS_PER_USD: i64 = 1_000_000;

/// Rounds to 6 decimal places (half-to-even) and pins the scale so that
/// equal amounts also render identically.
pub fn round_usd(amount: Decimal) -> Decimal {
    let mut rounded =
        amount.round_dp_with_strategy(USD_SCALE, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(USD_SCALE);
    rounded
}

/// Whole micro-dollars, the unit money is stored in.
pub fn usd_to_micros(amount: Decimal) -> i64 {
    (round_usd(amount) * Decimal::from(MICROS_PER_USD))
        .to_i64()
        .unwrap_or(i64::MAX)
}

pub fn usd_from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, USD_SCALE)
}

/// Turns token counts into a priced breakdown. Pure and total: unknown
/// models price at the catalog fallback and token subtractions floor at 0.
#[derive(Debug, Clone)]
pub struct CostCalculator {
    catalog: Arc<PricingCatalog>,
}

impl CostCalculator {
    pub fn new(catalog: Arc<PricingCatalog>) -> Self {
        Self { catalog }
    }

    pub fn compute_usage(&self, model: &str, usage: &TokenUsage) -> CostBreakdown {
        self.compute(
            model,
            usage.input_tokens,
            usage.output_tokens,
            usage.estimated_thinking_tokens,
            usage.cache_read_tokens,
            usage.cache_write_tokens,
        )
    }

    pub fn compute(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        thinking_tokens: u64,
        cache_read_tokens: u64,
        cache_write_tokens: u64,
    ) -> CostBreakdown {
        let rates = self.catalog.resolve(model);

        let uncached_input = input_tokens
            .saturating_sub(cache_read_tokens)
            .saturating_sub(cache_write_tokens);
        let input_cost = round_usd(
            Decimal::from(uncached_input) * rates.input_rate
                + Decimal::from(cache_read_tokens) * rates.cache_read_rate
                + Decimal::from(cache_write_tokens) * rates.cache_write_rate,
        );

        let regular_output = output_tokens.saturating_sub(thinking_tokens);
        let output_cost = round_usd(Decimal::from(regular_output) * rates.output_rate);

        // Thinking is billed at the output rate.
        let thinking_cost = round_usd(Decimal::from(thinking_tokens) * rates.output_rate);

        CostBreakdown {
            input_cost,
            output_cost,
            thinking_cost,
            total_cost: round_usd(input_cost + output_cost + thinking_cost),
        }
    }
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new(Arc::new(PricingCatalog::built_in()))
    }
}
