//! Price-to-USD conversion rules.

use std::collections::HashMap;

use crate::Currency;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConversionRule {
    Identity,
    /// `usd = amount / units_per_usd`
    DivideBy(f64),
    /// `usd = amount * usd_per_unit`
    MultiplyBy(f64),
}

impl ConversionRule {
    pub fn apply(&self, amount: f64) -> f64 {
        match *self {
            Self::Identity => amount,
            Self::DivideBy(divisor) => amount / divisor,
            Self::MultiplyBy(factor) => amount * factor,
        }
    }
}

pub trait RateProvider: Send + Sync {
    /// Rule converting `currency` into USD, or `None` when no rate is known.
    fn rule_for(&self, currency: Currency) -> Option<ConversionRule>;
}

#[derive(Debug, Clone)]
pub struct FixedRates {
    rules: HashMap<Currency, ConversionRule>,
}

impl FixedRates {
    pub fn new(ars_per_usd: f64, usd_per_eur: f64) -> Self {
        let mut rules = HashMap::new();
        rules.insert(Currency::Usd, ConversionRule::Identity);
        if ars_per_usd > 0.0 {
            rules.insert(Currency::Ars, ConversionRule::DivideBy(ars_per_usd));
        }
        if usd_per_eur > 0.0 {
            rules.insert(Currency::Eur, ConversionRule::MultiplyBy(usd_per_eur));
        }
        Self { rules }
    }

    pub fn with_rule(mut self, currency: Currency, rule: ConversionRule) -> Self {
        self.rules.insert(currency, rule);
        self
    }
}

impl Default for FixedRates {
    fn default() -> Self {
        Self::new(1000.0, 1.1)
    }
}

impl RateProvider for FixedRates {
    fn rule_for(&self, currency: Currency) -> Option<ConversionRule> {
        self.rules.get(&currency).copied()
    }
}

/// Missing currency or an unknown rate passes the price through unchanged.
pub fn to_usd(rates: &dyn RateProvider, price: Option<f64>, currency: Option<Currency>) -> Option<f64> {
    let price = price?;
    let Some(currency) = currency else {
        return Some(price);
    };
    match rates.rule_for(currency) {
        Some(rule) => Some(rule.apply(price)),
        None => Some(price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usd_is_identity_and_ars_uses_configured_divisor() {
        let rates = FixedRates::default();
        assert_eq!(to_usd(&rates, Some(100_000.0), Some(Currency::Usd)), Some(100_000.0));
        assert_eq!(to_usd(&rates, Some(100_000.0), Some(Currency::Ars)), Some(100.0));

        let rates = FixedRates::new(1250.0, 1.1);
        assert_eq!(to_usd(&rates, Some(100_000.0), Some(Currency::Ars)), Some(80.0));
    }

    #[test]
    fn unknown_rate_passes_price_through() {
        let rates = FixedRates::default();
        assert_eq!(to_usd(&rates, Some(900.0), Some(Currency::Brl)), Some(900.0));
        assert_eq!(to_usd(&rates, Some(900.0), None), Some(900.0));
        assert_eq!(to_usd(&rates, None, Some(Currency::Usd)), None);
    }

    #[test]
    fn custom_rules_override_defaults() {
        let rates = FixedRates::default().with_rule(Currency::Brl, ConversionRule::DivideBy(5.0));
        assert_eq!(to_usd(&rates, Some(500.0), Some(Currency::Brl)), Some(100.0));
    }
}
