//! Change detection for ticker updates.
//!
//! Bybit pushes a ticker frame whenever anything about the instrument moves,
//! including fields nobody stores. The detector filters those out so only
//! updates that changed the compared fields reach the batch buffer.

use crate::errors::CollectorError;
use crate::models::TickerUpdate;
use std::fmt;
use std::str::FromStr;

/// Which fields decide whether a ticker update is new.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComparisonFields {
    /// Only the last traded price.
    #[default]
    LastPrice,
    /// Every market field; the ingestion timestamp is never compared.
    All,
}

impl FromStr for ComparisonFields {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "last_price" | "lastprice" => Ok(Self::LastPrice),
            "all" => Ok(Self::All),
            other => Err(CollectorError::config(format!(
                "Invalid CHANGE_DETECTION '{}', expected last_price or all",
                other
            ))),
        }
    }
}

impl fmt::Display for ComparisonFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonFields::LastPrice => write!(f, "last_price"),
            ComparisonFields::All => write!(f, "all"),
        }
    }
}

/// Stateless predicate over (last accepted update, incoming update).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    fields: ComparisonFields,
}

impl ChangeDetector {
    pub fn new(fields: ComparisonFields) -> Self {
        Self { fields }
    }

    /// Whether `update` should be buffered given the last accepted update for
    /// the same symbol. The first update for a symbol is always accepted.
    pub fn should_accept(&self, previous: Option<&TickerUpdate>, update: &TickerUpdate) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        match self.fields {
            ComparisonFields::LastPrice => previous.fields.last_price != update.fields.last_price,
            ComparisonFields::All => previous.fields != update.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickerFields;
    use chrono::{Duration, Utc};

    fn ticker(last_price: f64, volume: f64) -> TickerUpdate {
        TickerUpdate::new(
            "BTCUSDT",
            Utc::now(),
            TickerFields {
                last_price,
                volume_24h: Some(volume),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_first_update_always_accepted() {
        for fields in [ComparisonFields::LastPrice, ComparisonFields::All] {
            let detector = ChangeDetector::new(fields);
            assert!(detector.should_accept(None, &ticker(100.0, 1.0)));
        }
    }

    #[test]
    fn test_last_price_mode_ignores_other_fields() {
        let detector = ChangeDetector::new(ComparisonFields::LastPrice);
        let previous = ticker(100.0, 1.0);

        assert!(!detector.should_accept(Some(&previous), &ticker(100.0, 2.0)));
        assert!(detector.should_accept(Some(&previous), &ticker(100.5, 1.0)));
    }

    #[test]
    fn test_all_mode_compares_every_field_but_timestamp() {
        let detector = ChangeDetector::new(ComparisonFields::All);
        let previous = ticker(100.0, 1.0);

        let mut later = previous.clone();
        later.received_at = previous.received_at + Duration::seconds(5);
        assert!(!detector.should_accept(Some(&previous), &later));

        assert!(detector.should_accept(Some(&previous), &ticker(100.0, 2.0)));
    }

    #[test]
    fn test_parse_comparison_fields() {
        assert_eq!("last_price".parse::<ComparisonFields>().unwrap(), ComparisonFields::LastPrice);
        assert_eq!("ALL".parse::<ComparisonFields>().unwrap(), ComparisonFields::All);
        assert!("some".parse::<ComparisonFields>().is_err());
    }
}
