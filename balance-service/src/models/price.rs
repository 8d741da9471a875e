//! Price configuration: a closed sum type validated at construction.

use crate::error::LedgerError;
use crate::pricing::tiers::{self, normalize_tiers};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Upper bound of a usage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierBound {
    UpTo(Decimal),
    Infinite,
}

impl TierBound {
    pub fn is_infinite(&self) -> bool {
        matches!(self, TierBound::Infinite)
    }
}

impl Serialize for TierBound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TierBound::UpTo(to) => Serialize::serialize(to, serializer),
            TierBound::Infinite => serializer.serialize_str("inf"),
        }
    }
}

impl<'de> Deserialize<'de> for TierBound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawBound {
            Number(Decimal),
            Text(String),
        }

        match RawBound::deserialize(deserializer)? {
            RawBound::Number(n) if n == Decimal::NEGATIVE_ONE => Ok(TierBound::Infinite),
            RawBound::Number(n) => Ok(TierBound::UpTo(n)),
            RawBound::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "inf" | "infinite" | "-1" => Ok(TierBound::Infinite),
                other => Err(serde::de::Error::custom(format!(
                    "invalid tier bound '{}'",
                    other
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageTier {
    pub to: TierBound,
    /// Price per `billing_units` units within this tier.
    pub amount: Decimal,
}

impl UsageTier {
    pub fn up_to(to: Decimal, amount: Decimal) -> Self {
        Self {
            to: TierBound::UpTo(to),
            amount,
        }
    }

    pub fn infinite(amount: Decimal) -> Self {
        Self {
            to: TierBound::Infinite,
            amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierBehavior {
    Graduated,
    Volume,
}

/// Tiered usage price. Only constructible through [`UsagePrice::new`], so
/// every instance has already passed tier validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsagePrice {
    #[serde(rename = "usage_tiers")]
    tiers: Vec<UsageTier>,
    #[serde(rename = "tier_behavior")]
    behavior: TierBehavior,
    billing_units: Decimal,
    allowance: Decimal,
}

impl UsagePrice {
    pub fn new(
        tiers: Vec<UsageTier>,
        behavior: TierBehavior,
        billing_units: Decimal,
        allowance: Decimal,
    ) -> Result<Self, LedgerError> {
        if billing_units <= Decimal::ZERO {
            return Err(LedgerError::validation("billing_units must be positive"));
        }
        if allowance < Decimal::ZERO {
            return Err(LedgerError::validation("allowance must not be negative"));
        }
        let tiers = normalize_tiers(&tiers)?;
        Ok(Self {
            tiers,
            behavior,
            billing_units,
            allowance,
        })
    }

    pub fn tiers(&self) -> &[UsageTier] {
        &self.tiers
    }

    pub fn behavior(&self) -> TierBehavior {
        self.behavior
    }

    pub fn billing_units(&self) -> Decimal {
        self.billing_units
    }

    pub fn allowance(&self) -> Decimal {
        self.allowance
    }

    /// Price `quantity` units; negative quantities price as credits.
    pub fn amount(&self, quantity: Decimal) -> Result<Decimal, LedgerError> {
        match self.behavior {
            TierBehavior::Graduated => tiers::graduated_tier_amount(
                &self.tiers,
                quantity,
                self.billing_units,
                self.allowance,
                true,
            ),
            TierBehavior::Volume => tiers::volume_tier_amount(
                &self.tiers,
                quantity,
                self.billing_units,
                self.allowance,
                true,
            ),
        }
    }
}

/// Wire form of a price before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawPriceConfig {
    Fixed {
        amount: Decimal,
    },
    Usage {
        usage_tiers: Option<Vec<UsageTier>>,
        tier_behavior: Option<TierBehavior>,
        billing_units: Option<Decimal>,
        allowance: Option<Decimal>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", try_from = "RawPriceConfig")]
pub enum PriceConfig {
    /// Flat amount per unit of quantity.
    Fixed { amount: Decimal },
    Usage(UsagePrice),
}

impl TryFrom<RawPriceConfig> for PriceConfig {
    type Error = LedgerError;

    fn try_from(raw: RawPriceConfig) -> Result<Self, Self::Error> {
        match raw {
            RawPriceConfig::Fixed { amount } => Ok(PriceConfig::Fixed { amount }),
            RawPriceConfig::Usage {
                usage_tiers,
                tier_behavior,
                billing_units,
                allowance,
            } => {
                let tiers = usage_tiers
                    .ok_or_else(|| LedgerError::config("usage price is missing usage_tiers"))?;
                Ok(PriceConfig::Usage(UsagePrice::new(
                    tiers,
                    tier_behavior.unwrap_or(TierBehavior::Graduated),
                    billing_units.unwrap_or(Decimal::ONE),
                    allowance.unwrap_or(Decimal::ZERO),
                )?))
            }
        }
    }
}

impl PriceConfig {
    /// Full-cycle amount for `quantity` units, before proration and discounts.
    pub fn amount_for(&self, quantity: Decimal) -> Result<Decimal, LedgerError> {
        match self {
            PriceConfig::Fixed { amount } => Ok(*amount * quantity),
            PriceConfig::Usage(price) => price.amount(quantity),
        }
    }
}

/// Discount active on the customer's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
    /// Fraction off, e.g. `0.25` for 25%.
    Percent(Decimal),
    Fixed(Decimal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_bound_accepts_sentinels() {
        let tiers: Vec<UsageTier> = serde_json::from_str(
            r#"[{"to": 100, "amount": "0.10"}, {"to": -1, "amount": "0.05"}, {"to": "inf", "amount": 1}]"#,
        )
        .unwrap();
        assert_eq!(tiers[0].to, TierBound::UpTo(Decimal::from(100)));
        assert!(tiers[1].to.is_infinite());
        assert!(tiers[2].to.is_infinite());
    }

    #[test]
    fn test_tier_bound_serializes_infinite_as_inf() {
        let tiers = vec![
            UsageTier {
                to: TierBound::UpTo(Decimal::from(100)),
                amount: Decimal::ONE,
            },
            UsageTier::infinite(Decimal::ONE),
        ];
        let json = serde_json::to_value(&tiers).unwrap();
        assert_eq!(json[0]["to"], serde_json::json!("100"));
        assert_eq!(json[1]["to"], serde_json::json!("inf"));

        let back: Vec<UsageTier> = serde_json::from_value(json).unwrap();
        assert_eq!(back, tiers);
    }

    #[test]
    fn test_usage_price_without_tiers_is_config_error() {
        let result: Result<PriceConfig, _> =
            serde_json::from_str(r#"{"type": "usage", "billing_units": 10}"#);
        assert!(result.is_err());

        let raw = RawPriceConfig::Usage {
            usage_tiers: None,
            tier_behavior: None,
            billing_units: None,
            allowance: None,
        };
        assert!(matches!(
            PriceConfig::try_from(raw),
            Err(LedgerError::Config(_))
        ));
    }

    #[test]
    fn test_zero_billing_units_rejected() {
        let result = UsagePrice::new(
            vec![UsageTier::infinite(Decimal::ONE)],
            TierBehavior::Volume,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_fixed_price_scales_with_quantity() {
        let price: PriceConfig = serde_json::from_str(r#"{"type": "fixed", "amount": "10"}"#).unwrap();
        assert_eq!(
            price.amount_for(Decimal::from(5)).unwrap(),
            Decimal::from(50)
        );
    }
}
