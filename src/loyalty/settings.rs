// Loyalty program settings
// Persisted as one JSON document; every request works on an immutable snapshot

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::error::LoyaltyResult;
use super::types::{AwardStatus, RoundingMode};
use crate::validation::validate_settings_rates;

/// Longest expiry window, about a century; keeps the sweep cutoff representable
pub const MAX_EXPIRY_DAYS: i64 = 36_500;

/// Loyalty program configuration
///
/// Missing fields in a stored document fall back to their defaults, so older
/// documents keep loading after new fields are added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct LoyaltySettings {
    /// Master switch for earning, redeeming and expiry
    pub enabled: bool,

    /// Points per currency unit of qualifying spend
    pub earn_rate: Decimal,

    pub award_on_status: AwardStatus,
    pub exclude_tax: bool,
    pub exclude_shipping: bool,
    pub rounding: RoundingMode,

    pub redeem_enabled: bool,

    /// `redeem_rate_points` points are worth `redeem_rate_currency` currency units
    pub redeem_rate_points: i64,
    pub redeem_rate_currency: Decimal,
    pub redeem_min_points: i64,

    /// Largest share of the cart subtotal a redemption may cover, in percent
    pub redeem_max_percent: i64,

    pub expiry_enabled: bool,
    pub expiry_days: i64,
}

impl Default for LoyaltySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            earn_rate: Decimal::ONE,
            award_on_status: AwardStatus::Completed,
            exclude_tax: true,
            exclude_shipping: true,
            rounding: RoundingMode::Floor,
            redeem_enabled: true,
            redeem_rate_points: 100,
            redeem_rate_currency: Decimal::ONE,
            redeem_min_points: 100,
            redeem_max_percent: 100,
            expiry_enabled: false,
            expiry_days: 365,
        }
    }
}

impl LoyaltySettings {
    /// Points per conversion block, never below 1
    pub fn effective_rate_points(&self) -> i64 {
        self.redeem_rate_points.max(1)
    }

    /// Currency per conversion block as used by the redemption cap, never below 0.01
    pub fn effective_rate_currency_for_cap(&self) -> Decimal {
        self.redeem_rate_currency.max(Decimal::new(1, 2))
    }

    pub fn effective_min_points(&self) -> i64 {
        self.redeem_min_points.max(1)
    }

    pub fn effective_max_percent(&self) -> i64 {
        self.redeem_max_percent.clamp(1, 100)
    }

    pub fn effective_expiry_days(&self) -> i64 {
        self.expiry_days.clamp(1, MAX_EXPIRY_DAYS)
    }

    /// Whether customers may spend points right now
    pub fn redemption_active(&self) -> bool {
        self.enabled && self.redeem_enabled
    }

    /// Whether the expiry sweep should run
    pub fn expiry_active(&self) -> bool {
        self.enabled && self.expiry_enabled
    }

    /// Normalise signs the way an admin form would: negative numbers become positive
    pub fn sanitized(mut self) -> Self {
        self.earn_rate = self.earn_rate.abs();
        self.redeem_rate_currency = self.redeem_rate_currency.abs();
        self.redeem_rate_points = self.redeem_rate_points.saturating_abs();
        self.redeem_min_points = self.redeem_min_points.saturating_abs();
        self.redeem_max_percent = self.redeem_max_percent.saturating_abs();
        self.expiry_days = self.expiry_days.saturating_abs();
        self
    }

    /// Validate a partial update and merge it over the current settings
    pub fn apply(&self, update: SettingsUpdate) -> LoyaltyResult<LoyaltySettings> {
        update.validate()?;

        let mut next = self.clone();
        if let Some(v) = update.enabled {
            next.enabled = v;
        }
        if let Some(v) = update.earn_rate {
            next.earn_rate = v;
        }
        if let Some(v) = update.award_on_status {
            next.award_on_status = v;
        }
        if let Some(v) = update.exclude_tax {
            next.exclude_tax = v;
        }
        if let Some(v) = update.exclude_shipping {
            next.exclude_shipping = v;
        }
        if let Some(v) = update.rounding {
            next.rounding = v;
        }
        if let Some(v) = update.redeem_enabled {
            next.redeem_enabled = v;
        }
        if let Some(v) = update.redeem_rate_points {
            next.redeem_rate_points = v;
        }
        if let Some(v) = update.redeem_rate_currency {
            next.redeem_rate_currency = v;
        }
        if let Some(v) = update.redeem_min_points {
            next.redeem_min_points = v;
        }
        if let Some(v) = update.redeem_max_percent {
            next.redeem_max_percent = v;
        }
        if let Some(v) = update.expiry_enabled {
            next.expiry_enabled = v;
        }
        if let Some(v) = update.expiry_days {
            next.expiry_days = v;
        }

        Ok(next.sanitized())
    }
}

/// Partial settings update submitted by an administrator
///
/// Absent fields keep their previous value.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[validate(schema(function = "validate_settings_rates"))]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    pub earn_rate: Option<Decimal>,
    pub award_on_status: Option<AwardStatus>,
    pub exclude_tax: Option<bool>,
    pub exclude_shipping: Option<bool>,
    pub rounding: Option<RoundingMode>,
    pub redeem_enabled: Option<bool>,

    #[validate(range(min = 1))]
    pub redeem_rate_points: Option<i64>,

    pub redeem_rate_currency: Option<Decimal>,

    #[validate(range(min = 1))]
    pub redeem_min_points: Option<i64>,

    #[validate(range(min = 1, max = 100))]
    pub redeem_max_percent: Option<i64>,

    pub expiry_enabled: Option<bool>,

    #[validate(range(min = 1, max = 36500))]
    pub expiry_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loyalty::LoyaltyError;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let settings = LoyaltySettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.earn_rate, dec!(1));
        assert_eq!(settings.award_on_status, AwardStatus::Completed);
        assert!(settings.exclude_tax);
        assert!(settings.exclude_shipping);
        assert_eq!(settings.rounding, RoundingMode::Floor);
        assert!(settings.redeem_enabled);
        assert_eq!(settings.redeem_rate_points, 100);
        assert_eq!(settings.redeem_rate_currency, dec!(1));
        assert_eq!(settings.redeem_min_points, 100);
        assert_eq!(settings.redeem_max_percent, 100);
        assert!(!settings.expiry_enabled);
        assert_eq!(settings.expiry_days, 365);
    }

    #[test]
    fn test_effective_values_are_clamped() {
        let settings = LoyaltySettings {
            redeem_rate_points: 0,
            redeem_rate_currency: dec!(0),
            redeem_min_points: 0,
            redeem_max_percent: 250,
            expiry_days: 0,
            ..Default::default()
        };
        assert_eq!(settings.effective_rate_points(), 1);
        assert_eq!(settings.effective_rate_currency_for_cap(), dec!(0.01));
        assert_eq!(settings.effective_min_points(), 1);
        assert_eq!(settings.effective_max_percent(), 100);
        assert_eq!(settings.effective_expiry_days(), 1);

        let settings = LoyaltySettings {
            expiry_days: i64::MAX,
            ..Default::default()
        };
        assert_eq!(settings.effective_expiry_days(), MAX_EXPIRY_DAYS);

        let settings = LoyaltySettings {
            redeem_max_percent: 0,
            ..Default::default()
        };
        assert_eq!(settings.effective_max_percent(), 1);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let settings: LoyaltySettings =
            serde_json::from_str(r#"{"earn_rate": "2.5", "expiry_enabled": true}"#).unwrap();
        assert_eq!(settings.earn_rate, dec!(2.5));
        assert!(settings.expiry_enabled);
        assert_eq!(settings.redeem_rate_points, 100);
    }

    #[test]
    fn test_apply_merges_present_fields_only() {
        let current = LoyaltySettings::default();
        let update = SettingsUpdate {
            earn_rate: Some(dec!(2)),
            redeem_max_percent: Some(50),
            ..Default::default()
        };
        let next = current.apply(update).unwrap();
        assert_eq!(next.earn_rate, dec!(2));
        assert_eq!(next.redeem_max_percent, 50);
        assert_eq!(next.redeem_min_points, current.redeem_min_points);
        assert_eq!(next.rounding, current.rounding);
    }

    #[test]
    fn test_apply_rejects_out_of_range_values() {
        let current = LoyaltySettings::default();

        let err = current
            .apply(SettingsUpdate {
                redeem_max_percent: Some(101),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidSettings(_)));

        assert!(current
            .apply(SettingsUpdate {
                expiry_days: Some(0),
                ..Default::default()
            })
            .is_err());

        assert!(current
            .apply(SettingsUpdate {
                expiry_days: Some(1_000_000_000),
                ..Default::default()
            })
            .is_err());
        assert!(current
            .apply(SettingsUpdate {
                expiry_days: Some(MAX_EXPIRY_DAYS),
                ..Default::default()
            })
            .is_ok());

        assert!(current
            .apply(SettingsUpdate {
                earn_rate: Some(dec!(-1)),
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn test_sanitized_flips_negative_values() {
        let settings = LoyaltySettings {
            earn_rate: dec!(-3),
            redeem_rate_points: -50,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(settings.earn_rate, dec!(3));
        assert_eq!(settings.redeem_rate_points, 50);
    }

    #[test]
    fn test_activity_switches() {
        let mut settings = LoyaltySettings::default();
        assert!(settings.redemption_active());
        assert!(!settings.expiry_active());

        settings.expiry_enabled = true;
        assert!(settings.expiry_active());

        settings.enabled = false;
        assert!(!settings.redemption_active());
        assert!(!settings.expiry_active());
    }
}
