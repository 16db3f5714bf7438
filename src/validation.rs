// Validation utilities module
// Custom checks for decimal settings fields the derive macros cannot express

use rust_decimal::Decimal;
use validator::{ValidationError, ValidationErrors};

use crate::loyalty::settings::SettingsUpdate;

/// Largest cart or order amount accepted from a request
pub const MAX_REQUEST_AMOUNT: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Validates that a rate is zero or positive
pub fn validate_non_negative_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() && !rate.is_zero() {
        Err(ValidationError::new("rate_must_not_be_negative"))
    } else {
        Ok(())
    }
}

/// Validates that a currency amount is strictly positive
pub fn validate_positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        Err(ValidationError::new("amount_must_be_positive"))
    } else {
        Ok(())
    }
}

/// Validates that a request amount is zero or positive and within `MAX_REQUEST_AMOUNT`
pub fn validate_non_negative_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount < Decimal::ZERO {
        Err(ValidationError::new("amount_must_not_be_negative"))
    } else if *amount > MAX_REQUEST_AMOUNT {
        Err(ValidationError::new("amount_too_large"))
    } else {
        Ok(())
    }
}

/// Run one check against a request field, reporting failures under its name
pub fn check_field<T: ?Sized>(
    field: &'static str,
    value: &T,
    check: fn(&T) -> Result<(), ValidationError>,
) -> Result<(), ValidationErrors> {
    check(value).map_err(|error| {
        let mut errors = ValidationErrors::new();
        errors.add(field, error);
        errors
    })
}

/// Struct-level check for the decimal fields of a settings update
pub fn validate_settings_rates(update: &SettingsUpdate) -> Result<(), ValidationError> {
    if let Some(rate) = &update.earn_rate {
        validate_non_negative_rate(rate)?;
    }
    if let Some(currency) = &update.redeem_rate_currency {
        validate_positive_amount(currency)?;
    }
    Ok(())
}
