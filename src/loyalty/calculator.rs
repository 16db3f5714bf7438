// Points calculator
// Pure conversions between money and points under one settings snapshot

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::settings::LoyaltySettings;
use super::types::RoundingMode;

/// Decimal places used for currency amounts
pub const CURRENCY_DECIMALS: u32 = 2;

/// A registered post-processing step: receives the computed value and the
/// inputs it was computed from, returns the adjusted value
pub type Transformer<T, C> = Arc<dyn Fn(T, &C) -> T + Send + Sync>;

/// Ordered list of transformers applied to one calculator result
pub struct Pipeline<T, C> {
    stages: Vec<Transformer<T, C>>,
}

impl<T, C> Default for Pipeline<T, C> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<T, C> Clone for Pipeline<T, C> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<T, C> Pipeline<T, C> {
    pub fn register<F>(&mut self, stage: F)
    where
        F: Fn(T, &C) -> T + Send + Sync + 'static,
    {
        self.stages.push(Arc::new(stage));
    }

    pub fn apply(&self, value: T, context: &C) -> T {
        self.stages.iter().fold(value, |acc, stage| stage(acc, context))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Inputs to the redemption cap, handed to `max_redeemable_points` hooks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedemptionCap {
    pub cart_total: Decimal,
    pub balance: i64,
}

/// Extension points for every calculator function
#[derive(Clone, Default)]
pub struct CalculatorHooks {
    pub earn_rate: Pipeline<Decimal, ()>,
    pub points_for_amount: Pipeline<i64, Decimal>,
    pub points_for_order: Pipeline<i64, OrderTotals>,
    pub discount_for_points: Pipeline<Decimal, i64>,
    pub max_redeemable_points: Pipeline<i64, RedemptionCap>,
}

/// Monetary totals of an external order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct OrderTotals {
    /// Grand total, including tax and shipping, after discounts
    pub total: Decimal,
    /// All tax on the order, shipping tax included
    pub tax_total: Decimal,
    pub shipping_total: Decimal,
    pub shipping_tax: Decimal,
    /// Sum of all discounts applied, the loyalty discount included
    pub discount_total: Decimal,
}

/// Converts money to points and points to money
#[derive(Clone)]
pub struct PointsCalculator {
    settings: Arc<LoyaltySettings>,
    hooks: CalculatorHooks,
}

impl PointsCalculator {
    pub fn new(settings: Arc<LoyaltySettings>) -> Self {
        Self::with_hooks(settings, CalculatorHooks::default())
    }

    pub fn with_hooks(settings: Arc<LoyaltySettings>, hooks: CalculatorHooks) -> Self {
        Self { settings, hooks }
    }

    pub fn settings(&self) -> &LoyaltySettings {
        &self.settings
    }

    /// Points per currency unit after hooks
    pub fn earn_rate(&self) -> Decimal {
        self.hooks.earn_rate.apply(self.settings.earn_rate, &())
    }

    /// Apply the configured rounding mode; never truncates implicitly
    pub fn round_points(&self, raw: Decimal) -> i64 {
        let rounded = match self.settings.rounding {
            RoundingMode::Floor => raw.floor(),
            RoundingMode::Ceil => raw.ceil(),
            RoundingMode::Round => {
                raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            }
        };
        decimal_to_points(rounded)
    }

    /// Points earned on a monetary amount, floored at 0; saturates at `i64::MAX`
    pub fn points_for_amount(&self, amount: Decimal) -> i64 {
        let points = self
            .round_points(amount.saturating_mul(self.earn_rate()))
            .max(0);
        self.hooks.points_for_amount.apply(points, &amount).max(0)
    }

    /// Part of the order total that earns points
    pub fn qualifying_amount(&self, order: &OrderTotals) -> Decimal {
        let mut amount = order.total;

        if self.settings.exclude_tax {
            amount = amount.saturating_sub(order.tax_total);
        }

        if self.settings.exclude_shipping {
            amount = amount.saturating_sub(order.shipping_total);
            if !self.settings.exclude_tax {
                amount = amount.saturating_sub(order.shipping_tax);
            }
        }

        amount
            .saturating_sub(order.discount_total)
            .max(Decimal::ZERO)
    }

    /// Points earned on an order
    pub fn points_for_order(&self, order: &OrderTotals) -> i64 {
        let points = self.points_for_amount(self.qualifying_amount(order));
        self.hooks.points_for_order.apply(points, order).max(0)
    }

    /// Currency value of a number of points, rounded to currency precision
    pub fn discount_for_points(&self, points: i64) -> Decimal {
        if points <= 0 {
            return Decimal::ZERO;
        }

        let rate_points = Decimal::from(self.settings.effective_rate_points());
        let discount = (Decimal::from(points).saturating_mul(self.settings.redeem_rate_currency)
            / rate_points)
            .round_dp_with_strategy(CURRENCY_DECIMALS, RoundingStrategy::MidpointAwayFromZero);

        self.hooks
            .discount_for_points
            .apply(discount, &points)
            .max(Decimal::ZERO)
    }

    /// Largest redemption allowed against a cart, or 0 when under the minimum
    pub fn max_redeemable_points(&self, cart_total: Decimal, balance: i64) -> i64 {
        if !self.settings.redemption_active() || balance <= 0 {
            return 0;
        }

        let max_percent = Decimal::from(self.settings.effective_max_percent());
        let max_discount =
            cart_total.max(Decimal::ZERO).saturating_mul(max_percent) / Decimal::ONE_HUNDRED;

        let rate_points = Decimal::from(self.settings.effective_rate_points());
        let rate_currency = self.settings.effective_rate_currency_for_cap();
        let max_points = max_discount
            .saturating_mul(rate_points)
            .checked_div(rate_currency)
            .map(|p| decimal_to_points(p.floor()))
            .unwrap_or(i64::MAX);

        let redeemable = balance.min(max_points);
        if redeemable < self.settings.effective_min_points() {
            return 0;
        }

        let context = RedemptionCap {
            cart_total,
            balance,
        };
        self.hooks
            .max_redeemable_points
            .apply(redeemable, &context)
            .clamp(0, balance)
    }
}

fn decimal_to_points(value: Decimal) -> i64 {
    value.to_i64().unwrap_or(if value.is_sign_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}
