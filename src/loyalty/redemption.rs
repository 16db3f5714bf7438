// Cart redemption
// Earmarks points against a shopping session and asks the cart to discount them

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::calculator::PointsCalculator;
use super::error::{LoyaltyError, LoyaltyResult};
use super::ledger::AccountId;
use super::service::PointsService;
use super::store::{RedemptionSessionStore, SessionRedemption};

/// Code under which the points discount is applied to a cart
pub const DISCOUNT_CODE: &str = "loyalty-points-discount";

/// The cart operations redemption needs from the storefront
#[async_trait]
pub trait CartSession: Send + Sync {
    fn subtotal(&self) -> Decimal;

    /// Points currently earmarked, 0 when none
    async fn redeem_points(&self) -> LoyaltyResult<i64>;

    async fn set_redeem_points(&self, points: i64) -> LoyaltyResult<()>;

    async fn apply_discount(&self, code: &str, amount: Decimal) -> LoyaltyResult<()>;

    async fn remove_discount(&self, code: &str) -> LoyaltyResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct AppliedRedemption {
    pub points: i64,
    pub discount: Decimal,
}

/// What the account could redeem against the cart right now
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct RedemptionPreview {
    pub balance: i64,
    pub max_points: i64,
    pub max_discount: Decimal,
    pub min_points: i64,
    pub applied_points: i64,
    pub applied_discount: Decimal,
    pub redemption_enabled: bool,
}

/// Points an amount would earn and what they are worth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct PointsEstimate {
    pub amount: Decimal,
    pub points: i64,
    pub value: Decimal,
}

/// Validate a redemption request, earmark it and apply the discount
pub async fn apply_points_to_cart(
    calculator: &PointsCalculator,
    points: &PointsService,
    account_id: Option<AccountId>,
    cart: &dyn CartSession,
    requested: i64,
) -> LoyaltyResult<AppliedRedemption> {
    let account_id = account_id.ok_or(LoyaltyError::UnauthenticatedAccount)?;

    let settings = calculator.settings();
    if !settings.enabled {
        return Err(LoyaltyError::FeatureDisabled("program"));
    }
    if !settings.redeem_enabled {
        return Err(LoyaltyError::FeatureDisabled("redemption"));
    }

    if requested <= 0 {
        return Err(LoyaltyError::InvalidAmount(requested));
    }

    let balance = points.get_balance(account_id).await?;
    if requested > balance {
        warn!(account_id, requested, balance, "Redemption exceeds balance");
        return Err(LoyaltyError::InsufficientBalance {
            requested,
            available: balance,
        });
    }

    let cap = calculator.max_redeemable_points(cart.subtotal(), balance);
    let accepted = requested.min(cap);
    let minimum = settings.effective_min_points();
    if accepted < minimum {
        debug!(
            account_id,
            requested, cap, minimum, "Redemption below minimum after cap"
        );
        return Err(LoyaltyError::BelowMinimumRedemption { minimum });
    }

    let discount = calculator.discount_for_points(accepted);
    cart.set_redeem_points(accepted).await?;
    cart.apply_discount(DISCOUNT_CODE, discount).await?;

    debug!(account_id, points = accepted, %discount, "Points applied to cart");
    Ok(AppliedRedemption {
        points: accepted,
        discount,
    })
}

/// Clear the earmark and drop the discount. Returns whether anything was applied.
pub async fn remove_points_from_cart(cart: &dyn CartSession) -> LoyaltyResult<bool> {
    let applied = cart.redeem_points().await?;
    if applied <= 0 {
        return Ok(false);
    }

    cart.set_redeem_points(0).await?;
    cart.remove_discount(DISCOUNT_CODE).await?;
    Ok(true)
}

/// Cart-side discount removal; clears the earmark when it was ours
pub async fn on_discount_removed(cart: &dyn CartSession, code: &str) -> LoyaltyResult<bool> {
    if !code.eq_ignore_ascii_case(DISCOUNT_CODE) {
        return Ok(false);
    }

    cart.set_redeem_points(0).await?;
    Ok(true)
}

pub async fn preview(
    calculator: &PointsCalculator,
    points: &PointsService,
    account_id: AccountId,
    cart: &dyn CartSession,
) -> LoyaltyResult<RedemptionPreview> {
    let balance = points.get_balance(account_id).await?;
    let max_points = calculator.max_redeemable_points(cart.subtotal(), balance);
    let applied_points = cart.redeem_points().await?;

    Ok(RedemptionPreview {
        balance,
        max_points,
        max_discount: calculator.discount_for_points(max_points),
        min_points: calculator.settings().effective_min_points(),
        applied_points,
        applied_discount: calculator.discount_for_points(applied_points),
        redemption_enabled: calculator.settings().redemption_active(),
    })
}

/// Informational estimate; works without an account
pub fn estimate(calculator: &PointsCalculator, amount: Decimal) -> PointsEstimate {
    let points = if calculator.settings().enabled {
        calculator.points_for_amount(amount)
    } else {
        0
    };

    PointsEstimate {
        amount,
        points,
        value: calculator.discount_for_points(points),
    }
}

/// Cart session backed by a RedemptionSessionStore
///
/// The storefront reports the subtotal per request; only the earmark and the
/// discount it produced are stored. A session owned by another account reads
/// as empty and cannot be written.
pub struct StoredCartSession {
    store: Arc<dyn RedemptionSessionStore>,
    session_id: Uuid,
    account_id: AccountId,
    subtotal: Decimal,
}

impl StoredCartSession {
    pub fn new(
        store: Arc<dyn RedemptionSessionStore>,
        session_id: Uuid,
        account_id: AccountId,
        subtotal: Decimal,
    ) -> Self {
        Self {
            store,
            session_id,
            account_id,
            subtotal,
        }
    }

    async fn owned(&self) -> LoyaltyResult<Option<SessionRedemption>> {
        Ok(self
            .store
            .get(self.session_id)
            .await?
            .filter(|s| s.account_id == self.account_id))
    }

    async fn ensure_writable(&self) -> LoyaltyResult<()> {
        match self.store.get(self.session_id).await? {
            Some(existing) if existing.account_id != self.account_id => {
                warn!(
                    session_id = %self.session_id,
                    account_id = self.account_id,
                    "Session belongs to another account"
                );
                Err(LoyaltyError::NotFound {
                    resource: "redemption session",
                    id: self.session_id.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CartSession for StoredCartSession {
    fn subtotal(&self) -> Decimal {
        self.subtotal
    }

    async fn redeem_points(&self) -> LoyaltyResult<i64> {
        Ok(self.owned().await?.map(|s| s.points).unwrap_or(0))
    }

    async fn set_redeem_points(&self, points: i64) -> LoyaltyResult<()> {
        self.ensure_writable().await?;
        if points <= 0 {
            self.store.clear(self.session_id).await?;
            return Ok(());
        }

        let discount = self
            .owned()
            .await?
            .map(|s| s.discount)
            .unwrap_or(Decimal::ZERO);
        self.store
            .put(&SessionRedemption {
                session_id: self.session_id,
                account_id: self.account_id,
                points,
                discount,
                updated_at: Utc::now(),
            })
            .await
    }

    async fn apply_discount(&self, code: &str, amount: Decimal) -> LoyaltyResult<()> {
        if code != DISCOUNT_CODE {
            return Ok(());
        }
        if let Some(mut session) = self.owned().await? {
            session.discount = amount;
            session.updated_at = Utc::now();
            self.store.put(&session).await?;
        }
        Ok(())
    }

    async fn remove_discount(&self, code: &str) -> LoyaltyResult<()> {
        if code != DISCOUNT_CODE {
            return Ok(());
        }
        if let Some(mut session) = self.owned().await? {
            session.discount = Decimal::ZERO;
            session.updated_at = Utc::now();
            self.store.put(&session).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loyalty::metrics::LoyaltyMetrics;
    use crate::loyalty::notify::Notifier;
    use crate::loyalty::settings::LoyaltySettings;
    use crate::loyalty::store::{MemoryCartSession, MemoryLedgerStore, MemoryRedemptionSessionStore};
    use rust_decimal_macros::dec;

    fn calculator(settings: LoyaltySettings) -> PointsCalculator {
        PointsCalculator::new(Arc::new(settings))
    }

    async fn service_with_balance(account_id: AccountId, balance: i64) -> PointsService {
        let service = PointsService::new(
            Arc::new(MemoryLedgerStore::new()),
            Notifier::new(),
            LoyaltyMetrics::new(),
        );
        service.admin_adjust(account_id, balance, None).await.unwrap();
        service
    }

    fn checkout_settings() -> LoyaltySettings {
        LoyaltySettings {
            redeem_rate_points: 100,
            redeem_rate_currency: dec!(1),
            redeem_min_points: 50,
            redeem_max_percent: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_redeem_within_cap_is_accepted() {
        let calculator = calculator(checkout_settings());
        let service = service_with_balance(1, 500).await;
        let cart = MemoryCartSession::new(dec!(50));

        let applied = apply_points_to_cart(&calculator, &service, Some(1), &cart, 200)
            .await
            .unwrap();

        assert_eq!(applied.points, 200);
        assert_eq!(applied.discount, dec!(2.00));
        assert_eq!(cart.redeem_points().await.unwrap(), 200);
        assert_eq!(cart.discount(DISCOUNT_CODE).await, Some(dec!(2.00)));
        // nothing is debited until the order is paid
        assert_eq!(service.get_balance(1).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_request_is_clamped_to_cart_cap() {
        let settings = LoyaltySettings {
            redeem_max_percent: 10,
            ..checkout_settings()
        };
        let calculator = calculator(settings);
        let service = service_with_balance(1, 5000).await;
        let cart = MemoryCartSession::new(dec!(20));

        // 10% of $20 = $2 = 200 points
        let applied = apply_points_to_cart(&calculator, &service, Some(1), &cart, 1000)
            .await
            .unwrap();
        assert_eq!(applied.points, 200);
        assert_eq!(applied.discount, dec!(2.00));
    }

    #[tokio::test]
    async fn test_rejections_carry_reason_codes() {
        let calculator = calculator(checkout_settings());
        let service = service_with_balance(1, 500).await;
        let cart = MemoryCartSession::new(dec!(50));

        let guest = apply_points_to_cart(&calculator, &service, None, &cart, 100).await;
        assert_eq!(guest.unwrap_err().reason_code(), "not_logged_in");

        let zero = apply_points_to_cart(&calculator, &service, Some(1), &cart, 0).await;
        assert_eq!(zero.unwrap_err().reason_code(), "invalid_points");

        let too_many = apply_points_to_cart(&calculator, &service, Some(1), &cart, 501).await;
        assert!(matches!(
            too_many.unwrap_err(),
            LoyaltyError::InsufficientBalance {
                requested: 501,
                available: 500
            }
        ));

        let small = apply_points_to_cart(&calculator, &service, Some(1), &cart, 10).await;
        assert!(matches!(
            small.unwrap_err(),
            LoyaltyError::BelowMinimumRedemption { minimum: 50 }
        ));

        assert_eq!(cart.redeem_points().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cap_below_minimum_rejects_fully() {
        let settings = LoyaltySettings {
            redeem_min_points: 300,
            ..checkout_settings()
        };
        let calculator = calculator(settings);
        let service = service_with_balance(1, 500).await;
        // 20% of $10 = $2 = 200 points, under the 300 minimum
        let cart = MemoryCartSession::new(dec!(10));

        let result = apply_points_to_cart(&calculator, &service, Some(1), &cart, 400).await;
        assert!(matches!(
            result.unwrap_err(),
            LoyaltyError::BelowMinimumRedemption { minimum: 300 }
        ));
    }

    #[tokio::test]
    async fn test_disabled_redemption_is_reported() {
        let settings = LoyaltySettings {
            redeem_enabled: false,
            ..checkout_settings()
        };
        let calculator = calculator(settings);
        let service = service_with_balance(1, 500).await;
        let cart = MemoryCartSession::new(dec!(50));

        let result = apply_points_to_cart(&calculator, &service, Some(1), &cart, 100).await;
        assert_eq!(result.unwrap_err().reason_code(), "feature_disabled");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let calculator = calculator(checkout_settings());
        let service = service_with_balance(1, 500).await;
        let cart = MemoryCartSession::new(dec!(50));
        apply_points_to_cart(&calculator, &service, Some(1), &cart, 100)
            .await
            .unwrap();

        assert!(remove_points_from_cart(&cart).await.unwrap());
        assert_eq!(cart.discount(DISCOUNT_CODE).await, None);
        assert!(!remove_points_from_cart(&cart).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_discount_removal_keeps_earmark() {
        let cart = MemoryCartSession::new(dec!(50));
        cart.set_redeem_points(100).await.unwrap();

        assert!(!on_discount_removed(&cart, "SUMMER10").await.unwrap());
        assert_eq!(cart.redeem_points().await.unwrap(), 100);

        assert!(on_discount_removed(&cart, DISCOUNT_CODE).await.unwrap());
        assert_eq!(cart.redeem_points().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_preview_reports_cap_and_applied() {
        let calculator = calculator(checkout_settings());
        let service = service_with_balance(1, 500).await;
        let cart = MemoryCartSession::new(dec!(50));
        cart.set_redeem_points(200).await.unwrap();

        let preview = preview(&calculator, &service, 1, &cart).await.unwrap();
        assert_eq!(preview.balance, 500);
        assert_eq!(preview.max_points, 500);
        assert_eq!(preview.max_discount, dec!(5.00));
        assert_eq!(preview.min_points, 50);
        assert_eq!(preview.applied_points, 200);
        assert_eq!(preview.applied_discount, dec!(2.00));
    }

    #[test]
    fn test_estimate_values_points() {
        let calculator = calculator(LoyaltySettings::default());
        let estimate = estimate(&calculator, dec!(45.50));
        assert_eq!(estimate.points, 45);
        assert_eq!(estimate.value, dec!(0.45));

        let disabled = PointsCalculator::new(Arc::new(LoyaltySettings {
            enabled: false,
            ..Default::default()
        }));
        assert_eq!(super::estimate(&disabled, dec!(45.50)).points, 0);
    }

    #[tokio::test]
    async fn test_stored_session_round_trip() {
        let store: Arc<dyn RedemptionSessionStore> = Arc::new(MemoryRedemptionSessionStore::new());
        let session_id = Uuid::new_v4();
        let cart = StoredCartSession::new(store.clone(), session_id, 1, dec!(50));

        cart.set_redeem_points(150).await.unwrap();
        cart.apply_discount(DISCOUNT_CODE, dec!(1.50)).await.unwrap();

        let stored = store.get(session_id).await.unwrap().unwrap();
        assert_eq!(stored.points, 150);
        assert_eq!(stored.discount, dec!(1.50));

        cart.set_redeem_points(0).await.unwrap();
        assert!(store.get(session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stored_session_of_other_account_is_invisible() {
        let store: Arc<dyn RedemptionSessionStore> = Arc::new(MemoryRedemptionSessionStore::new());
        let session_id = Uuid::new_v4();
        StoredCartSession::new(store.clone(), session_id, 1, dec!(50))
            .set_redeem_points(150)
            .await
            .unwrap();

        let intruder = StoredCartSession::new(store.clone(), session_id, 2, dec!(50));
        assert_eq!(intruder.redeem_points().await.unwrap(), 0);
        assert_eq!(
            intruder.set_redeem_points(10).await.unwrap_err().reason_code(),
            "not_found"
        );
        assert_eq!(store.get(session_id).await.unwrap().unwrap().points, 150);
    }
}
