// Loyalty points module
// Ledger, balance engine, calculator and the order/cart/expiry hooks around them

pub mod cache;
pub mod calculator;
pub mod error;
pub mod expiry;
pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod redemption;
pub mod service;
pub mod settings;
pub mod store;
pub mod types;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

// Re-export commonly used types
pub use cache::CachedLedgerStore;
pub use calculator::{CalculatorHooks, OrderTotals, PointsCalculator};
pub use error::{LoyaltyError, LoyaltyResult};
pub use expiry::{spawn_expiry_scheduler, ExpiryOptions, ExpiryReport};
pub use ledger::{AccountBalance, AccountId, LedgerEntry, LedgerFilter, OrderRef, SummaryStats};
pub use lifecycle::{LifecycleOutcome, OrderEvent, OrderSnapshot};
pub use metrics::LoyaltyMetrics;
pub use notify::{Notification, Notifier};
pub use redemption::{AppliedRedemption, CartSession, PointsEstimate, RedemptionPreview};
pub use service::{BalanceVerification, Mutation, PointsChange, PointsService};
pub use settings::{LoyaltySettings, SettingsUpdate};
pub use types::{AwardStatus, EntryType, OrderStatus, RoundingMode};

use expiry::ExpirySweep;
use lifecycle::OrderLifecycle;
use redemption::StoredCartSession;
use store::{
    LedgerStore, MemoryCartSession, MemoryLedgerStore, MemoryOrderMetaStore, MemoryRedemptionSessionStore,
    MemorySettingsRepository, OrderMetaStore, PgLedgerStore, PgOrderMetaStore,
    PgRedemptionSessionStore, PgSettingsRepository, RedemptionSessionStore, SettingsRepository,
};

/// Stored balance plus its check against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct AccountOverview {
    #[serde(flatten)]
    pub balance: AccountBalance,
    pub verification: BalanceVerification,
}

/// Entry point wiring the stores, settings and hooks together
///
/// Every operation reads one settings snapshot up front and hands it to the
/// calculator it builds, so a settings save never changes values mid-request.
pub struct LoyaltyEngine {
    points: PointsService,
    orders: Arc<dyn OrderMetaStore>,
    settings: Arc<dyn SettingsRepository>,
    sessions: Arc<dyn RedemptionSessionStore>,
    hooks: CalculatorHooks,
    metrics: LoyaltyMetrics,
    expiry: ExpiryOptions,
}

impl LoyaltyEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        orders: Arc<dyn OrderMetaStore>,
        settings: Arc<dyn SettingsRepository>,
        sessions: Arc<dyn RedemptionSessionStore>,
        metrics: LoyaltyMetrics,
    ) -> Self {
        Self {
            points: PointsService::new(ledger, Notifier::new(), metrics.clone()),
            orders,
            settings,
            sessions,
            hooks: CalculatorHooks::default(),
            metrics,
            expiry: ExpiryOptions::default(),
        }
    }

    /// Engine over in-memory stores with default settings
    pub fn in_memory() -> Self {
        Self::in_memory_with(LoyaltySettings::default())
    }

    pub fn in_memory_with(settings: LoyaltySettings) -> Self {
        Self::new(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(MemoryOrderMetaStore::new()),
            Arc::new(MemorySettingsRepository::new(settings)),
            Arc::new(MemoryRedemptionSessionStore::new()),
            LoyaltyMetrics::new(),
        )
    }

    /// Engine over PostgreSQL with the aggregate cache in front of the ledger
    pub fn postgres(pool: PgPool) -> Self {
        let metrics = LoyaltyMetrics::new();
        let ledger = CachedLedgerStore::new(PgLedgerStore::new(pool.clone()), metrics.clone());
        Self::new(
            Arc::new(ledger),
            Arc::new(PgOrderMetaStore::new(pool.clone())),
            Arc::new(PgSettingsRepository::new(pool.clone())),
            Arc::new(PgRedemptionSessionStore::new(pool)),
            metrics,
        )
    }

    pub fn with_calculator_hooks(mut self, hooks: CalculatorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.points = PointsService::new(self.points.ledger().clone(), notifier, self.metrics.clone());
        self
    }

    pub fn with_expiry_options(mut self, options: ExpiryOptions) -> Self {
        self.expiry = options;
        self
    }

    pub fn points(&self) -> &PointsService {
        &self.points
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        self.points.ledger()
    }

    pub fn metrics(&self) -> &LoyaltyMetrics {
        &self.metrics
    }

    /// Current settings snapshot
    pub async fn settings(&self) -> LoyaltyResult<Arc<LoyaltySettings>> {
        self.settings.current().await
    }

    /// Calculator bound to the current settings snapshot
    pub async fn calculator(&self) -> LoyaltyResult<PointsCalculator> {
        let settings = self.settings.current().await?;
        Ok(PointsCalculator::with_hooks(settings, self.hooks.clone()))
    }

    pub async fn handle_order_event(
        &self,
        event: &OrderEvent,
    ) -> LoyaltyResult<Vec<LifecycleOutcome>> {
        let calculator = self.calculator().await?;
        OrderLifecycle::new(
            &calculator,
            &self.points,
            self.orders.as_ref(),
            self.sessions.as_ref(),
        )
        .handle(event)
        .await
    }

    fn cart(&self, account_id: AccountId, session_id: Uuid, subtotal: Decimal) -> StoredCartSession {
        StoredCartSession::new(self.sessions.clone(), session_id, account_id, subtotal)
    }

    pub async fn apply_points(
        &self,
        account_id: Option<AccountId>,
        session_id: Uuid,
        cart_subtotal: Decimal,
        requested: i64,
    ) -> LoyaltyResult<AppliedRedemption> {
        let account = account_id.ok_or(LoyaltyError::UnauthenticatedAccount)?;
        let calculator = self.calculator().await?;
        let cart = self.cart(account, session_id, cart_subtotal);
        redemption::apply_points_to_cart(&calculator, &self.points, account_id, &cart, requested)
            .await
    }

    pub async fn remove_points(&self, account_id: AccountId, session_id: Uuid) -> LoyaltyResult<bool> {
        let cart = self.cart(account_id, session_id, Decimal::ZERO);
        redemption::remove_points_from_cart(&cart).await
    }

    pub async fn redemption_preview(
        &self,
        account_id: AccountId,
        session_id: Option<Uuid>,
        cart_subtotal: Decimal,
    ) -> LoyaltyResult<RedemptionPreview> {
        let calculator = self.calculator().await?;
        match session_id {
            Some(session_id) => {
                let cart = self.cart(account_id, session_id, cart_subtotal);
                redemption::preview(&calculator, &self.points, account_id, &cart).await
            }
            // without a session there is nothing applied yet
            None => {
                let cart = MemoryCartSession::new(cart_subtotal);
                redemption::preview(&calculator, &self.points, account_id, &cart).await
            }
        }
    }

    pub async fn estimate(&self, amount: Decimal) -> LoyaltyResult<PointsEstimate> {
        let calculator = self.calculator().await?;
        Ok(redemption::estimate(&calculator, amount))
    }

    pub async fn process_expiry(&self, now: DateTime<Utc>) -> LoyaltyResult<ExpiryReport> {
        let settings = self.settings.current().await?;
        ExpirySweep::new(&settings, &self.points, &self.metrics, self.expiry)
            .run(now)
            .await
    }

    pub async fn admin_adjust(
        &self,
        account_id: AccountId,
        signed_points: i64,
        reason: Option<&str>,
    ) -> LoyaltyResult<Option<Mutation>> {
        self.points.admin_adjust(account_id, signed_points, reason).await
    }

    pub async fn account_overview(&self, account_id: AccountId) -> LoyaltyResult<AccountOverview> {
        let balance = self.points.account(account_id).await?;
        let verification = self.points.verify_account(account_id).await?;
        Ok(AccountOverview {
            balance,
            verification,
        })
    }

    /// Validate and merge a partial update, then persist the result
    pub async fn save_settings(&self, update: SettingsUpdate) -> LoyaltyResult<Arc<LoyaltySettings>> {
        let current = self.settings.current().await?;
        let next = current.apply(update)?;
        self.settings.save(&next).await?;
        info!(
            enabled = next.enabled,
            redeem_enabled = next.redeem_enabled,
            expiry_enabled = next.expiry_enabled,
            "Loyalty settings saved"
        );
        Ok(Arc::new(next))
    }

    /// Remove every ledger entry, balance, order guard and session earmark
    pub async fn purge_all(&self) -> LoyaltyResult<()> {
        self.ledger().purge().await?;
        self.orders.purge().await?;
        self.sessions.purge().await?;
        info!("Loyalty data purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    fn completed(order_ref: OrderRef, account_id: AccountId, total: Decimal) -> OrderEvent {
        OrderEvent::StatusChanged {
            order: OrderSnapshot {
                order_ref,
                order_number: None,
                account_id: Some(account_id),
                totals: OrderTotals {
                    total,
                    ..Default::default()
                },
            },
            status: OrderStatus::Completed,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_checkout_flow_end_to_end() {
        let engine = LoyaltyEngine::in_memory_with(LoyaltySettings {
            redeem_min_points: 50,
            redeem_max_percent: 20,
            ..Default::default()
        });
        engine.handle_order_event(&completed(1, 7, dec!(500))).await.unwrap();
        assert_eq!(engine.points().get_balance(7).await.unwrap(), 500);

        let session_id = Uuid::new_v4();
        let applied = engine
            .apply_points(Some(7), session_id, dec!(50), 200)
            .await
            .unwrap();
        assert_eq!(applied.discount, dec!(2.00));

        let preview = engine
            .redemption_preview(7, Some(session_id), dec!(50))
            .await
            .unwrap();
        assert_eq!(preview.applied_points, 200);

        let paid = OrderEvent::PaymentComplete {
            order: OrderSnapshot {
                order_ref: 2,
                order_number: None,
                account_id: Some(7),
                totals: OrderTotals::default(),
            },
            session_id: Some(session_id),
        };
        engine.handle_order_event(&paid).await.unwrap();
        assert_eq!(engine.points().get_balance(7).await.unwrap(), 300);

        let overview = engine.account_overview(7).await.unwrap();
        assert!(overview.verification.consistent);
        assert_eq!(overview.balance.lifetime_spent, 200);
    }

    #[tokio::test]
    async fn test_apply_requires_account() {
        let engine = LoyaltyEngine::in_memory();
        let result = engine.apply_points(None, Uuid::new_v4(), dec!(50), 100).await;
        assert!(matches!(result, Err(LoyaltyError::UnauthenticatedAccount)));
    }

    #[tokio::test]
    async fn test_remove_points_clears_session() {
        let engine = LoyaltyEngine::in_memory();
        engine.admin_adjust(3, 1000, None).await.unwrap();
        let session_id = Uuid::new_v4();
        engine
            .apply_points(Some(3), session_id, dec!(100), 500)
            .await
            .unwrap();

        assert!(engine.remove_points(3, session_id).await.unwrap());
        assert!(!engine.remove_points(3, session_id).await.unwrap());
        let preview = engine
            .redemption_preview(3, Some(session_id), dec!(100))
            .await
            .unwrap();
        assert_eq!(preview.applied_points, 0);
    }

    #[tokio::test]
    async fn test_settings_save_applies_to_next_request() {
        let engine = LoyaltyEngine::in_memory();
        assert_eq!(engine.estimate(dec!(10)).await.unwrap().points, 10);

        engine
            .save_settings(SettingsUpdate {
                earn_rate: Some(dec!(2.5)),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(engine.estimate(dec!(10)).await.unwrap().points, 25);
        assert_eq!(engine.settings().await.unwrap().earn_rate, dec!(2.5));
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let engine = LoyaltyEngine::in_memory();
        let result = engine
            .save_settings(SettingsUpdate {
                redeem_max_percent: Some(150),
                ..Default::default()
            })
            .await;
        assert_eq!(result.unwrap_err().reason_code(), "invalid_settings");
        assert_eq!(engine.settings().await.unwrap().redeem_max_percent, 100);
    }

    #[tokio::test]
    async fn test_calculator_hooks_reach_lifecycle() {
        let mut hooks = CalculatorHooks::default();
        hooks.points_for_order.register(|points, _| points * 2);
        let engine = LoyaltyEngine::in_memory().with_calculator_hooks(hooks);

        engine.handle_order_event(&completed(1, 1, dec!(40))).await.unwrap();
        assert_eq!(engine.points().get_balance(1).await.unwrap(), 80);
    }

    #[tokio::test]
    async fn test_notifier_sees_lifecycle_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = Notifier::new();
        let sink = seen.clone();
        notifier.subscribe(move |n| sink.lock().unwrap().push(n.clone()));
        let engine = LoyaltyEngine::in_memory().with_notifier(notifier);

        engine.handle_order_event(&completed(9, 1, dec!(40))).await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|n| matches!(n, Notification::Earned { order_ref: 9, points: 40, .. })));
    }

    #[tokio::test]
    async fn test_expiry_uses_engine_options() {
        let engine = LoyaltyEngine::in_memory_with(LoyaltySettings {
            expiry_enabled: true,
            expiry_days: 1,
            ..Default::default()
        })
        .with_expiry_options(ExpiryOptions {
            batch_size: 1,
            max_batches: 1,
        });
        engine.handle_order_event(&completed(1, 1, dec!(10))).await.unwrap();
        engine.handle_order_event(&completed(2, 2, dec!(10))).await.unwrap();

        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(engine.process_expiry(later).await.unwrap().expired_entries, 1);
        assert_eq!(engine.process_expiry(later).await.unwrap().expired_entries, 1);
        assert_eq!(engine.process_expiry(later).await.unwrap().expired_entries, 0);
    }

    #[tokio::test]
    async fn test_extreme_amounts_do_not_overflow() {
        let engine = LoyaltyEngine::in_memory_with(LoyaltySettings {
            earn_rate: dec!(2),
            ..Default::default()
        });
        assert_eq!(engine.estimate(Decimal::MAX).await.unwrap().points, i64::MAX);

        engine.admin_adjust(4, 500, None).await.unwrap();
        let preview = engine
            .redemption_preview(4, None, Decimal::MAX)
            .await
            .unwrap();
        assert_eq!(preview.max_points, 500);

        let applied = engine
            .apply_points(Some(4), Uuid::new_v4(), Decimal::MAX, 500)
            .await
            .unwrap();
        assert_eq!(applied.points, 500);

        let big_order = completed(11, 6, Decimal::MAX);
        engine.handle_order_event(&big_order).await.unwrap();
        assert_eq!(engine.points().get_balance(6).await.unwrap(), i64::MAX);

        // a second award cannot push the balance past i64::MAX
        engine.handle_order_event(&completed(12, 6, dec!(10))).await.unwrap();
        assert_eq!(engine.points().get_balance(6).await.unwrap(), i64::MAX);
    }

    #[tokio::test]
    async fn test_preview_without_session_ignores_other_carts() {
        let engine = LoyaltyEngine::in_memory();
        engine.admin_adjust(5, 1000, None).await.unwrap();
        engine
            .apply_points(Some(5), Uuid::nil(), dec!(100), 300)
            .await
            .unwrap();

        let preview = engine.redemption_preview(5, None, dec!(100)).await.unwrap();
        assert_eq!(preview.applied_points, 0);
        assert_eq!(preview.applied_discount, Decimal::ZERO);

        let preview = engine
            .redemption_preview(5, Some(Uuid::nil()), dec!(100))
            .await
            .unwrap();
        assert_eq!(preview.applied_points, 300);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_deliveries_race_to_one_entry() {
        let engine = Arc::new(LoyaltyEngine::in_memory());
        engine.admin_adjust(7, 1000, None).await.unwrap();
        let session_id = Uuid::new_v4();
        engine
            .apply_points(Some(7), session_id, dec!(50), 200)
            .await
            .unwrap();

        let paid = OrderEvent::PaymentComplete {
            order: OrderSnapshot {
                order_ref: 2,
                order_number: None,
                account_id: Some(7),
                totals: OrderTotals::default(),
            },
            session_id: Some(session_id),
        };
        let done = completed(2, 7, dec!(100));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let engine = engine.clone();
            let event = if i % 2 == 0 { paid.clone() } else { done.clone() };
            tasks.spawn(async move { engine.handle_order_event(&event).await.unwrap() });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        let entries = engine.ledger().entries_by_order(2).await.unwrap();
        let count = |t: EntryType| entries.iter().filter(|e| e.entry_type == t).count();
        assert_eq!(count(EntryType::Redeem), 1);
        assert_eq!(count(EntryType::Earn), 1);
        assert_eq!(engine.points().get_balance(7).await.unwrap(), 900);
        assert!(engine.points().verify_account(7).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_purge_all_clears_state() {
        let engine = LoyaltyEngine::in_memory();
        engine.handle_order_event(&completed(1, 1, dec!(10))).await.unwrap();
        engine.purge_all().await.unwrap();

        assert_eq!(engine.points().get_balance(1).await.unwrap(), 0);
        assert_eq!(engine.ledger().count_by_account(1).await.unwrap(), 0);

        // guards were purged too, so the order can earn again
        engine.handle_order_event(&completed(1, 1, dec!(10))).await.unwrap();
        assert_eq!(engine.points().get_balance(1).await.unwrap(), 10);
    }
}
