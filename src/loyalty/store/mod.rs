// Storage traits for the loyalty ledger
// PostgreSQL implementations back the service; in-memory ones back tests and embedding

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::LoyaltyResult;
use super::ledger::{
    AccountBalance, AccountId, LedgerEntry, LedgerFilter, OrderRef, PostingOutcome, PostingPlan,
    SummaryStats,
};
use super::settings::LoyaltySettings;

pub use memory::{
    MemoryCartSession, MemoryLedgerStore, MemoryOrderMetaStore, MemoryRedemptionSessionStore,
    MemorySettingsRepository,
};
pub use postgres::{
    PgLedgerStore, PgOrderMetaStore, PgRedemptionSessionStore, PgSettingsRepository,
};

/// Append-only ledger plus the per-account balance cache
///
/// `post` is the only write path. Implementations serialise postings per
/// account: the plan sees the latest committed state and its result is
/// stored atomically (balance row and ledger row together).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current balance state; an unknown account reads as empty
    async fn account(&self, account_id: AccountId) -> LoyaltyResult<AccountBalance>;

    /// Lock the account, evaluate `plan` against its state and persist the result
    async fn post(
        &self,
        account_id: AccountId,
        plan: &PostingPlan<'_>,
    ) -> LoyaltyResult<PostingOutcome>;

    /// Newest first
    async fn entries_by_account(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>>;

    async fn count_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64>;

    /// Sum of all deltas, used to verify the cached balance
    async fn sum_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64>;

    /// Oldest first
    async fn entries_by_order(&self, order_ref: OrderRef) -> LoyaltyResult<Vec<LedgerEntry>>;

    async fn list(&self, filter: &LedgerFilter) -> LoyaltyResult<Vec<LedgerEntry>>;

    /// Count for the filter's criteria, ignoring sort and page window
    async fn count(&self, filter: &LedgerFilter) -> LoyaltyResult<i64>;

    /// Circulation total plus per-type totals for entries created since `since`
    async fn summary(&self, since: DateTime<Utc>) -> LoyaltyResult<SummaryStats>;

    /// Unresolved earn entries created before `cutoff`, oldest first
    async fn expirable_entries(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>>;

    /// Mark an earn entry resolved without writing an expire entry
    async fn resolve_expiry(&self, source_entry_id: i64) -> LoyaltyResult<()>;

    /// Delete every ledger row and balance
    async fn purge(&self) -> LoyaltyResult<()>;
}

/// Loyalty state attached to one external order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct OrderLoyaltyMeta {
    pub order_ref: OrderRef,
    pub points_awarded: bool,
    pub points_earned: Option<i64>,
    pub points_reversed: bool,
    /// Presence means the redemption was finalised
    pub points_spent: Option<i64>,
    pub discount_amount: Option<Decimal>,
    /// Points earmarked at checkout, used when the session is gone by payment time
    pub pending_redeem_points: Option<i64>,
}

impl OrderLoyaltyMeta {
    pub fn empty(order_ref: OrderRef) -> Self {
        Self {
            order_ref,
            ..Default::default()
        }
    }
}

/// Idempotency guard that can be rolled back after a failed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderGuard {
    Award,
    Reversal,
    Redemption,
}

/// Idempotency guards per external order
///
/// `claim_*` flips a guard only if it is not already set and reports whether
/// this caller won; duplicate deliveries lose the race and do nothing.
#[async_trait]
pub trait OrderMetaStore: Send + Sync {
    async fn load(&self, order_ref: OrderRef) -> LoyaltyResult<OrderLoyaltyMeta>;

    /// Set `points_awarded` and record `points_earned`
    async fn claim_award(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<bool>;

    /// Set `points_reversed`
    async fn claim_reversal(&self, order_ref: OrderRef) -> LoyaltyResult<bool>;

    /// Record `points_spent` if no redemption has been finalised yet
    async fn claim_redemption(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<bool>;

    /// Undo a claim whose mutation failed
    async fn release(&self, order_ref: OrderRef, guard: OrderGuard) -> LoyaltyResult<()>;

    /// Store the amount actually debited and its currency value
    async fn record_spent(
        &self,
        order_ref: OrderRef,
        points: i64,
        discount: Decimal,
    ) -> LoyaltyResult<()>;

    async fn save_pending_redeem(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<()>;

    async fn purge(&self) -> LoyaltyResult<()>;
}

/// Source of the current settings snapshot
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn current(&self) -> LoyaltyResult<Arc<LoyaltySettings>>;

    async fn save(&self, settings: &LoyaltySettings) -> LoyaltyResult<()>;
}

/// Points earmarked against a shopping session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct SessionRedemption {
    pub session_id: Uuid,
    pub account_id: AccountId,
    pub points: i64,
    pub discount: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Transient redemption state keyed by shopping session
#[async_trait]
pub trait RedemptionSessionStore: Send + Sync {
    async fn get(&self, session_id: Uuid) -> LoyaltyResult<Option<SessionRedemption>>;

    async fn put(&self, redemption: &SessionRedemption) -> LoyaltyResult<()>;

    /// Returns whether anything was removed
    async fn clear(&self, session_id: Uuid) -> LoyaltyResult<bool>;

    async fn purge(&self) -> LoyaltyResult<()>;
}
