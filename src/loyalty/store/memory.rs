// In-memory stores
// Each store serialises on one async mutex, which also gives per-account posting order

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    LedgerStore, OrderGuard, OrderLoyaltyMeta, OrderMetaStore, RedemptionSessionStore,
    SessionRedemption, SettingsRepository,
};
use crate::loyalty::error::LoyaltyResult;
use crate::loyalty::ledger::{
    AccountBalance, AccountId, LedgerEntry, LedgerFilter, OrderRef, PostingOutcome, PostingPlan,
    SortColumn, SortDirection, SummaryStats,
};
use crate::loyalty::redemption::CartSession;
use crate::loyalty::settings::LoyaltySettings;
use crate::loyalty::types::EntryType;

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, AccountBalance>,
    entries: Vec<LedgerEntry>,
    resolved: HashSet<i64>,
    next_id: i64,
}

impl LedgerState {
    fn is_expiry_resolved(&self, entry: &LedgerEntry) -> bool {
        self.resolved.contains(&entry.id)
            || self.entries.iter().any(|e| {
                e.entry_type == EntryType::Expire && e.source_entry_id() == Some(entry.id)
            })
    }
}

/// Ledger and balances held in process memory
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_key(entry: &LedgerEntry, column: SortColumn) -> (i64, i64) {
    let primary = match column {
        SortColumn::CreatedAt => entry.created_at.timestamp_micros(),
        SortColumn::PointsDelta => entry.points_delta,
        SortColumn::BalanceAfter => entry.balance_after,
        SortColumn::AccountId => entry.account_id,
    };
    (primary, entry.id)
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn account(&self, account_id: AccountId) -> LoyaltyResult<AccountBalance> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .get(&account_id)
            .copied()
            .unwrap_or_else(|| AccountBalance::empty(account_id)))
    }

    async fn post(
        &self,
        account_id: AccountId,
        plan: &PostingPlan<'_>,
    ) -> LoyaltyResult<PostingOutcome> {
        let mut state = self.state.lock().await;
        let current = state
            .accounts
            .get(&account_id)
            .copied()
            .unwrap_or_else(|| AccountBalance::empty(account_id));

        let Some(posting) = plan(&current) else {
            return Ok(PostingOutcome {
                balance: current,
                entry: None,
            });
        };
        posting.check_against(&current)?;

        state.next_id += 1;
        let entry = posting.entry.into_entry(state.next_id);
        state.accounts.insert(account_id, posting.balance);
        state.entries.push(entry.clone());

        Ok(PostingOutcome {
            balance: posting.balance,
            entry: Some(entry),
        })
    }

    async fn entries_by_account(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            sort_key(b, SortColumn::CreatedAt).cmp(&sort_key(a, SortColumn::CreatedAt))
        });
        Ok(page(entries, limit, offset))
    }

    async fn count_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .count() as i64)
    }

    async fn sum_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.points_delta)
            .sum())
    }

    async fn entries_by_order(&self, order_ref: OrderRef) -> LoyaltyResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.order_ref == Some(order_ref))
            .cloned()
            .collect();
        entries.sort_by_key(|e| sort_key(e, SortColumn::CreatedAt));
        Ok(entries)
    }

    async fn list(&self, filter: &LedgerFilter) -> LoyaltyResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            let ordering = sort_key(a, filter.sort).cmp(&sort_key(b, filter.sort));
            match filter.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
        Ok(page(entries, filter.limit, filter.offset))
    }

    async fn count(&self, filter: &LedgerFilter) -> LoyaltyResult<i64> {
        let state = self.state.lock().await;
        Ok(state.entries.iter().filter(|e| filter.matches(e)).count() as i64)
    }

    async fn summary(&self, since: DateTime<Utc>) -> LoyaltyResult<SummaryStats> {
        let state = self.state.lock().await;
        let mut stats = SummaryStats::default();
        for entry in &state.entries {
            stats.total_in_circulation += entry.points_delta;
            if entry.created_at < since {
                continue;
            }
            match entry.entry_type {
                EntryType::Earn => stats.earned_this_month += entry.points_delta,
                EntryType::Redeem => stats.redeemed_this_month += entry.points_delta.abs(),
                EntryType::Expire => stats.expired_this_month += entry.points_delta.abs(),
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn expirable_entries(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| {
                e.entry_type == EntryType::Earn
                    && e.points_delta > 0
                    && e.created_at < cutoff
                    && !state.is_expiry_resolved(e)
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| sort_key(e, SortColumn::CreatedAt));
        Ok(page(entries, limit, 0))
    }

    async fn resolve_expiry(&self, source_entry_id: i64) -> LoyaltyResult<()> {
        let mut state = self.state.lock().await;
        state.resolved.insert(source_entry_id);
        Ok(())
    }

    async fn purge(&self) -> LoyaltyResult<()> {
        let mut state = self.state.lock().await;
        state.accounts.clear();
        state.entries.clear();
        state.resolved.clear();
        Ok(())
    }
}

fn page(entries: Vec<LedgerEntry>, limit: i64, offset: i64) -> Vec<LedgerEntry> {
    entries
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

/// Order guards held in process memory
#[derive(Clone, Default)]
pub struct MemoryOrderMetaStore {
    orders: Arc<Mutex<HashMap<OrderRef, OrderLoyaltyMeta>>>,
}

impl MemoryOrderMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderMetaStore for MemoryOrderMetaStore {
    async fn load(&self, order_ref: OrderRef) -> LoyaltyResult<OrderLoyaltyMeta> {
        let orders = self.orders.lock().await;
        Ok(orders
            .get(&order_ref)
            .cloned()
            .unwrap_or_else(|| OrderLoyaltyMeta::empty(order_ref)))
    }

    async fn claim_award(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<bool> {
        let mut orders = self.orders.lock().await;
        let meta = orders
            .entry(order_ref)
            .or_insert_with(|| OrderLoyaltyMeta::empty(order_ref));
        if meta.points_awarded {
            return Ok(false);
        }
        meta.points_awarded = true;
        meta.points_earned = Some(points);
        Ok(true)
    }

    async fn claim_reversal(&self, order_ref: OrderRef) -> LoyaltyResult<bool> {
        let mut orders = self.orders.lock().await;
        let meta = orders
            .entry(order_ref)
            .or_insert_with(|| OrderLoyaltyMeta::empty(order_ref));
        if meta.points_reversed {
            return Ok(false);
        }
        meta.points_reversed = true;
        Ok(true)
    }

    async fn claim_redemption(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<bool> {
        let mut orders = self.orders.lock().await;
        let meta = orders
            .entry(order_ref)
            .or_insert_with(|| OrderLoyaltyMeta::empty(order_ref));
        if meta.points_spent.is_some() {
            return Ok(false);
        }
        meta.points_spent = Some(points);
        Ok(true)
    }

    async fn release(&self, order_ref: OrderRef, guard: OrderGuard) -> LoyaltyResult<()> {
        let mut orders = self.orders.lock().await;
        if let Some(meta) = orders.get_mut(&order_ref) {
            match guard {
                OrderGuard::Award => {
                    meta.points_awarded = false;
                    meta.points_earned = None;
                }
                OrderGuard::Reversal => meta.points_reversed = false,
                OrderGuard::Redemption => {
                    meta.points_spent = None;
                    meta.discount_amount = None;
                }
            }
        }
        Ok(())
    }

    async fn record_spent(
        &self,
        order_ref: OrderRef,
        points: i64,
        discount: Decimal,
    ) -> LoyaltyResult<()> {
        let mut orders = self.orders.lock().await;
        let meta = orders
            .entry(order_ref)
            .or_insert_with(|| OrderLoyaltyMeta::empty(order_ref));
        meta.points_spent = Some(points);
        meta.discount_amount = Some(discount);
        Ok(())
    }

    async fn save_pending_redeem(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<()> {
        let mut orders = self.orders.lock().await;
        orders
            .entry(order_ref)
            .or_insert_with(|| OrderLoyaltyMeta::empty(order_ref))
            .pending_redeem_points = Some(points);
        Ok(())
    }

    async fn purge(&self) -> LoyaltyResult<()> {
        self.orders.lock().await.clear();
        Ok(())
    }
}

/// Settings held in process memory
pub struct MemorySettingsRepository {
    settings: RwLock<Arc<LoyaltySettings>>,
}

impl MemorySettingsRepository {
    pub fn new(settings: LoyaltySettings) -> Self {
        Self {
            settings: RwLock::new(Arc::new(settings)),
        }
    }
}

impl Default for MemorySettingsRepository {
    fn default() -> Self {
        Self::new(LoyaltySettings::default())
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn current(&self) -> LoyaltyResult<Arc<LoyaltySettings>> {
        Ok(self.settings.read().await.clone())
    }

    async fn save(&self, settings: &LoyaltySettings) -> LoyaltyResult<()> {
        *self.settings.write().await = Arc::new(settings.clone());
        Ok(())
    }
}

/// Redemption sessions held in process memory
#[derive(Clone, Default)]
pub struct MemoryRedemptionSessionStore {
    sessions: Arc<Mutex<HashMap<Uuid, SessionRedemption>>>,
}

impl MemoryRedemptionSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RedemptionSessionStore for MemoryRedemptionSessionStore {
    async fn get(&self, session_id: Uuid) -> LoyaltyResult<Option<SessionRedemption>> {
        Ok(self.sessions.lock().await.get(&session_id).cloned())
    }

    async fn put(&self, redemption: &SessionRedemption) -> LoyaltyResult<()> {
        self.sessions
            .lock()
            .await
            .insert(redemption.session_id, redemption.clone());
        Ok(())
    }

    async fn clear(&self, session_id: Uuid) -> LoyaltyResult<bool> {
        Ok(self.sessions.lock().await.remove(&session_id).is_some())
    }

    async fn purge(&self) -> LoyaltyResult<()> {
        self.sessions.lock().await.clear();
        Ok(())
    }
}

/// Self-contained cart for embedding and tests
pub struct MemoryCartSession {
    subtotal: Decimal,
    redeem_points: Mutex<i64>,
    discounts: Mutex<HashMap<String, Decimal>>,
}

impl MemoryCartSession {
    pub fn new(subtotal: Decimal) -> Self {
        Self {
            subtotal,
            redeem_points: Mutex::new(0),
            discounts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn discount(&self, code: &str) -> Option<Decimal> {
        self.discounts.lock().await.get(code).copied()
    }
}

#[async_trait]
impl CartSession for MemoryCartSession {
    fn subtotal(&self) -> Decimal {
        self.subtotal
    }

    async fn redeem_points(&self) -> LoyaltyResult<i64> {
        Ok(*self.redeem_points.lock().await)
    }

    async fn set_redeem_points(&self, points: i64) -> LoyaltyResult<()> {
        *self.redeem_points.lock().await = points;
        Ok(())
    }

    async fn apply_discount(&self, code: &str, amount: Decimal) -> LoyaltyResult<()> {
        self.discounts.lock().await.insert(code.to_string(), amount);
        Ok(())
    }

    async fn remove_discount(&self, code: &str) -> LoyaltyResult<()> {
        self.discounts.lock().await.remove(code);
        Ok(())
    }
}
