// Aggregate cache for ledger reads
//
// Wraps any LedgerStore and memoises the read-heavy aggregates with short
// TTLs. A posting for account A drops A's entries; a posting tied to order O
// drops O's entries; every posting drops the summary and expirable caches.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::error::LoyaltyResult;
use super::ledger::{
    AccountBalance, AccountId, LedgerEntry, LedgerFilter, OrderRef, PostingOutcome, PostingPlan,
    SummaryStats,
};
use super::metrics::LoyaltyMetrics;
use super::store::LedgerStore;

/// Time-to-live for account, order and summary aggregates (60 seconds)
const AGGREGATE_TTL: Duration = Duration::from_secs(60);

/// Time-to-live for the expirable-entry scan (30 seconds)
const EXPIRABLE_TTL: Duration = Duration::from_secs(30);

/// Upper bound on live entries per aggregate map
const MAX_ENTRIES_PER_MAP: usize = 4096;

struct Timed<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Default)]
struct CacheState {
    // Bumped on every invalidation; fills computed under an older generation are discarded
    generation: u64,
    account_pages: HashMap<(AccountId, i64, i64), Timed<Vec<LedgerEntry>>>,
    account_counts: HashMap<AccountId, Timed<i64>>,
    account_sums: HashMap<AccountId, Timed<i64>>,
    orders: HashMap<OrderRef, Timed<Vec<LedgerEntry>>>,
    summaries: HashMap<DateTime<Utc>, Timed<SummaryStats>>,
    expirable: HashMap<(DateTime<Utc>, i64), Timed<Vec<LedgerEntry>>>,
}

type Selector<K, V> = fn(&mut CacheState) -> &mut HashMap<K, Timed<V>>;

impl CacheState {
    fn account_pages(&mut self) -> &mut HashMap<(AccountId, i64, i64), Timed<Vec<LedgerEntry>>> {
        &mut self.account_pages
    }

    fn account_counts(&mut self) -> &mut HashMap<AccountId, Timed<i64>> {
        &mut self.account_counts
    }

    fn account_sums(&mut self) -> &mut HashMap<AccountId, Timed<i64>> {
        &mut self.account_sums
    }

    fn orders(&mut self) -> &mut HashMap<OrderRef, Timed<Vec<LedgerEntry>>> {
        &mut self.orders
    }

    fn summaries(&mut self) -> &mut HashMap<DateTime<Utc>, Timed<SummaryStats>> {
        &mut self.summaries
    }

    fn expirable(&mut self) -> &mut HashMap<(DateTime<Utc>, i64), Timed<Vec<LedgerEntry>>> {
        &mut self.expirable
    }

    fn invalidate_entry(&mut self, entry: &LedgerEntry) {
        self.generation += 1;
        let account_id = entry.account_id;
        self.account_pages.retain(|(account, _, _), _| *account != account_id);
        self.account_counts.remove(&account_id);
        self.account_sums.remove(&account_id);
        if let Some(order_ref) = entry.order_ref {
            self.orders.remove(&order_ref);
        }
        self.summaries.clear();
        self.expirable.clear();
    }

    fn invalidate_expirable(&mut self) {
        self.generation += 1;
        self.expirable.clear();
    }

    fn clear(&mut self) {
        let generation = self.generation + 1;
        *self = CacheState::default();
        self.generation = generation;
    }
}

/// LedgerStore decorator with TTL caching of aggregate reads
pub struct CachedLedgerStore<S> {
    inner: S,
    state: Mutex<CacheState>,
    metrics: LoyaltyMetrics,
}

impl<S: LedgerStore> CachedLedgerStore<S> {
    pub fn new(inner: S, metrics: LoyaltyMetrics) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState::default()),
            metrics,
        }
    }

    async fn cached<K, V, Fut>(
        &self,
        select: Selector<K, V>,
        key: K,
        ttl: Duration,
        fetch: Fut,
    ) -> LoyaltyResult<V>
    where
        K: Eq + Hash,
        V: Clone,
        Fut: Future<Output = LoyaltyResult<V>>,
    {
        let generation = {
            let mut state = self.state.lock().await;
            if let Some(hit) = select(&mut state).get(&key) {
                if hit.stored_at.elapsed() <= ttl {
                    self.metrics.record_cache_hit();
                    return Ok(hit.value.clone());
                }
            }
            state.generation
        };

        self.metrics.record_cache_miss();
        let value = fetch.await?;

        let mut state = self.state.lock().await;
        if state.generation == generation {
            let map = select(&mut state);
            map.retain(|_, timed| timed.stored_at.elapsed() <= ttl);
            if map.len() >= MAX_ENTRIES_PER_MAP {
                map.clear();
            }
            map.insert(
                key,
                Timed {
                    value: value.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
        Ok(value)
    }
}

#[async_trait]
impl<S: LedgerStore> LedgerStore for CachedLedgerStore<S> {
    async fn account(&self, account_id: AccountId) -> LoyaltyResult<AccountBalance> {
        self.inner.account(account_id).await
    }

    async fn post(
        &self,
        account_id: AccountId,
        plan: &PostingPlan<'_>,
    ) -> LoyaltyResult<PostingOutcome> {
        let outcome = self.inner.post(account_id, plan).await?;
        if let Some(entry) = &outcome.entry {
            self.state.lock().await.invalidate_entry(entry);
        }
        Ok(outcome)
    }

    async fn entries_by_account(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>> {
        self.cached(
            CacheState::account_pages,
            (account_id, limit, offset),
            AGGREGATE_TTL,
            self.inner.entries_by_account(account_id, limit, offset),
        )
        .await
    }

    async fn count_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64> {
        self.cached(
            CacheState::account_counts,
            account_id,
            AGGREGATE_TTL,
            self.inner.count_by_account(account_id),
        )
        .await
    }

    async fn sum_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64> {
        self.cached(
            CacheState::account_sums,
            account_id,
            AGGREGATE_TTL,
            self.inner.sum_by_account(account_id),
        )
        .await
    }

    async fn entries_by_order(&self, order_ref: OrderRef) -> LoyaltyResult<Vec<LedgerEntry>> {
        self.cached(
            CacheState::orders,
            order_ref,
            AGGREGATE_TTL,
            self.inner.entries_by_order(order_ref),
        )
        .await
    }

    async fn list(&self, filter: &LedgerFilter) -> LoyaltyResult<Vec<LedgerEntry>> {
        self.inner.list(filter).await
    }

    async fn count(&self, filter: &LedgerFilter) -> LoyaltyResult<i64> {
        self.inner.count(filter).await
    }

    async fn summary(&self, since: DateTime<Utc>) -> LoyaltyResult<SummaryStats> {
        self.cached(
            CacheState::summaries,
            since,
            AGGREGATE_TTL,
            self.inner.summary(since),
        )
        .await
    }

    async fn expirable_entries(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>> {
        self.cached(
            CacheState::expirable,
            (cutoff, limit),
            EXPIRABLE_TTL,
            self.inner.expirable_entries(cutoff, limit),
        )
        .await
    }

    async fn resolve_expiry(&self, source_entry_id: i64) -> LoyaltyResult<()> {
        self.inner.resolve_expiry(source_entry_id).await?;
        self.state.lock().await.invalidate_expirable();
        Ok(())
    }

    async fn purge(&self) -> LoyaltyResult<()> {
        self.inner.purge().await?;
        self.state.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loyalty::ledger::{NewLedgerEntry, Posting};
    use crate::loyalty::store::MemoryLedgerStore;
    use crate::loyalty::types::EntryType;

    fn credit(
        amount: i64,
        order_ref: Option<OrderRef>,
    ) -> impl Fn(&AccountBalance) -> Option<Posting> + Send + Sync {
        move |current: &AccountBalance| {
            let balance = AccountBalance {
                balance: current.balance + amount,
                lifetime_earned: current.lifetime_earned + amount,
                ..*current
            };
            Some(Posting {
                balance,
                entry: NewLedgerEntry {
                    account_id: current.account_id,
                    order_ref,
                    points_delta: amount,
                    balance_after: balance.balance,
                    entry_type: EntryType::Earn,
                    description: String::new(),
                    metadata: None,
                    created_at: Utc::now(),
                },
            })
        }
    }

    fn store() -> (CachedLedgerStore<MemoryLedgerStore>, MemoryLedgerStore, LoyaltyMetrics) {
        let inner = MemoryLedgerStore::new();
        let metrics = LoyaltyMetrics::new();
        (
            CachedLedgerStore::new(inner.clone(), metrics.clone()),
            inner,
            metrics,
        )
    }

    #[tokio::test]
    async fn test_repeated_reads_hit_cache() {
        let (cached, _, metrics) = store();
        cached.post(1, &credit(10, None)).await.unwrap();

        assert_eq!(cached.count_by_account(1).await.unwrap(), 1);
        assert_eq!(cached.count_by_account(1).await.unwrap(), 1);

        let summary = metrics.summary();
        assert_eq!(summary.cache_misses, 1);
        assert_eq!(summary.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_posting_invalidates_account_and_order() {
        let (cached, _, _) = store();
        cached.post(1, &credit(10, Some(7))).await.unwrap();

        assert_eq!(cached.sum_by_account(1).await.unwrap(), 10);
        assert_eq!(cached.entries_by_order(7).await.unwrap().len(), 1);

        cached.post(1, &credit(5, Some(7))).await.unwrap();

        assert_eq!(cached.sum_by_account(1).await.unwrap(), 15);
        assert_eq!(cached.entries_by_order(7).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_posting_for_other_account_keeps_entries() {
        let (cached, inner, metrics) = store();
        cached.post(1, &credit(10, None)).await.unwrap();
        assert_eq!(cached.count_by_account(1).await.unwrap(), 1);

        cached.post(2, &credit(10, None)).await.unwrap();
        assert_eq!(cached.count_by_account(1).await.unwrap(), 1);
        assert_eq!(metrics.summary().cache_hits, 1);

        // a write that bypasses the decorator stays invisible until the TTL lapses
        inner.post(1, &credit(1, None)).await.unwrap();
        assert_eq!(cached.count_by_account(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_any_posting_clears_summary() {
        let (cached, _, _) = store();
        let since = Utc::now() - chrono::Duration::days(1);
        cached.post(1, &credit(10, None)).await.unwrap();
        assert_eq!(cached.summary(since).await.unwrap().earned_this_month, 10);

        cached.post(2, &credit(20, None)).await.unwrap();
        let summary = cached.summary(since).await.unwrap();
        assert_eq!(summary.earned_this_month, 30);
        assert_eq!(summary.total_in_circulation, 30);
    }

    #[tokio::test]
    async fn test_resolve_expiry_clears_expirable_scan() {
        let (cached, _, _) = store();
        let entry = cached
            .post(1, &credit(10, None))
            .await
            .unwrap()
            .entry
            .unwrap();
        let cutoff = Utc::now() + chrono::Duration::days(1);

        assert_eq!(cached.expirable_entries(cutoff, 10).await.unwrap().len(), 1);
        cached.resolve_expiry(entry.id).await.unwrap();
        assert!(cached.expirable_entries(cutoff, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_entries_are_evicted_on_fill() {
        let (cached, _, _) = store();
        let ttl = Duration::from_millis(10);
        cached
            .cached(CacheState::account_counts, 1, ttl, async { Ok(1) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cached
            .cached(CacheState::account_counts, 2, ttl, async { Ok(2) })
            .await
            .unwrap();
        let state = cached.state.lock().await;
        assert_eq!(state.account_counts.len(), 1);
        assert!(state.account_counts.contains_key(&2));
    }

    #[tokio::test]
    async fn test_distinct_keys_stay_bounded() {
        let (cached, _, _) = store();
        for account_id in 0..(MAX_ENTRIES_PER_MAP as i64 + 100) {
            cached
                .cached(CacheState::account_sums, account_id, AGGREGATE_TTL, async { Ok(0) })
                .await
                .unwrap();
        }
        assert!(cached.state.lock().await.account_sums.len() <= MAX_ENTRIES_PER_MAP);
    }
}
