// PostgreSQL stores
// Per-account postings run in one transaction under a row lock on the balance row

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{PgPool, Postgres};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    LedgerStore, OrderGuard, OrderLoyaltyMeta, OrderMetaStore, RedemptionSessionStore,
    SessionRedemption, SettingsRepository,
};
use crate::loyalty::error::LoyaltyResult;
use crate::loyalty::ledger::{
    AccountBalance, AccountId, LedgerEntry, LedgerFilter, LedgerRow, OrderRef, PostingOutcome,
    PostingPlan, SummaryStats,
};
use crate::loyalty::settings::LoyaltySettings;
use crate::query::{BindValue, LedgerQueryBuilder, LEDGER_COLUMNS};

fn into_entries(rows: Vec<LedgerRow>) -> LoyaltyResult<Vec<LedgerEntry>> {
    rows.into_iter().map(LedgerEntry::try_from).collect()
}

fn bind_all<'q, O>(
    mut query: QueryAs<'q, Postgres, O, PgArguments>,
    params: Vec<BindValue>,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    for param in params {
        query = match param {
            BindValue::Text(value) => query.bind(value),
            BindValue::BigInt(value) => query.bind(value),
        };
    }
    query
}

/// Ledger and balance cache in PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn account(&self, account_id: AccountId) -> LoyaltyResult<AccountBalance> {
        let account = sqlx::query_as::<_, AccountBalance>(
            "SELECT account_id, balance, lifetime_earned, lifetime_spent \
             FROM loyalty_accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account.unwrap_or_else(|| AccountBalance::empty(account_id)))
    }

    async fn post(
        &self,
        account_id: AccountId,
        plan: &PostingPlan<'_>,
    ) -> LoyaltyResult<PostingOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO loyalty_accounts (account_id) VALUES ($1) \
             ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        let current = sqlx::query_as::<_, AccountBalance>(
            "SELECT account_id, balance, lifetime_earned, lifetime_spent \
             FROM loyalty_accounts WHERE account_id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        let Some(posting) = plan(&current) else {
            tx.rollback().await?;
            return Ok(PostingOutcome {
                balance: current,
                entry: None,
            });
        };
        posting.check_against(&current)?;

        sqlx::query(
            "UPDATE loyalty_accounts \
             SET balance = $2, lifetime_earned = $3, lifetime_spent = $4, updated_at = NOW() \
             WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(posting.balance.balance)
        .bind(posting.balance.lifetime_earned)
        .bind(posting.balance.lifetime_spent)
        .execute(&mut *tx)
        .await?;

        let entry = posting.entry;
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "INSERT INTO loyalty_ledger \
             (account_id, order_ref, points_delta, balance_after, entry_type, description, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {}",
            LEDGER_COLUMNS
        ))
        .bind(entry.account_id)
        .bind(entry.order_ref)
        .bind(entry.points_delta)
        .bind(entry.balance_after)
        .bind(entry.entry_type.as_str())
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PostingOutcome {
            balance: posting.balance,
            entry: Some(LedgerEntry::try_from(row)?),
        })
    }

    async fn entries_by_account(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM loyalty_ledger WHERE account_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
            LEDGER_COLUMNS
        ))
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    async fn count_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM loyalty_ledger WHERE account_id = $1")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn sum_by_account(&self, account_id: AccountId) -> LoyaltyResult<i64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(points_delta), 0)::BIGINT FROM loyalty_ledger WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn entries_by_order(&self, order_ref: OrderRef) -> LoyaltyResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM loyalty_ledger WHERE order_ref = $1 ORDER BY created_at ASC, id ASC",
            LEDGER_COLUMNS
        ))
        .bind(order_ref)
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    async fn list(&self, filter: &LedgerFilter) -> LoyaltyResult<Vec<LedgerEntry>> {
        let (sql, params) = LedgerQueryBuilder::from_filter(filter).build();
        let query = bind_all(sqlx::query_as::<_, LedgerRow>(&sql), params);
        let rows = query.fetch_all(&self.pool).await?;
        into_entries(rows)
    }

    async fn count(&self, filter: &LedgerFilter) -> LoyaltyResult<i64> {
        let (sql, params) = LedgerQueryBuilder::from_filter(filter).build_count();
        let query = bind_all(sqlx::query_as::<_, (i64,)>(&sql), params);
        let (count,) = query.fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn summary(&self, since: DateTime<Utc>) -> LoyaltyResult<SummaryStats> {
        let stats = sqlx::query_as::<_, SummaryStats>(
            "SELECT \
                COALESCE(SUM(points_delta), 0)::BIGINT AS total_in_circulation, \
                COALESCE(SUM(points_delta) FILTER (WHERE entry_type = 'earn' AND created_at >= $1), 0)::BIGINT \
                    AS earned_this_month, \
                COALESCE(ABS(SUM(points_delta) FILTER (WHERE entry_type = 'redeem' AND created_at >= $1)), 0)::BIGINT \
                    AS redeemed_this_month, \
                COALESCE(ABS(SUM(points_delta) FILTER (WHERE entry_type = 'expire' AND created_at >= $1)), 0)::BIGINT \
                    AS expired_this_month \
             FROM loyalty_ledger",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn expirable_entries(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> LoyaltyResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT l.id, l.account_id, l.order_ref, l.points_delta, l.balance_after, \
                    l.entry_type, l.description, l.metadata, l.created_at \
             FROM loyalty_ledger l \
             WHERE l.entry_type = 'earn' \
               AND l.points_delta > 0 \
               AND l.created_at < $1 \
               AND NOT EXISTS ( \
                   SELECT 1 FROM loyalty_ledger e \
                   WHERE e.entry_type = 'expire' \
                     AND (e.metadata->>'source_ledger_id')::BIGINT = l.id) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM loyalty_expiry_resolutions r WHERE r.source_entry_id = l.id) \
             ORDER BY l.created_at ASC, l.id ASC \
             LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    async fn resolve_expiry(&self, source_entry_id: i64) -> LoyaltyResult<()> {
        sqlx::query(
            "INSERT INTO loyalty_expiry_resolutions (source_entry_id) VALUES ($1) \
             ON CONFLICT (source_entry_id) DO NOTHING",
        )
        .bind(source_entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge(&self) -> LoyaltyResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM loyalty_expiry_resolutions")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM loyalty_ledger")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM loyalty_accounts")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Order idempotency guards in PostgreSQL
///
/// Every claim is a single conditional upsert, so two concurrent deliveries of
/// the same event cannot both win.
#[derive(Clone)]
pub struct PgOrderMetaStore {
    pool: PgPool,
}

impl PgOrderMetaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderMetaStore for PgOrderMetaStore {
    async fn load(&self, order_ref: OrderRef) -> LoyaltyResult<OrderLoyaltyMeta> {
        let meta = sqlx::query_as::<_, OrderLoyaltyMeta>(
            "SELECT order_ref, points_awarded, points_earned, points_reversed, points_spent, \
                    discount_amount, pending_redeem_points \
             FROM loyalty_order_meta WHERE order_ref = $1",
        )
        .bind(order_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(meta.unwrap_or_else(|| OrderLoyaltyMeta::empty(order_ref)))
    }

    async fn claim_award(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<bool> {
        let result = sqlx::query(
            "INSERT INTO loyalty_order_meta (order_ref, points_awarded, points_earned) \
             VALUES ($1, TRUE, $2) \
             ON CONFLICT (order_ref) DO UPDATE \
             SET points_awarded = TRUE, points_earned = EXCLUDED.points_earned, updated_at = NOW() \
             WHERE loyalty_order_meta.points_awarded = FALSE",
        )
        .bind(order_ref)
        .bind(points)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_reversal(&self, order_ref: OrderRef) -> LoyaltyResult<bool> {
        let result = sqlx::query(
            "INSERT INTO loyalty_order_meta (order_ref, points_reversed) VALUES ($1, TRUE) \
             ON CONFLICT (order_ref) DO UPDATE \
             SET points_reversed = TRUE, updated_at = NOW() \
             WHERE loyalty_order_meta.points_reversed = FALSE",
        )
        .bind(order_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_redemption(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<bool> {
        let result = sqlx::query(
            "INSERT INTO loyalty_order_meta (order_ref, points_spent) VALUES ($1, $2) \
             ON CONFLICT (order_ref) DO UPDATE \
             SET points_spent = EXCLUDED.points_spent, updated_at = NOW() \
             WHERE loyalty_order_meta.points_spent IS NULL",
        )
        .bind(order_ref)
        .bind(points)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, order_ref: OrderRef, guard: OrderGuard) -> LoyaltyResult<()> {
        let sql = match guard {
            OrderGuard::Award => {
                "UPDATE loyalty_order_meta SET points_awarded = FALSE, points_earned = NULL, \
                 updated_at = NOW() WHERE order_ref = $1"
            }
            OrderGuard::Reversal => {
                "UPDATE loyalty_order_meta SET points_reversed = FALSE, updated_at = NOW() \
                 WHERE order_ref = $1"
            }
            OrderGuard::Redemption => {
                "UPDATE loyalty_order_meta SET points_spent = NULL, discount_amount = NULL, \
                 updated_at = NOW() WHERE order_ref = $1"
            }
        };
        sqlx::query(sql).bind(order_ref).execute(&self.pool).await?;
        Ok(())
    }

    async fn record_spent(
        &self,
        order_ref: OrderRef,
        points: i64,
        discount: Decimal,
    ) -> LoyaltyResult<()> {
        sqlx::query(
            "INSERT INTO loyalty_order_meta (order_ref, points_spent, discount_amount) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (order_ref) DO UPDATE \
             SET points_spent = EXCLUDED.points_spent, \
                 discount_amount = EXCLUDED.discount_amount, \
                 updated_at = NOW()",
        )
        .bind(order_ref)
        .bind(points)
        .bind(discount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_pending_redeem(&self, order_ref: OrderRef, points: i64) -> LoyaltyResult<()> {
        sqlx::query(
            "INSERT INTO loyalty_order_meta (order_ref, pending_redeem_points) VALUES ($1, $2) \
             ON CONFLICT (order_ref) DO UPDATE \
             SET pending_redeem_points = EXCLUDED.pending_redeem_points, updated_at = NOW()",
        )
        .bind(order_ref)
        .bind(points)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge(&self) -> LoyaltyResult<()> {
        sqlx::query("DELETE FROM loyalty_order_meta")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Time-to-live for the cached settings document (60 seconds)
const SETTINGS_TTL: Duration = Duration::from_secs(60);

struct CachedSettings {
    settings: Arc<LoyaltySettings>,
    loaded_at: Instant,
}

/// Settings singleton row with a short-lived in-process cache
pub struct PgSettingsRepository {
    pool: PgPool,
    cache: RwLock<Option<CachedSettings>>,
    ttl: Duration,
}

impl PgSettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(None),
            ttl: SETTINGS_TTL,
        }
    }

    async fn load(&self) -> LoyaltyResult<LoyaltySettings> {
        let document: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT settings FROM loyalty_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        match document {
            Some(value) => Ok(serde_json::from_value::<LoyaltySettings>(value)?.sanitized()),
            None => Ok(LoyaltySettings::default()),
        }
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
        tracing::debug!("Loyalty settings cache invalidated");
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    async fn current(&self) -> LoyaltyResult<Arc<LoyaltySettings>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() <= self.ttl {
                    return Ok(cached.settings.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the write lock
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() <= self.ttl {
                return Ok(cached.settings.clone());
            }
        }

        let settings = Arc::new(self.load().await?);
        *cache = Some(CachedSettings {
            settings: settings.clone(),
            loaded_at: Instant::now(),
        });
        Ok(settings)
    }

    async fn save(&self, settings: &LoyaltySettings) -> LoyaltyResult<()> {
        let document = serde_json::to_value(settings)?;
        sqlx::query(
            "INSERT INTO loyalty_settings (id, settings) VALUES (1, $1) \
             ON CONFLICT (id) DO UPDATE SET settings = EXCLUDED.settings, updated_at = NOW()",
        )
        .bind(document)
        .execute(&self.pool)
        .await?;

        self.invalidate_cache().await;
        Ok(())
    }
}

/// Redemption sessions in PostgreSQL
#[derive(Clone)]
pub struct PgRedemptionSessionStore {
    pool: PgPool,
}

impl PgRedemptionSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RedemptionSessionStore for PgRedemptionSessionStore {
    async fn get(&self, session_id: Uuid) -> LoyaltyResult<Option<SessionRedemption>> {
        let session = sqlx::query_as::<_, SessionRedemption>(
            "SELECT session_id, account_id, points, discount, updated_at \
             FROM redemption_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn put(&self, redemption: &SessionRedemption) -> LoyaltyResult<()> {
        sqlx::query(
            "INSERT INTO redemption_sessions (session_id, account_id, points, discount, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (session_id) DO UPDATE \
             SET account_id = EXCLUDED.account_id, points = EXCLUDED.points, \
                 discount = EXCLUDED.discount, updated_at = EXCLUDED.updated_at",
        )
        .bind(redemption.session_id)
        .bind(redemption.account_id)
        .bind(redemption.points)
        .bind(redemption.discount)
        .bind(redemption.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, session_id: Uuid) -> LoyaltyResult<bool> {
        let result = sqlx::query("DELETE FROM redemption_sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge(&self) -> LoyaltyResult<()> {
        sqlx::query("DELETE FROM redemption_sessions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
