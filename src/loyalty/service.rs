// Points service
// The only writer of balances and ledger entries

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::error::{LoyaltyError, LoyaltyResult};
use super::ledger::{AccountBalance, AccountId, LedgerEntry, NewLedgerEntry, OrderRef, Posting};
use super::metrics::LoyaltyMetrics;
use super::notify::{Notification, Notifier};
use super::store::LedgerStore;
use super::types::EntryType;

const ADMIN_ADD_REASON: &str = "Points added by admin";
const ADMIN_DEDUCT_REASON: &str = "Points deducted by admin";

/// A requested credit or debit
#[derive(Debug, Clone, PartialEq)]
pub struct PointsChange {
    pub account_id: AccountId,
    pub points: i64,
    pub entry_type: EntryType,
    pub description: String,
    pub order_ref: Option<OrderRef>,
    pub metadata: Option<Value>,
}

impl PointsChange {
    pub fn new(
        account_id: AccountId,
        points: i64,
        entry_type: EntryType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            points,
            entry_type,
            description: description.into(),
            order_ref: None,
            metadata: None,
        }
    }

    pub fn for_order(mut self, order_ref: OrderRef) -> Self {
        self.order_ref = Some(order_ref);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn entry(&self, account_id: AccountId, delta: i64, balance_after: i64) -> NewLedgerEntry {
        NewLedgerEntry {
            account_id,
            order_ref: self.order_ref,
            points_delta: delta,
            balance_after,
            entry_type: self.entry_type,
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Result of a credit or debit that was accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Account state after the operation
    pub balance: AccountBalance,
    /// Points actually moved; a clamped debit may move fewer than requested
    pub points: i64,
    /// `None` when the clamp left nothing to move
    pub entry: Option<LedgerEntry>,
}

impl Mutation {
    pub fn new_balance(&self) -> i64 {
        self.balance.balance
    }
}

/// Stored balance compared against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct BalanceVerification {
    pub account_id: AccountId,
    pub stored_balance: i64,
    pub ledger_sum: i64,
    /// stored_balance - ledger_sum
    pub drift: i64,
    pub consistent: bool,
}

/// Credit/debit protocol over a LedgerStore
///
/// Every mutation is one `post` call, so the balance update and the ledger
/// append are decided against the same locked account state.
#[derive(Clone)]
pub struct PointsService {
    ledger: Arc<dyn LedgerStore>,
    notifier: Notifier,
    metrics: LoyaltyMetrics,
}

impl PointsService {
    pub fn new(ledger: Arc<dyn LedgerStore>, notifier: Notifier, metrics: LoyaltyMetrics) -> Self {
        Self {
            ledger,
            notifier,
            metrics,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub async fn get_balance(&self, account_id: AccountId) -> LoyaltyResult<i64> {
        Ok(self.ledger.account(account_id).await?.balance)
    }

    pub async fn account(&self, account_id: AccountId) -> LoyaltyResult<AccountBalance> {
        self.ledger.account(account_id).await
    }

    /// Add points. Returns `None` for a non-positive amount.
    pub async fn credit(&self, change: PointsChange) -> LoyaltyResult<Option<Mutation>> {
        if change.points <= 0 {
            debug!(
                account_id = change.account_id,
                points = change.points,
                "Ignoring non-positive credit"
            );
            return Ok(None);
        }

        let _timer = self.metrics.start_posting();
        let points = change.points;
        let plan = |current: &AccountBalance| {
            let balance = current.balance.checked_add(points)?;
            let lifetime_earned = current.lifetime_earned.checked_add(points)?;
            let next = AccountBalance {
                balance,
                lifetime_earned,
                ..*current
            };
            Some(Posting {
                balance: next,
                entry: change.entry(current.account_id, points, balance),
            })
        };

        let outcome = self.ledger.post(change.account_id, &plan).await?;
        let Some(entry) = outcome.entry else {
            warn!(
                account_id = change.account_id,
                points, "Credit would overflow the balance; nothing posted"
            );
            return Ok(Some(Mutation {
                balance: outcome.balance,
                points: 0,
                entry: None,
            }));
        };

        self.metrics.record_credit(points);
        debug!(
            account_id = change.account_id,
            order_ref = ?change.order_ref,
            entry_type = %change.entry_type,
            points,
            balance = outcome.balance.balance,
            "Points credited"
        );
        self.notifier.emit(Notification::Credited {
            account_id: change.account_id,
            points,
            entry_type: change.entry_type,
            balance: outcome.balance.balance,
            order_ref: change.order_ref,
        });

        Ok(Some(Mutation {
            balance: outcome.balance,
            points,
            entry: Some(entry),
        }))
    }

    /// Remove points, clamped to the current balance. Returns `None` for a
    /// non-positive amount; a clamp to zero writes nothing and reports 0 points.
    pub async fn debit(&self, change: PointsChange) -> LoyaltyResult<Option<Mutation>> {
        if change.points <= 0 {
            debug!(
                account_id = change.account_id,
                points = change.points,
                "Ignoring non-positive debit"
            );
            return Ok(None);
        }

        let _timer = self.metrics.start_posting();
        let requested = change.points;
        let plan = |current: &AccountBalance| {
            let applied = requested.min(current.balance);
            if applied <= 0 {
                return None;
            }
            let next = AccountBalance {
                balance: current.balance - applied,
                lifetime_spent: current.lifetime_spent.saturating_add(applied),
                ..*current
            };
            Some(Posting {
                balance: next,
                entry: change.entry(current.account_id, -applied, next.balance),
            })
        };

        let outcome = self.ledger.post(change.account_id, &plan).await?;
        let applied = outcome
            .entry
            .as_ref()
            .map(|e| -e.points_delta)
            .unwrap_or(0);
        self.metrics.record_debit(requested, applied);

        if applied == 0 {
            debug!(
                account_id = change.account_id,
                requested, "Debit clamped to zero; balance unchanged"
            );
            return Ok(Some(Mutation {
                balance: outcome.balance,
                points: 0,
                entry: None,
            }));
        }

        if applied < requested {
            debug!(
                account_id = change.account_id,
                requested, applied, "Debit clamped to available balance"
            );
        }
        debug!(
            account_id = change.account_id,
            order_ref = ?change.order_ref,
            entry_type = %change.entry_type,
            points = applied,
            balance = outcome.balance.balance,
            "Points debited"
        );
        self.notifier.emit(Notification::Debited {
            account_id: change.account_id,
            points: applied,
            entry_type: change.entry_type,
            balance: outcome.balance.balance,
            order_ref: change.order_ref,
        });

        Ok(Some(Mutation {
            balance: outcome.balance,
            points: applied,
            entry: outcome.entry,
        }))
    }

    /// Credit for a positive amount, debit for a negative one, nothing for zero
    pub async fn admin_adjust(
        &self,
        account_id: AccountId,
        signed_points: i64,
        reason: Option<&str>,
    ) -> LoyaltyResult<Option<Mutation>> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());

        let mutation = if signed_points > 0 {
            let description = reason.unwrap_or(ADMIN_ADD_REASON);
            self.credit(PointsChange::new(
                account_id,
                signed_points,
                EntryType::AdminAdd,
                description,
            ))
            .await?
        } else if signed_points < 0 {
            let points = signed_points
                .checked_abs()
                .ok_or(LoyaltyError::InvalidAmount(signed_points))?;
            let description = reason.unwrap_or(ADMIN_DEDUCT_REASON);
            self.debit(PointsChange::new(
                account_id,
                points,
                EntryType::AdminDeduct,
                description,
            ))
            .await?
        } else {
            return Ok(None);
        };

        if let Some(m) = &mutation {
            info!(
                account_id,
                requested = signed_points,
                applied = m.points,
                balance = m.new_balance(),
                "Admin balance adjustment"
            );
        }
        Ok(mutation)
    }

    /// Compare the cached balance with the ledger sum
    pub async fn verify_account(&self, account_id: AccountId) -> LoyaltyResult<BalanceVerification> {
        let stored = self.ledger.account(account_id).await?.balance;
        let ledger_sum = self.ledger.sum_by_account(account_id).await?;
        let drift = stored - ledger_sum;

        if drift != 0 {
            warn!(
                account_id,
                stored, ledger_sum, drift, "Balance does not match ledger"
            );
        }

        Ok(BalanceVerification {
            account_id,
            stored_balance: stored,
            ledger_sum,
            drift,
            consistent: drift == 0,
        })
    }

    /// Page of an account's history, newest first, plus the total entry count
    pub async fn history(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> LoyaltyResult<(Vec<LedgerEntry>, i64)> {
        let entries = self
            .ledger
            .entries_by_account(account_id, limit, offset)
            .await?;
        let total = self.ledger.count_by_account(account_id).await?;
        Ok((entries, total))
    }
}
