// Order lifecycle
//
// Translates storefront order events into ledger mutations. Each order carries
// three guards (awarded, reversed, spent); a guard is claimed atomically
// before its mutation and released only if the mutation did not happen.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::calculator::{OrderTotals, PointsCalculator};
use super::error::LoyaltyResult;
use super::ledger::{AccountId, LedgerEntry, OrderRef};
use super::notify::Notification;
use super::service::{PointsChange, PointsService};
use super::store::{OrderGuard, OrderLoyaltyMeta, OrderMetaStore, RedemptionSessionStore};
use super::types::{AwardStatus, EntryType, OrderStatus};

/// The parts of an external order the loyalty program reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderSnapshot {
    pub order_ref: OrderRef,
    /// Display number; falls back to `order_ref`
    #[serde(default)]
    pub order_number: Option<String>,
    /// `None` for guest orders
    #[serde(default)]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub totals: OrderTotals,
}

impl OrderSnapshot {
    fn number(&self) -> String {
        self.order_number
            .clone()
            .unwrap_or_else(|| self.order_ref.to_string())
    }
}

/// Events the storefront delivers; duplicates are expected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    StatusChanged {
        order: OrderSnapshot,
        status: OrderStatus,
        #[serde(default)]
        session_id: Option<Uuid>,
    },
    CheckoutCreated {
        order: OrderSnapshot,
        #[serde(default)]
        session_id: Option<Uuid>,
    },
    PaymentComplete {
        order: OrderSnapshot,
        #[serde(default)]
        session_id: Option<Uuid>,
    },
}

impl OrderEvent {
    pub fn order(&self) -> &OrderSnapshot {
        match self {
            OrderEvent::StatusChanged { order, .. }
            | OrderEvent::CheckoutCreated { order, .. }
            | OrderEvent::PaymentComplete { order, .. } => order,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            OrderEvent::StatusChanged { session_id, .. }
            | OrderEvent::CheckoutCreated { session_id, .. }
            | OrderEvent::PaymentComplete { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    AwardPoints,
    ReversePoints,
    SavePendingRedemption,
    FinalizeRedemption,
}

/// Dispatch table from event to actions, in execution order
pub fn actions_for(event: &OrderEvent, award_on: AwardStatus) -> Vec<LifecycleAction> {
    match event {
        OrderEvent::StatusChanged { status, .. } => {
            let mut actions = Vec::new();
            // fallback for payment flows that never report completion
            if status.confirms_payment() {
                actions.push(LifecycleAction::FinalizeRedemption);
            }
            if *status == award_on.order_status() {
                actions.push(LifecycleAction::AwardPoints);
            }
            if status.is_reversal() {
                actions.push(LifecycleAction::ReversePoints);
            }
            actions
        }
        OrderEvent::CheckoutCreated { .. } => vec![LifecycleAction::SavePendingRedemption],
        OrderEvent::PaymentComplete { .. } => vec![LifecycleAction::FinalizeRedemption],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ProgramDisabled,
    GuestOrder,
    AlreadyAwarded,
    NoPoints,
    AlreadyReversed,
    AlreadyRedeemed,
    NothingToRedeem,
}

/// What one action did
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LifecycleOutcome {
    Awarded {
        points: i64,
        balance: i64,
    },
    Reversed {
        debited: i64,
        restored: i64,
    },
    PendingSaved {
        points: i64,
    },
    Redeemed {
        points: i64,
        discount: Decimal,
    },
    Skipped {
        action: LifecycleAction,
        reason: SkipReason,
    },
}

impl LifecycleOutcome {
    fn skipped(action: LifecycleAction, reason: SkipReason) -> Self {
        LifecycleOutcome::Skipped { action, reason }
    }
}

/// Runs lifecycle actions for one settings snapshot
pub struct OrderLifecycle<'a> {
    calculator: &'a PointsCalculator,
    points: &'a PointsService,
    orders: &'a dyn OrderMetaStore,
    sessions: &'a dyn RedemptionSessionStore,
}

impl<'a> OrderLifecycle<'a> {
    pub fn new(
        calculator: &'a PointsCalculator,
        points: &'a PointsService,
        orders: &'a dyn OrderMetaStore,
        sessions: &'a dyn RedemptionSessionStore,
    ) -> Self {
        Self {
            calculator,
            points,
            orders,
            sessions,
        }
    }

    pub async fn handle(&self, event: &OrderEvent) -> LoyaltyResult<Vec<LifecycleOutcome>> {
        let order = event.order();
        let actions = actions_for(event, self.calculator.settings().award_on_status);
        let mut outcomes = Vec::with_capacity(actions.len());

        for action in actions {
            let outcome = match action {
                LifecycleAction::AwardPoints => self.award_points(order).await,
                LifecycleAction::ReversePoints => self.reverse_points(order).await,
                LifecycleAction::SavePendingRedemption => {
                    self.save_pending_redemption(order, event.session_id()).await
                }
                LifecycleAction::FinalizeRedemption => {
                    self.finalize_redemption(order, event.session_id()).await
                }
            };

            match outcome {
                Ok(outcome) => {
                    if let LifecycleOutcome::Skipped { reason, .. } = outcome {
                        debug!(order_ref = order.order_ref, ?action, ?reason, "Lifecycle action skipped");
                    }
                    outcomes.push(outcome);
                }
                Err(e) => {
                    error!(order_ref = order.order_ref, ?action, error = %e, "Lifecycle action failed");
                    return Err(e);
                }
            }
        }

        Ok(outcomes)
    }

    /// Unawarded -> Awarded
    pub async fn award_points(&self, order: &OrderSnapshot) -> LoyaltyResult<LifecycleOutcome> {
        const ACTION: LifecycleAction = LifecycleAction::AwardPoints;

        if !self.calculator.settings().enabled {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::ProgramDisabled));
        }
        let Some(account_id) = order.account_id else {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::GuestOrder));
        };

        if self.orders.load(order.order_ref).await?.points_awarded {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::AlreadyAwarded));
        }

        let points = self.calculator.points_for_order(&order.totals);
        if points <= 0 {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::NoPoints));
        }

        if !self.orders.claim_award(order.order_ref, points).await? {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::AlreadyAwarded));
        }

        let change = PointsChange::new(
            account_id,
            points,
            EntryType::Earn,
            format!("Points earned for order #{}", order.number()),
        )
        .for_order(order.order_ref);

        let mutation = match self.points.credit(change).await {
            Ok(Some(mutation)) if mutation.points > 0 => mutation,
            Ok(_) => {
                self.release(order.order_ref, OrderGuard::Award).await;
                return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::NoPoints));
            }
            Err(e) => {
                self.release(order.order_ref, OrderGuard::Award).await;
                return Err(e);
            }
        };

        info!(
            account_id,
            order_ref = order.order_ref,
            points,
            balance = mutation.new_balance(),
            "Points awarded"
        );
        self.points.notifier().emit(Notification::Earned {
            account_id,
            order_ref: order.order_ref,
            points,
        });

        Ok(LifecycleOutcome::Awarded {
            points,
            balance: mutation.new_balance(),
        })
    }

    /// Awarded/Finalized -> Reversed
    pub async fn reverse_points(&self, order: &OrderSnapshot) -> LoyaltyResult<LifecycleOutcome> {
        const ACTION: LifecycleAction = LifecycleAction::ReversePoints;

        let Some(account_id) = order.account_id else {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::GuestOrder));
        };

        if self.orders.load(order.order_ref).await?.points_reversed {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::AlreadyReversed));
        }
        if !self.orders.claim_reversal(order.order_ref).await? {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::AlreadyReversed));
        }

        // reload after the claim so a concurrent award or redemption is seen
        let meta = match self.orders.load(order.order_ref).await {
            Ok(meta) => meta,
            Err(e) => {
                self.release(order.order_ref, OrderGuard::Reversal).await;
                return Err(e);
            }
        };

        match self.reversal_postings(account_id, order, &meta).await {
            Ok((debited, restored)) => {
                info!(
                    account_id,
                    order_ref = order.order_ref,
                    debited,
                    restored,
                    "Order points reversed"
                );
                Ok(LifecycleOutcome::Reversed { debited, restored })
            }
            Err(e) => {
                // steps already posted are found in the ledger on retry
                self.release(order.order_ref, OrderGuard::Reversal).await;
                Err(e)
            }
        }
    }

    /// Post whichever reversal steps the order's ledger does not show yet
    async fn reversal_postings(
        &self,
        account_id: AccountId,
        order: &OrderSnapshot,
        meta: &OrderLoyaltyMeta,
    ) -> LoyaltyResult<(i64, i64)> {
        let number = order.number();
        let prior: Vec<LedgerEntry> = self
            .points
            .ledger()
            .entries_by_order(order.order_ref)
            .await?
            .into_iter()
            .filter(|e| e.entry_type == EntryType::RefundReversal)
            .collect();
        let prior_debit = prior.iter().find(|e| e.points_delta < 0);
        let prior_credit = prior.iter().find(|e| e.points_delta > 0);

        let mut debited = 0;
        if let Some(entry) = prior_debit {
            debited = entry.points_delta.saturating_abs();
        } else if let Some(earned) = meta.points_earned.filter(|p| *p > 0) {
            let change = PointsChange::new(
                account_id,
                earned,
                EntryType::RefundReversal,
                format!("Points reversed for cancelled/refunded order #{number}"),
            )
            .for_order(order.order_ref);
            debited = self
                .points
                .debit(change)
                .await?
                .map(|m| m.points)
                .unwrap_or(0);
        }

        let mut restored = 0;
        if let Some(entry) = prior_credit {
            restored = entry.points_delta;
        } else if let Some(spent) = meta.points_spent.filter(|p| *p > 0) {
            let change = PointsChange::new(
                account_id,
                spent,
                EntryType::RefundReversal,
                format!("Points restored for cancelled/refunded order #{number}"),
            )
            .for_order(order.order_ref);
            restored = self
                .points
                .credit(change)
                .await?
                .map(|m| m.points)
                .unwrap_or(0);
        }

        Ok((debited, restored))
    }

    /// Persist the session earmark on the order so finalisation survives session loss
    pub async fn save_pending_redemption(
        &self,
        order: &OrderSnapshot,
        session_id: Option<Uuid>,
    ) -> LoyaltyResult<LifecycleOutcome> {
        const ACTION: LifecycleAction = LifecycleAction::SavePendingRedemption;

        let Some(account_id) = order.account_id else {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::GuestOrder));
        };

        let points = self.session_points(account_id, session_id).await?;
        if points <= 0 {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::NothingToRedeem));
        }

        self.orders.save_pending_redeem(order.order_ref, points).await?;
        debug!(
            account_id,
            order_ref = order.order_ref,
            points, "Pending redemption saved on order"
        );
        Ok(LifecycleOutcome::PendingSaved { points })
    }

    /// Pending-redeem -> Finalized
    pub async fn finalize_redemption(
        &self,
        order: &OrderSnapshot,
        session_id: Option<Uuid>,
    ) -> LoyaltyResult<LifecycleOutcome> {
        const ACTION: LifecycleAction = LifecycleAction::FinalizeRedemption;

        let Some(account_id) = order.account_id else {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::GuestOrder));
        };

        // the spent guard is checked before any session read
        let meta = self.orders.load(order.order_ref).await?;
        if meta.points_spent.is_some() {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::AlreadyRedeemed));
        }

        let from_session = self.session_points(account_id, session_id).await?;
        let points = if from_session > 0 {
            from_session
        } else {
            meta.pending_redeem_points.unwrap_or(0)
        };
        if points <= 0 {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::NothingToRedeem));
        }

        if !self.orders.claim_redemption(order.order_ref, points).await? {
            return Ok(LifecycleOutcome::skipped(ACTION, SkipReason::AlreadyRedeemed));
        }

        let change = PointsChange::new(
            account_id,
            points,
            EntryType::Redeem,
            format!("Points redeemed on order #{}", order.number()),
        )
        .for_order(order.order_ref);

        let applied = match self.points.debit(change).await {
            Ok(mutation) => mutation.map(|m| m.points).unwrap_or(0),
            Err(e) => {
                self.release(order.order_ref, OrderGuard::Redemption).await;
                return Err(e);
            }
        };

        let discount = self.calculator.discount_for_points(applied);
        self.orders
            .record_spent(order.order_ref, applied, discount)
            .await?;

        if let Some(session_id) = session_id {
            if from_session > 0 {
                self.sessions.clear(session_id).await?;
            }
        }

        info!(
            account_id,
            order_ref = order.order_ref,
            requested = points,
            applied,
            %discount,
            "Redemption finalized"
        );
        self.points.notifier().emit(Notification::Redeemed {
            account_id,
            order_ref: order.order_ref,
            points: applied,
            discount,
        });

        Ok(LifecycleOutcome::Redeemed {
            points: applied,
            discount,
        })
    }

    async fn session_points(
        &self,
        account_id: AccountId,
        session_id: Option<Uuid>,
    ) -> LoyaltyResult<i64> {
        let Some(session_id) = session_id else {
            return Ok(0);
        };
        Ok(self
            .sessions
            .get(session_id)
            .await?
            .filter(|s| s.account_id == account_id)
            .map(|s| s.points)
            .unwrap_or(0))
    }

    async fn release(&self, order_ref: OrderRef, guard: OrderGuard) {
        if let Err(e) = self.orders.release(order_ref, guard).await {
            error!(order_ref, ?guard, error = %e, "Failed to release order guard");
        }
    }
}
