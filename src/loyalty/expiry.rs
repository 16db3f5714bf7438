// Points expiry
//
// Periodic sweep over earn entries older than the expiry window. Each source
// entry is resolved exactly once: either by an expire entry that references
// it, or by a resolution record when the account had nothing left to expire.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use utoipa::ToSchema;

use super::error::{LoyaltyError, LoyaltyResult};
use super::ledger::SOURCE_ENTRY_KEY;
use super::metrics::LoyaltyMetrics;
use super::notify::Notification;
use super::service::{PointsChange, PointsService};
use super::settings::LoyaltySettings;
use super::types::EntryType;
use super::LoyaltyEngine;

/// Paging limits for one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryOptions {
    pub batch_size: i64,
    pub max_batches: usize,
}

impl Default for ExpiryOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batches: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ExpiryReport {
    /// False when expiry is switched off
    pub ran: bool,
    pub cutoff: Option<DateTime<Utc>>,
    pub batches: usize,
    pub examined: usize,
    pub expired_entries: usize,
    pub expired_points: i64,
    /// Sources whose account balance had already been spent down to zero
    pub resolved_without_debit: usize,
}

/// One expiry run over a settings snapshot
pub struct ExpirySweep<'a> {
    settings: &'a LoyaltySettings,
    points: &'a PointsService,
    metrics: &'a LoyaltyMetrics,
    options: ExpiryOptions,
}

impl<'a> ExpirySweep<'a> {
    pub fn new(
        settings: &'a LoyaltySettings,
        points: &'a PointsService,
        metrics: &'a LoyaltyMetrics,
        options: ExpiryOptions,
    ) -> Self {
        Self {
            settings,
            points,
            metrics,
            options,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> LoyaltyResult<ExpiryReport> {
        if !self.settings.expiry_active() {
            debug!("Expiry disabled; sweep skipped");
            return Ok(ExpiryReport::default());
        }

        let _timer = self.metrics.start_expiry_sweep();
        let days = self.settings.effective_expiry_days();
        let cutoff = now.checked_sub_signed(Duration::days(days)).ok_or_else(|| {
            LoyaltyError::InvalidSettings(format!("expiry window of {days} days is out of range"))
        })?;
        let batch_size = self.options.batch_size.max(1);
        let ledger = self.points.ledger();

        let mut report = ExpiryReport {
            ran: true,
            cutoff: Some(cutoff),
            ..Default::default()
        };

        for _ in 0..self.options.max_batches {
            let batch = ledger.expirable_entries(cutoff, batch_size).await?;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;

            for entry in &batch {
                report.examined += 1;

                let change = PointsChange::new(
                    entry.account_id,
                    entry.points_delta,
                    EntryType::Expire,
                    format!(
                        "Points expired (earned {})",
                        entry.created_at.format("%Y-%m-%d")
                    ),
                )
                .with_metadata(json!({ SOURCE_ENTRY_KEY: entry.id }));

                let expired = self
                    .points
                    .debit(change)
                    .await?
                    .map(|m| m.points)
                    .unwrap_or(0);

                if expired > 0 {
                    report.expired_entries += 1;
                    report.expired_points += expired;
                    self.metrics.record_expired(expired);
                    self.points.notifier().emit(Notification::Expired {
                        account_id: entry.account_id,
                        source_entry_id: entry.id,
                        points: expired,
                    });
                } else {
                    ledger.resolve_expiry(entry.id).await?;
                    report.resolved_without_debit += 1;
                }
            }

            if (batch.len() as i64) < batch_size {
                break;
            }
        }

        info!(
            cutoff = %cutoff,
            batches = report.batches,
            examined = report.examined,
            expired_entries = report.expired_entries,
            expired_points = report.expired_points,
            resolved_without_debit = report.resolved_without_debit,
            "Expiry sweep finished"
        );
        Ok(report)
    }
}

const MIN_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Run the sweep every `every` (at least one second), starting one period after launch
pub fn spawn_expiry_scheduler(engine: Arc<LoyaltyEngine>, every: StdDuration) -> JoinHandle<()> {
    let every = every.max(MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match engine.process_expiry(Utc::now()).await {
                Ok(report) if report.ran => {
                    debug!(expired_points = report.expired_points, "Scheduled expiry done")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Scheduled expiry sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loyalty::ledger::{AccountBalance, NewLedgerEntry, Posting};
    use crate::loyalty::notify::Notifier;
    use crate::loyalty::store::{LedgerStore, MemoryLedgerStore};

    fn settings() -> LoyaltySettings {
        LoyaltySettings {
            expiry_enabled: true,
            expiry_days: 30,
            ..Default::default()
        }
    }

    fn service() -> PointsService {
        PointsService::new(
            Arc::new(MemoryLedgerStore::new()),
            Notifier::new(),
            LoyaltyMetrics::new(),
        )
    }

    async fn earn(service: &PointsService, account_id: i64, points: i64) -> i64 {
        service
            .credit(PointsChange::new(account_id, points, EntryType::Earn, "earned"))
            .await
            .unwrap()
            .unwrap()
            .entry
            .unwrap()
            .id
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + Duration::days(31)
    }

    #[tokio::test]
    async fn test_disabled_expiry_does_nothing() {
        let service = service();
        earn(&service, 1, 100).await;

        let report = ExpirySweep::new(
            &LoyaltySettings::default(),
            &service,
            &LoyaltyMetrics::new(),
            ExpiryOptions::default(),
        )
        .run(later())
        .await
        .unwrap();

        assert!(!report.ran);
        assert_eq!(service.get_balance(1).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_old_entry_expires_once() {
        let settings = settings();
        let service = service();
        let metrics = LoyaltyMetrics::new();
        let source = earn(&service, 1, 100).await;
        let sweep = ExpirySweep::new(&settings, &service, &metrics, ExpiryOptions::default());

        let report = sweep.run(later()).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired_entries, 1);
        assert_eq!(report.expired_points, 100);
        assert_eq!(service.get_balance(1).await.unwrap(), 0);

        let entries = service.ledger().entries_by_account(1, 10, 0).await.unwrap();
        assert_eq!(entries[0].entry_type, EntryType::Expire);
        assert_eq!(entries[0].source_entry_id(), Some(source));

        let again = sweep.run(later()).await.unwrap();
        assert_eq!(again.examined, 0);
        assert_eq!(metrics.summary().expired_points, 100);
    }

    #[tokio::test]
    async fn test_huge_expiry_window_does_not_panic() {
        let settings = LoyaltySettings {
            expiry_days: i64::MAX,
            ..settings()
        };
        let service = service();
        earn(&service, 1, 100).await;
        let metrics = LoyaltyMetrics::new();
        let sweep = ExpirySweep::new(&settings, &service, &metrics, ExpiryOptions::default());

        let report = sweep.run(Utc::now()).await.unwrap();
        assert!(report.ran);
        assert_eq!(report.expired_entries, 0);

        let err = sweep.run(DateTime::<Utc>::MIN_UTC).await.unwrap_err();
        assert_eq!(err.reason_code(), "invalid_settings");
        assert_eq!(service.get_balance(1).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_recent_entries_are_kept() {
        let settings = settings();
        let service = service();
        earn(&service, 1, 100).await;

        let report = ExpirySweep::new(&settings, &service, &LoyaltyMetrics::new(), ExpiryOptions::default())
            .run(Utc::now() + Duration::days(10))
            .await
            .unwrap();

        assert!(report.ran);
        assert_eq!(report.examined, 0);
        assert_eq!(service.get_balance(1).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_expiry_clamps_to_balance() {
        let settings = settings();
        let service = service();
        earn(&service, 1, 100).await;
        service.admin_adjust(1, -70, None).await.unwrap();

        let report = ExpirySweep::new(&settings, &service, &LoyaltyMetrics::new(), ExpiryOptions::default())
            .run(later())
            .await
            .unwrap();

        assert_eq!(report.expired_points, 30);
        assert_eq!(service.get_balance(1).await.unwrap(), 0);
        assert_eq!(service.verify_account(1).await.unwrap().drift, 0);
    }

    #[tokio::test]
    async fn test_zero_clamp_is_resolved_without_entry() {
        let settings = settings();
        let service = service();
        let metrics = LoyaltyMetrics::new();
        earn(&service, 1, 100).await;
        service.admin_adjust(1, -100, None).await.unwrap();
        let sweep = ExpirySweep::new(&settings, &service, &metrics, ExpiryOptions::default());

        let report = sweep.run(later()).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired_entries, 0);
        assert_eq!(report.resolved_without_debit, 1);
        assert_eq!(service.ledger().count_by_account(1).await.unwrap(), 2);

        let again = sweep.run(later()).await.unwrap();
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn test_batches_page_through_oldest_first() {
        let settings = settings();
        let service = service();
        for account in 1..=5 {
            earn(&service, account, 10).await;
        }
        let options = ExpiryOptions {
            batch_size: 2,
            max_batches: 10,
        };

        let report = ExpirySweep::new(&settings, &service, &LoyaltyMetrics::new(), options)
            .run(later())
            .await
            .unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.expired_entries, 5);
        for account in 1..=5 {
            assert_eq!(service.get_balance(account).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_max_batches_bounds_one_run() {
        let settings = settings();
        let service = service();
        for account in 1..=4 {
            earn(&service, account, 10).await;
        }
        let options = ExpiryOptions {
            batch_size: 1,
            max_batches: 2,
        };
        let metrics = LoyaltyMetrics::new();
        let sweep = ExpirySweep::new(&settings, &service, &metrics, options);

        assert_eq!(sweep.run(later()).await.unwrap().examined, 2);
        assert_eq!(sweep.run(later()).await.unwrap().examined, 2);
        assert_eq!(sweep.run(later()).await.unwrap().examined, 0);
    }

    #[tokio::test]
    async fn test_only_earn_entries_expire() {
        let settings = settings();
        let service = service();
        service.admin_adjust(1, 50, None).await.unwrap();

        // an old refund credit is not an earn entry
        let created_at = Utc::now() - Duration::days(400);
        let plan = |current: &AccountBalance| {
            let balance = AccountBalance {
                balance: current.balance + 5,
                lifetime_earned: current.lifetime_earned + 5,
                ..*current
            };
            Some(Posting {
                balance,
                entry: NewLedgerEntry {
                    account_id: 1,
                    order_ref: None,
                    points_delta: 5,
                    balance_after: balance.balance,
                    entry_type: EntryType::RefundReversal,
                    description: String::new(),
                    metadata: None,
                    created_at,
                },
            })
        };
        service.ledger().post(1, &plan).await.unwrap();

        let report = ExpirySweep::new(&settings, &service, &LoyaltyMetrics::new(), ExpiryOptions::default())
            .run(later())
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(service.get_balance(1).await.unwrap(), 55);
    }

    #[tokio::test]
    async fn test_scheduler_survives_zero_interval() {
        let engine = Arc::new(LoyaltyEngine::in_memory());
        let handle = spawn_expiry_scheduler(engine, StdDuration::ZERO);
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
