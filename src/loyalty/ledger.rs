// Ledger data model
// Immutable entries, the derived account balance and the posting protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use utoipa::ToSchema;

use super::error::LoyaltyError;
use super::types::EntryType;

pub type AccountId = i64;
pub type OrderRef = i64;

/// Metadata key an expire entry uses to point at the earn entry it consumes
pub const SOURCE_ENTRY_KEY: &str = "source_ledger_id";

/// One immutable signed point transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: AccountId,
    pub order_ref: Option<OrderRef>,
    /// Positive for credits, negative for debits, never zero
    pub points_delta: i64,
    /// Account balance right after this entry was applied
    pub balance_after: i64,
    pub entry_type: EntryType,
    pub description: String,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// For expire entries, the id of the earn entry being expired
    pub fn source_entry_id(&self) -> Option<i64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(SOURCE_ENTRY_KEY))
            .and_then(Value::as_i64)
    }
}

/// Raw ledger row as stored; `entry_type` is parsed on the way out
#[derive(Debug, FromRow)]
pub struct LedgerRow {
    pub id: i64,
    pub account_id: i64,
    pub order_ref: Option<i64>,
    pub points_delta: i64,
    pub balance_after: i64,
    pub entry_type: String,
    pub description: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = LoyaltyError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let entry_type = row
            .entry_type
            .parse::<EntryType>()
            .map_err(|e| LoyaltyError::CorruptEntry(format!("entry {}: {}", row.id, e)))?;

        Ok(LedgerEntry {
            id: row.id,
            account_id: row.account_id,
            order_ref: row.order_ref,
            points_delta: row.points_delta,
            balance_after: row.balance_after,
            entry_type,
            description: row.description,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

/// Entry about to be appended; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub account_id: AccountId,
    pub order_ref: Option<OrderRef>,
    pub points_delta: i64,
    pub balance_after: i64,
    pub entry_type: EntryType,
    pub description: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    pub fn into_entry(self, id: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            account_id: self.account_id,
            order_ref: self.order_ref,
            points_delta: self.points_delta,
            balance_after: self.balance_after,
            entry_type: self.entry_type,
            description: self.description,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

/// Per-account balance cache and lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub balance: i64,
    pub lifetime_earned: i64,
    pub lifetime_spent: i64,
}

impl AccountBalance {
    pub fn empty(account_id: AccountId) -> Self {
        Self {
            account_id,
            ..Default::default()
        }
    }
}

/// New account state plus the entry recording the change
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub balance: AccountBalance,
    pub entry: NewLedgerEntry,
}

impl Posting {
    /// Check that the posting is a consistent step from `current`
    pub fn check_against(&self, current: &AccountBalance) -> Result<(), LoyaltyError> {
        let delta = self.entry.points_delta;
        if delta == 0 {
            return Err(LoyaltyError::ConcurrencyAnomaly(
                "ledger entries must move points".to_string(),
            ));
        }
        if self.entry.account_id != current.account_id
            || self.balance.account_id != current.account_id
        {
            return Err(LoyaltyError::ConcurrencyAnomaly(format!(
                "posting for account {} applied to account {}",
                self.entry.account_id, current.account_id
            )));
        }
        if current.balance.checked_add(delta) != Some(self.balance.balance)
            || self.entry.balance_after != self.balance.balance
        {
            return Err(LoyaltyError::ConcurrencyAnomaly(format!(
                "balance {} + {} does not equal {}",
                current.balance, delta, self.balance.balance
            )));
        }
        if self.balance.balance < 0 {
            return Err(LoyaltyError::ConcurrencyAnomaly(format!(
                "balance would drop to {}",
                self.balance.balance
            )));
        }
        Ok(())
    }
}

/// Decides what to post given the locked current state; `None` posts nothing
pub type PostingPlan<'a> = dyn Fn(&AccountBalance) -> Option<Posting> + Send + Sync + 'a;

/// Result of running a posting plan
#[derive(Debug, Clone, PartialEq)]
pub struct PostingOutcome {
    pub balance: AccountBalance,
    pub entry: Option<LedgerEntry>,
}

/// Columns the admin listing may sort by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    #[default]
    CreatedAt,
    PointsDelta,
    BalanceAfter,
    AccountId,
}

impl SortColumn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortColumn::CreatedAt => "created_at",
            SortColumn::PointsDelta => "points_delta",
            SortColumn::BalanceAfter => "balance_after",
            SortColumn::AccountId => "account_id",
        }
    }
}

impl std::str::FromStr for SortColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(SortColumn::CreatedAt),
            "points_delta" => Ok(SortColumn::PointsDelta),
            "balance_after" => Ok(SortColumn::BalanceAfter),
            "account_id" | "user_id" => Ok(SortColumn::AccountId),
            _ => Err(format!("Invalid sort column: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(format!("Invalid sort direction: {}", s)),
        }
    }
}

/// Admin listing filters, sort and page window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerFilter {
    pub entry_type: Option<EntryType>,
    pub account_id: Option<AccountId>,
    pub sort: SortColumn,
    pub direction: SortDirection,
    pub limit: i64,
    pub offset: i64,
}

impl Default for LedgerFilter {
    fn default() -> Self {
        Self {
            entry_type: None,
            account_id: None,
            sort: SortColumn::default(),
            direction: SortDirection::default(),
            limit: 20,
            offset: 0,
        }
    }
}

impl LedgerFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.entry_type.map_or(true, |t| entry.entry_type == t)
            && self.account_id.map_or(true, |a| entry.account_id == a)
    }
}

/// Program-wide aggregates for the admin dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct SummaryStats {
    pub total_in_circulation: i64,
    pub earned_this_month: i64,
    pub redeemed_this_month: i64,
    pub expired_this_month: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_entry(account_id: AccountId, delta: i64, balance_after: i64) -> NewLedgerEntry {
        NewLedgerEntry {
            account_id,
            order_ref: None,
            points_delta: delta,
            balance_after,
            entry_type: EntryType::AdminAdd,
            description: String::new(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    fn posting(current: &AccountBalance, delta: i64) -> Posting {
        let balance = AccountBalance {
            balance: current.balance + delta,
            ..*current
        };
        Posting {
            balance,
            entry: new_entry(current.account_id, delta, balance.balance),
        }
    }

    #[test]
    fn test_source_entry_id() {
        let mut entry = new_entry(1, -5, 0).into_entry(9);
        assert_eq!(entry.source_entry_id(), None);

        entry.metadata = Some(json!({ "source_ledger_id": 4 }));
        assert_eq!(entry.source_entry_id(), Some(4));
    }

    #[test]
    fn test_row_with_unknown_type_is_corrupt() {
        let row = LedgerRow {
            id: 3,
            account_id: 1,
            order_ref: None,
            points_delta: 5,
            balance_after: 5,
            entry_type: "bonus".to_string(),
            description: String::new(),
            metadata: None,
            created_at: Utc::now(),
        };
        let err = LedgerEntry::try_from(row).unwrap_err();
        assert!(matches!(err, LoyaltyError::CorruptEntry(_)));
    }

    #[test]
    fn test_posting_check_accepts_consistent_step() {
        let current = AccountBalance {
            account_id: 1,
            balance: 50,
            ..Default::default()
        };
        assert!(posting(&current, 25).check_against(&current).is_ok());
        assert!(posting(&current, -50).check_against(&current).is_ok());
    }

    #[test]
    fn test_posting_check_rejects_inconsistent_steps() {
        let current = AccountBalance {
            account_id: 1,
            balance: 50,
            ..Default::default()
        };

        assert!(posting(&current, 0).check_against(&current).is_err());
        assert!(posting(&current, -51).check_against(&current).is_err());

        let mut stale = posting(&current, 10);
        stale.balance.balance = 70;
        stale.entry.balance_after = 70;
        assert!(stale.check_against(&current).is_err());

        let other = AccountBalance {
            account_id: 2,
            balance: 50,
            ..Default::default()
        };
        assert!(posting(&other, 10).check_against(&current).is_err());
    }

    #[test]
    fn test_sort_column_allow_list() {
        assert_eq!("points_delta".parse::<SortColumn>(), Ok(SortColumn::PointsDelta));
        assert_eq!("user_id".parse::<SortColumn>(), Ok(SortColumn::AccountId));
        assert!("description; DROP TABLE".parse::<SortColumn>().is_err());
        assert_eq!("ASC".parse::<SortDirection>(), Ok(SortDirection::Asc));
    }

    #[test]
    fn test_filter_matches() {
        let entry = new_entry(7, 10, 10).into_entry(1);
        let filter = LedgerFilter {
            account_id: Some(7),
            ..Default::default()
        };
        assert!(filter.matches(&entry));

        let filter = LedgerFilter {
            entry_type: Some(EntryType::Earn),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }
}
