use serde::Deserialize;
use utoipa::IntoParams;

use crate::loyalty::ledger::{LedgerFilter, SortColumn, SortDirection};
use crate::loyalty::types::EntryType;

/// Columns selected for every ledger read
pub const LEDGER_COLUMNS: &str = "id, account_id, order_ref, points_delta, balance_after, \
     entry_type, description, metadata, created_at";

/// Largest page the admin listing returns
pub const MAX_PAGE_SIZE: u32 = 100;

/// A bound parameter for the ledger listing
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    BigInt(i64),
}

/// SQL query builder for the admin ledger listing
/// Builds parameterized SELECT and COUNT queries over `loyalty_ledger`
pub struct LedgerQueryBuilder {
    where_clauses: Vec<String>,
    params: Vec<BindValue>,
    order_clause: Option<String>,
    limit: i64,
    offset: i64,
}

impl Default for LedgerQueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerQueryBuilder {
    pub fn new() -> Self {
        Self {
            where_clauses: Vec::new(),
            params: Vec::new(),
            order_clause: None,
            limit: 20,
            offset: 0,
        }
    }

    /// Builder preloaded with every part of a filter
    pub fn from_filter(filter: &LedgerFilter) -> Self {
        let mut builder = Self::new();
        if let Some(entry_type) = filter.entry_type {
            builder.add_type_filter(entry_type);
        }
        if let Some(account_id) = filter.account_id {
            builder.add_account_filter(account_id);
        }
        builder.set_sort(filter.sort, filter.direction);
        builder.set_window(filter.limit, filter.offset);
        builder
    }

    pub fn add_type_filter(&mut self, entry_type: EntryType) {
        let param_index = self.params.len() + 1;
        self.where_clauses
            .push(format!("entry_type = ${}", param_index));
        self.params
            .push(BindValue::Text(entry_type.as_str().to_string()));
    }

    pub fn add_account_filter(&mut self, account_id: i64) {
        let param_index = self.params.len() + 1;
        self.where_clauses
            .push(format!("account_id = ${}", param_index));
        self.params.push(BindValue::BigInt(account_id));
    }

    /// Sort column comes from an allow-list, so it is safe to inline.
    /// `id` breaks ties in the same direction
    pub fn set_sort(&mut self, column: SortColumn, direction: SortDirection) {
        let dir = direction.as_sql();
        self.order_clause = Some(format!("{} {}, id {}", column.as_sql(), dir, dir));
    }

    pub fn set_window(&mut self, limit: i64, offset: i64) {
        self.limit = limit.max(0);
        self.offset = offset.max(0);
    }

    fn where_sql(&self) -> String {
        if self.where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.where_clauses.join(" AND "))
        }
    }

    /// Returns the listing query and its bind values
    pub fn build(&self) -> (String, Vec<BindValue>) {
        let mut query = format!("SELECT {} FROM loyalty_ledger", LEDGER_COLUMNS);
        query.push_str(&self.where_sql());

        if let Some(ref order) = self.order_clause {
            query.push_str(" ORDER BY ");
            query.push_str(order);
        }

        // LIMIT/OFFSET are validated integers, inlined like the sort column
        query.push_str(&format!(" LIMIT {} OFFSET {}", self.limit, self.offset));

        (query, self.params.clone())
    }

    /// Returns the COUNT query for the same filters
    pub fn build_count(&self) -> (String, Vec<BindValue>) {
        let query = format!("SELECT COUNT(*) FROM loyalty_ledger{}", self.where_sql());
        (query, self.params.clone())
    }
}

/// Query parameters of the admin ledger listing
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct LedgerQueryParams {
    /// Filter by entry type (earn, redeem, admin_add, admin_deduct, refund_reversal, expire)
    pub entry_type: Option<String>,
    /// Filter by account
    pub account_id: Option<i64>,
    /// created_at, points_delta, balance_after or account_id
    pub orderby: Option<String>,
    /// asc or desc
    pub order: Option<String>,
    /// 1-based page number
    pub page: Option<u32>,
    /// Page size, at most 100
    pub per_page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Query parameter validator
pub struct LedgerQueryValidator;

impl LedgerQueryValidator {
    /// Validates and normalizes listing parameters into a filter
    pub fn validate(params: LedgerQueryParams) -> Result<LedgerFilter, ValidationError> {
        let entry_type = match Self::normalize_string(params.entry_type) {
            Some(value) => Some(
                value
                    .to_lowercase()
                    .parse::<EntryType>()
                    .map_err(|message| ValidationError { message })?,
            ),
            None => None,
        };

        let sort = match Self::normalize_string(params.orderby) {
            Some(value) => value
                .to_lowercase()
                .parse::<SortColumn>()
                .map_err(|message| ValidationError { message })?,
            None => SortColumn::default(),
        };

        let direction = match Self::normalize_string(params.order) {
            Some(value) => value
                .parse::<SortDirection>()
                .map_err(|message| ValidationError { message })?,
            None => SortDirection::default(),
        };

        let page = params.page.unwrap_or(1);
        Self::validate_pagination_param(page, "page")?;

        let per_page = params.per_page.unwrap_or(20);
        Self::validate_pagination_param(per_page, "per_page")?;
        if per_page > MAX_PAGE_SIZE {
            return Err(ValidationError {
                message: format!("per_page must be at most {}", MAX_PAGE_SIZE),
            });
        }

        Ok(LedgerFilter {
            entry_type,
            account_id: params.account_id,
            sort,
            direction,
            limit: per_page as i64,
            offset: (page as i64 - 1) * per_page as i64,
        })
    }

    /// Trims whitespace; empty strings count as absent
    fn normalize_string(s: Option<String>) -> Option<String> {
        s.and_then(|s| {
            let trimmed = s.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
    }

    fn validate_pagination_param(value: u32, param_name: &str) -> Result<(), ValidationError> {
        if value == 0 {
            return Err(ValidationError {
                message: format!("{} must be a positive number (greater than 0)", param_name),
            });
        }
        Ok(())
    }
}
