// HTTP handlers for the loyalty API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthenticatedAccount;
use crate::error::ApiError;
use crate::loyalty::metrics::MetricsSummary;
use crate::loyalty::{
    AccountBalance, AccountId, AccountOverview, AppliedRedemption, ExpiryReport, LedgerEntry,
    LifecycleOutcome, LoyaltySettings, OrderEvent, OrderRef, PointsEstimate, RedemptionPreview,
    SettingsUpdate, SummaryStats,
};
use crate::query::{LedgerQueryParams, LedgerQueryValidator};
use crate::validation::{check_field, validate_non_negative_amount};
use crate::AppState;

/// Ledger entry with its display label
#[derive(Debug, Serialize, ToSchema)]
pub struct LedgerEntryResponse {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    pub type_label: String,
}

impl From<LedgerEntry> for LedgerEntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            type_label: entry.entry_type.label().to_string(),
            entry,
        }
    }
}

fn to_responses(entries: Vec<LedgerEntry>) -> Vec<LedgerEntryResponse> {
    entries.into_iter().map(LedgerEntryResponse::from).collect()
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntryResponse>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Default, Deserialize, Validate, IntoParams)]
pub struct PageParams {
    /// 1-based page number, at most 1000000
    #[validate(range(min = 1, max = 1000000))]
    pub page: Option<i64>,
    /// Page size, at most 100
    #[validate(range(min = 1, max = 100))]
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct EstimateParams {
    /// Cart or product amount
    #[param(value_type = String)]
    pub amount: Decimal,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PreviewParams {
    pub session_id: Option<Uuid>,
    #[param(value_type = String)]
    pub cart_subtotal: Decimal,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyPointsRequest {
    pub session_id: Uuid,
    pub cart_subtotal: Decimal,
    pub points: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RemovePointsResponse {
    pub removed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EventResponse {
    pub outcomes: Vec<LifecycleOutcome>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AdjustRequest {
    /// Positive to add, negative to deduct
    pub points: i64,
    #[validate(length(max = 255))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdjustResponse {
    /// Points actually moved; a deduction is clamped to the balance
    pub applied: i64,
    pub balance: i64,
    pub entry: Option<LedgerEntryResponse>,
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}

/// Handler for GET /api/loyalty/balance
#[utoipa::path(
    get,
    path = "/api/loyalty/balance",
    responses(
        (status = 200, description = "Current balance and lifetime counters", body = AccountBalance),
        (status = 401, description = "Missing or invalid token", body = String, example = json!({"error_code": "unauthorized", "message": "Missing authentication token"}))
    ),
    security(("bearer_auth" = [])),
    tag = "loyalty"
)]
pub async fn get_balance(
    State(state): State<AppState>,
    account: AuthenticatedAccount,
) -> Result<Json<AccountBalance>, ApiError> {
    tracing::debug!("Fetching balance for account {}", account.account_id);
    let balance = state.engine.points().account(account.account_id).await?;
    Ok(Json(balance))
}

/// Handler for GET /api/loyalty/ledger
#[utoipa::path(
    get,
    path = "/api/loyalty/ledger",
    params(PageParams),
    responses(
        (status = 200, description = "Own ledger, newest first", body = LedgerPage),
        (status = 400, description = "Invalid pagination", body = String, example = json!({"error_code": "validation_error", "message": "Validation failed"}))
    ),
    security(("bearer_auth" = [])),
    tag = "loyalty"
)]
pub async fn get_own_ledger(
    State(state): State<AppState>,
    account: AuthenticatedAccount,
    Query(params): Query<PageParams>,
) -> Result<Json<LedgerPage>, ApiError> {
    params.validate()?;
    let page = params.page.unwrap_or(1);
    let per_page = params.per_page.unwrap_or(20);

    let (entries, total) = state
        .engine
        .points()
        .history(account.account_id, per_page, (page - 1).saturating_mul(per_page))
        .await?;

    Ok(Json(LedgerPage {
        entries: to_responses(entries),
        total,
        page,
        per_page,
    }))
}

/// Handler for GET /api/loyalty/estimate
/// Open to guests; never fails for a valid amount
#[utoipa::path(
    get,
    path = "/api/loyalty/estimate",
    params(EstimateParams),
    responses(
        (status = 200, description = "Points the amount would earn", body = PointsEstimate),
        (status = 400, description = "Negative amount", body = String, example = json!({"error_code": "validation_error", "message": "Validation failed"}))
    ),
    tag = "loyalty"
)]
pub async fn estimate_points(
    State(state): State<AppState>,
    Query(params): Query<EstimateParams>,
) -> Result<Json<PointsEstimate>, ApiError> {
    check_field("amount", &params.amount, validate_non_negative_amount)?;
    Ok(Json(state.engine.estimate(params.amount).await?))
}

/// Handler for GET /api/loyalty/redemption
#[utoipa::path(
    get,
    path = "/api/loyalty/redemption",
    params(PreviewParams),
    responses(
        (status = 200, description = "Redemption limits for this cart", body = RedemptionPreview)
    ),
    security(("bearer_auth" = [])),
    tag = "loyalty"
)]
pub async fn get_redemption_preview(
    State(state): State<AppState>,
    account: AuthenticatedAccount,
    Query(params): Query<PreviewParams>,
) -> Result<Json<RedemptionPreview>, ApiError> {
    check_field("cart_subtotal", &params.cart_subtotal, validate_non_negative_amount)?;
    let preview = state
        .engine
        .redemption_preview(account.account_id, params.session_id, params.cart_subtotal)
        .await?;
    Ok(Json(preview))
}

/// Handler for POST /api/loyalty/redemption
#[utoipa::path(
    post,
    path = "/api/loyalty/redemption",
    request_body = ApplyPointsRequest,
    responses(
        (status = 200, description = "Points earmarked and discount applied", body = AppliedRedemption),
        (status = 400, description = "Rejected with a reason code", body = String, example = json!({"error_code": "below_minimum", "message": "Minimum 100 points required to redeem."})),
        (status = 403, description = "Redemption disabled", body = String, example = json!({"error_code": "feature_disabled", "message": "Loyalty redemption is disabled"}))
    ),
    security(("bearer_auth" = [])),
    tag = "loyalty"
)]
pub async fn apply_points(
    State(state): State<AppState>,
    account: AuthenticatedAccount,
    Json(request): Json<ApplyPointsRequest>,
) -> Result<Json<AppliedRedemption>, ApiError> {
    check_field("cart_subtotal", &request.cart_subtotal, validate_non_negative_amount)?;
    let applied = state
        .engine
        .apply_points(
            Some(account.account_id),
            request.session_id,
            request.cart_subtotal,
            request.points,
        )
        .await?;
    Ok(Json(applied))
}

/// Handler for DELETE /api/loyalty/redemption/:session_id
#[utoipa::path(
    delete,
    path = "/api/loyalty/redemption/{session_id}",
    params(
        ("session_id" = Uuid, Path, description = "Shopping session")
    ),
    responses(
        (status = 200, description = "Earmark cleared (idempotent)", body = RemovePointsResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "loyalty"
)]
pub async fn remove_points(
    State(state): State<AppState>,
    account: AuthenticatedAccount,
    Path(session_id): Path<Uuid>,
) -> Result<Json<RemovePointsResponse>, ApiError> {
    let removed = state
        .engine
        .remove_points(account.account_id, session_id)
        .await?;
    Ok(Json(RemovePointsResponse { removed }))
}

/// Handler for POST /api/loyalty/events
/// Storefront integration entry point; duplicates are harmless
#[utoipa::path(
    post,
    path = "/api/loyalty/events",
    request_body = OrderEvent,
    responses(
        (status = 200, description = "What each triggered action did", body = EventResponse),
        (status = 403, description = "Admin role required", body = String, example = json!({"error_code": "forbidden", "message": "Insufficient permissions: required role 'admin'"}))
    ),
    security(("bearer_auth" = [])),
    tag = "integration"
)]
pub async fn handle_order_event(
    State(state): State<AppState>,
    Json(event): Json<OrderEvent>,
) -> Result<Json<EventResponse>, ApiError> {
    let outcomes = state.engine.handle_order_event(&event).await?;
    Ok(Json(EventResponse { outcomes }))
}

/// Handler for GET /api/admin/ledger
#[utoipa::path(
    get,
    path = "/api/admin/ledger",
    params(LedgerQueryParams),
    responses(
        (status = 200, description = "Filtered ledger listing", body = LedgerPage),
        (status = 400, description = "Invalid filter or sort", body = String, example = json!({"error_code": "bad_request", "message": "Invalid sort column"}))
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn list_ledger(
    State(state): State<AppState>,
    Query(params): Query<LedgerQueryParams>,
) -> Result<Json<LedgerPage>, ApiError> {
    let filter = LedgerQueryValidator::validate(params).map_err(|e| {
        tracing::warn!("Invalid ledger query: {}", e);
        ApiError::BadRequest(e.message)
    })?;

    let ledger = state.engine.ledger();
    let entries = ledger.list(&filter).await?;
    let total = ledger.count(&filter).await?;

    Ok(Json(LedgerPage {
        entries: to_responses(entries),
        total,
        page: filter.offset / filter.limit + 1,
        per_page: filter.limit,
    }))
}

/// Handler for GET /api/admin/ledger/orders/:order_ref
#[utoipa::path(
    get,
    path = "/api/admin/ledger/orders/{order_ref}",
    params(
        ("order_ref" = i64, Path, description = "External order reference")
    ),
    responses(
        (status = 200, description = "Entries for the order, oldest first", body = Vec<LedgerEntryResponse>)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn ledger_by_order(
    State(state): State<AppState>,
    Path(order_ref): Path<OrderRef>,
) -> Result<Json<Vec<LedgerEntryResponse>>, ApiError> {
    let entries = state.engine.ledger().entries_by_order(order_ref).await?;
    Ok(Json(to_responses(entries)))
}

/// Handler for GET /api/admin/ledger/summary
#[utoipa::path(
    get,
    path = "/api/admin/ledger/summary",
    responses(
        (status = 200, description = "Circulation and this month's totals", body = SummaryStats)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn ledger_summary(
    State(state): State<AppState>,
) -> Result<Json<SummaryStats>, ApiError> {
    let since = start_of_month(Utc::now());
    Ok(Json(state.engine.ledger().summary(since).await?))
}

/// Handler for GET /api/admin/accounts/:account_id
#[utoipa::path(
    get,
    path = "/api/admin/accounts/{account_id}",
    params(
        ("account_id" = i64, Path, description = "Loyalty account")
    ),
    responses(
        (status = 200, description = "Balance with ledger verification", body = AccountOverview)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
) -> Result<Json<AccountOverview>, ApiError> {
    Ok(Json(state.engine.account_overview(account_id).await?))
}

/// Handler for POST /api/admin/accounts/:account_id/adjust
#[utoipa::path(
    post,
    path = "/api/admin/accounts/{account_id}/adjust",
    params(
        ("account_id" = i64, Path, description = "Loyalty account")
    ),
    request_body = AdjustRequest,
    responses(
        (status = 200, description = "Adjustment applied", body = AdjustResponse),
        (status = 400, description = "Invalid input data", body = String, example = json!({"error_code": "validation_error", "message": "Validation failed"}))
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn adjust_account(
    State(state): State<AppState>,
    admin: AuthenticatedAccount,
    Path(account_id): Path<AccountId>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<AdjustResponse>, ApiError> {
    request.validate()?;
    tracing::info!(
        "Admin {} adjusting account {} by {}",
        admin.account_id,
        account_id,
        request.points
    );

    let mutation = state
        .engine
        .admin_adjust(account_id, request.points, request.reason.as_deref())
        .await?;

    let response = match mutation {
        Some(mutation) => AdjustResponse {
            applied: mutation.points,
            balance: mutation.new_balance(),
            entry: mutation.entry.map(LedgerEntryResponse::from),
        },
        None => AdjustResponse {
            applied: 0,
            balance: state.engine.points().get_balance(account_id).await?,
            entry: None,
        },
    };
    Ok(Json(response))
}

/// Handler for POST /api/admin/expiry/run
#[utoipa::path(
    post,
    path = "/api/admin/expiry/run",
    responses(
        (status = 200, description = "Sweep report", body = ExpiryReport)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn run_expiry(State(state): State<AppState>) -> Result<Json<ExpiryReport>, ApiError> {
    Ok(Json(state.engine.process_expiry(Utc::now()).await?))
}

/// Handler for GET /api/admin/settings
#[utoipa::path(
    get,
    path = "/api/admin/settings",
    responses(
        (status = 200, description = "Current settings", body = LoyaltySettings)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_settings(
    State(state): State<AppState>,
) -> Result<Json<LoyaltySettings>, ApiError> {
    let settings = state.engine.settings().await?;
    Ok(Json(settings.as_ref().clone()))
}

/// Handler for PUT /api/admin/settings
#[utoipa::path(
    put,
    path = "/api/admin/settings",
    request_body = SettingsUpdate,
    responses(
        (status = 200, description = "Settings saved", body = LoyaltySettings),
        (status = 400, description = "Invalid settings", body = String, example = json!({"error_code": "invalid_settings", "message": "Invalid settings: redeem_max_percent"}))
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<LoyaltySettings>, ApiError> {
    let saved = state.engine.save_settings(update).await?;
    Ok(Json(saved.as_ref().clone()))
}

/// Handler for GET /api/admin/metrics
#[utoipa::path(
    get,
    path = "/api/admin/metrics",
    responses(
        (status = 200, description = "Ledger and cache counters", body = MetricsSummary)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSummary> {
    Json(state.engine.metrics().summary())
}

/// Handler for POST /api/admin/purge
/// Deletes all loyalty data
#[utoipa::path(
    post,
    path = "/api/admin/purge",
    responses(
        (status = 204, description = "All loyalty data deleted")
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn purge_all(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    tracing::warn!("Purging all loyalty data");
    state.engine.purge_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_of_month() {
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 15, 42, 7).unwrap();
        assert_eq!(
            start_of_month(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_entry_response_carries_label() {
        let entry = LedgerEntry {
            id: 1,
            account_id: 2,
            order_ref: None,
            points_delta: -5,
            balance_after: 0,
            entry_type: crate::loyalty::EntryType::RefundReversal,
            description: String::new(),
            metadata: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(LedgerEntryResponse::from(entry)).unwrap();
        assert_eq!(json["type_label"], "Refund/Cancel");
        assert_eq!(json["entry_type"], "refund_reversal");
        assert_eq!(json["points_delta"], -5);
    }
}
