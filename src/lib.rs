// Loyalty points ledger service
// Append-only points ledger with a locked balance cache, exposed over axum

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod loyalty;
pub mod query;
pub mod validation;


use std::sync::Arc;

use axum::{
    extract::FromRef,
    middleware,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use auth::{require_admin, TokenService};
use loyalty::handlers;
use loyalty::LoyaltyEngine;

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        handlers::get_balance,
        handlers::get_own_ledger,
        handlers::estimate_points,
        handlers::get_redemption_preview,
        handlers::apply_points,
        handlers::remove_points,
        handlers::handle_order_event,
        handlers::list_ledger,
        handlers::ledger_by_order,
        handlers::ledger_summary,
        handlers::get_account,
        handlers::adjust_account,
        handlers::run_expiry,
        handlers::get_settings,
        handlers::update_settings,
        handlers::get_metrics,
        handlers::purge_all,
    ),
    components(
        schemas(
            HealthResponse,
            loyalty::AccountBalance,
            loyalty::AccountOverview,
            loyalty::BalanceVerification,
            loyalty::LedgerEntry,
            loyalty::EntryType,
            loyalty::SummaryStats,
            loyalty::AppliedRedemption,
            loyalty::RedemptionPreview,
            loyalty::PointsEstimate,
            loyalty::ExpiryReport,
            loyalty::LoyaltySettings,
            loyalty::SettingsUpdate,
            loyalty::AwardStatus,
            loyalty::RoundingMode,
            loyalty::OrderStatus,
            loyalty::OrderEvent,
            loyalty::OrderSnapshot,
            loyalty::OrderTotals,
            loyalty::LifecycleOutcome,
            loyalty::lifecycle::LifecycleAction,
            loyalty::lifecycle::SkipReason,
            loyalty::metrics::MetricsSummary,
            handlers::LedgerEntryResponse,
            handlers::LedgerPage,
            handlers::ApplyPointsRequest,
            handlers::RemovePointsResponse,
            handlers::EventResponse,
            handlers::AdjustRequest,
            handlers::AdjustResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "loyalty", description = "Customer balance, history and cart redemption"),
        (name = "integration", description = "Order events from the storefront"),
        (name = "admin", description = "Ledger administration and settings")
    ),
    info(
        title = "Loyalty Ledger API",
        version = "1.0.0",
        description = "Points earning, redemption, reversal and expiry over an append-only ledger"
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LoyaltyEngine>,
    pub tokens: Arc<TokenService>,
}

impl FromRef<AppState> for Arc<TokenService> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Handler for GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "loyalty"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Creates and configures the application router
/// Maps all API endpoints to their handlers and adds CORS and tracing middleware
pub fn create_router(state: AppState) -> Router {
    // Configure CORS to allow all origins, methods, and headers
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin = Router::new()
        .route("/api/loyalty/events", post(handlers::handle_order_event))
        .route("/api/admin/ledger", get(handlers::list_ledger))
        .route(
            "/api/admin/ledger/orders/:order_ref",
            get(handlers::ledger_by_order),
        )
        .route("/api/admin/ledger/summary", get(handlers::ledger_summary))
        .route("/api/admin/accounts/:account_id", get(handlers::get_account))
        .route(
            "/api/admin/accounts/:account_id/adjust",
            post(handlers::adjust_account),
        )
        .route("/api/admin/expiry/run", post(handlers::run_expiry))
        .route("/api/admin/settings", get(handlers::get_settings))
        .route("/api/admin/settings", put(handlers::update_settings))
        .route("/api/admin/metrics", get(handlers::get_metrics))
        .route("/api/admin/purge", post(handlers::purge_all))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            require_admin,
        ));

    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health))
        .route("/api/loyalty/balance", get(handlers::get_balance))
        .route("/api/loyalty/ledger", get(handlers::get_own_ledger))
        .route("/api/loyalty/estimate", get(handlers::estimate_points))
        .route("/api/loyalty/redemption", get(handlers::get_redemption_preview))
        .route("/api/loyalty/redemption", post(handlers::apply_points))
        .route(
            "/api/loyalty/redemption/:session_id",
            delete(handlers::remove_points),
        )
        .merge(admin)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
