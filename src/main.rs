use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use loyalty_ledger::auth::TokenService;
use loyalty_ledger::config::AppConfig;
use loyalty_ledger::loyalty::{spawn_expiry_scheduler, LoyaltyEngine};
use loyalty_ledger::{create_router, db, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loyalty_ledger=info,tower_http=info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    tracing::info!("Loyalty Ledger - Starting...");

    let config = AppConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let engine = Arc::new(LoyaltyEngine::postgres(pool).with_expiry_options(config.expiry_options()));

    let _scheduler = spawn_expiry_scheduler(engine.clone(), config.expiry_interval);
    tracing::info!(
        "Expiry sweep scheduled every {}s",
        config.expiry_interval.as_secs()
    );

    let state = AppState {
        engine: engine.clone(),
        tokens: Arc::new(TokenService::new(&config.jwt_secret)),
    };
    let app = create_router(state);

    let addr = config.addr();
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    engine.metrics().log_summary();
    Ok(())
}
