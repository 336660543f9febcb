//! services/api/src/bin/api.rs

use api_lib::{
    adapters::PgRecordStore,
    config::{Config, StoreBackend},
    error::ApiError,
    web::{api_routes, rest::ApiDoc, state::AppState},
};
use axum::{
    http::{header::CONTENT_TYPE, HeaderName, Method},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use story_engine_core::engine::PopularSearches;
use story_engine_core::{Clock, Entitlements, EventRouter, MemoryStore, RecordStore, SystemClock};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

const POPULAR_FIRST_REFRESH: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Choose the Record Store ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn RecordStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| ApiError::Internal("DATABASE_URL is required".to_string()))?;
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(database_url)
                .await?;
            let pg_store = PgRecordStore::new(db_pool, clock.clone());
            info!("Running database migrations...");
            pg_store.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(pg_store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory record store; data is lost on restart.");
            Arc::new(MemoryStore::provisioned(clock.clone()))
        }
    };

    // --- 3. Wire the Engine ---
    let settings = Arc::new(config.engine_settings());
    let entitlements = Entitlements::new(
        store.clone(),
        clock.clone(),
        settings.premium_product_ids.clone(),
    );
    let popular = PopularSearches::new(store.clone());
    match config.popular_refresh_interval.to_std() {
        Ok(every) => {
            info!(
                "Refreshing popular searches every {}h",
                config.popular_refresh_interval.num_hours()
            );
            tokio::spawn(popular.clone().run_schedule(POPULAR_FIRST_REFRESH, every));
        }
        Err(e) => warn!("Popular search refresh disabled: {e}"),
    }
    let router = Arc::new(EventRouter::standard(store, clock, settings));

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        router,
        entitlements,
        popular,
        config: config.clone(),
    });

    // --- 5. Create the Web Router ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-device-id"),
            HeaderName::from_static("x-cron-secret"),
        ]);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_routes(app_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
