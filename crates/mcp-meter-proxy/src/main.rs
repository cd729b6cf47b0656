use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_meter_proxy::{
    config::ProxyConfig, db::Database, metrics::register_metrics, routes, sessions,
    state::AppState,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = ProxyConfig::from_env().expect("Failed to load configuration");
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();
    let rate_limit_rpm = config.rate_limit_rpm;

    tracing::info!("Starting mcp-meter-proxy on port {}", port);
    tracing::info!("Settlement rail: {}", config.settlement_url);
    tracing::info!("Funding wallet: {}", config.settlement_source_address);
    tracing::info!(
        "Currency: {} ({} minor decimals)",
        config.currency.code,
        config.currency.minor_decimals
    );
    tracing::info!("Public base URL: {}", config.public_base_url);

    // Initialize database
    let db = Database::new(&config.db_path).expect("Failed to initialize database");
    tracing::info!("Database initialized at: {}", config.db_path);

    // Register Prometheus metrics
    register_metrics();

    // Create shared state
    let state = AppState::new(config, db).expect("Failed to build application state");

    // Sessions expire even for providers nobody calls again
    if sessions::start_expiry_task(state.sessions.clone()).is_some() {
        tracing::info!("Session expiry enabled: {:?}", state.config.session_ttl);
    }

    let state_data = web::Data::new(state);

    // Configure rate limiter
    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm as u64)
        .finish()
        .expect("Failed to create rate limiter config");

    // Start HTTP server
    HttpServer::new(move || {
        let cors = mcp_meter_proxy::cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .app_data(web::PayloadConfig::new(10 * 1024 * 1024)) // 10MB body limit
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Governor::new(&governor_conf))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
