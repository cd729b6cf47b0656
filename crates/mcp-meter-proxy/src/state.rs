use crate::config::ProxyConfig;
use crate::db::Database;
use crate::error::ProxyError;
use crate::forwarder::StreamTracker;
use crate::gate::PaymentGate;
use crate::sessions::SessionDirectory;
use mcp_meter::{HttpSettlementClient, SettlementClient};
use std::sync::Arc;
use std::time::Duration;

/// Connect timeout for long-lived stream relays; they have no total deadline.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub db: Arc<Database>,
    pub sessions: SessionDirectory,
    pub settlement: Arc<dyn SettlementClient>,
    pub gate: PaymentGate,
    /// Unary upstream calls: total deadline, no redirects
    pub http_client: reqwest::Client,
    /// Server-push relays: connect deadline only
    pub stream_client: reqwest::Client,
    pub streams: StreamTracker,
}

impl AppState {
    /// State wired to the configured HTTP settlement rail.
    pub fn new(config: ProxyConfig, db: Database) -> Result<Self, ProxyError> {
        // The deadline lives on the settlement client so an expiry always
        // surfaces as SettlementError::Timeout
        let rail_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to create rail client: {e}")))?;
        let settlement = Arc::new(
            HttpSettlementClient::new(
                rail_client,
                &config.settlement_url,
                &config.settlement_api_key,
                config.settlement_signing_secret.clone(),
            )
            .with_timeout(config.settlement_timeout),
        );
        Self::with_settlement(config, db, settlement)
    }

    pub fn with_settlement(
        config: ProxyConfig,
        db: Database,
        settlement: Arc<dyn SettlementClient>,
    ) -> Result<Self, ProxyError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none()) // Prevent SSRF via redirects
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to create HTTP client: {e}")))?;

        let stream_client = reqwest::Client::builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to create stream client: {e}")))?;

        let db = Arc::new(db);
        let gate = PaymentGate::new(
            db.clone(),
            settlement.clone(),
            &config.settlement_source_address,
            config.currency.clone(),
            config.settlement_timeout,
        );

        Ok(Self {
            sessions: SessionDirectory::new(config.session_ttl),
            config: Arc::new(config),
            db,
            settlement,
            gate,
            http_client,
            stream_client,
            streams: StreamTracker::default(),
        })
    }
}
