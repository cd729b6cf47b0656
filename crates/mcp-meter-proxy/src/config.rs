use mcp_meter::{Currency, DEFAULT_CURRENCY, DEFAULT_MINOR_DECIMALS};
use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_DB_PATH: &str = "./mcp-meter.db";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SETTLEMENT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
const DEFAULT_RATE_LIMIT_RPM: u32 = 600;
/// Above this the rail's decimal strings stop fitting an i64 price.
const MAX_MINOR_DECIMALS: u32 = 18;

#[derive(Clone)]
pub struct ProxyConfig {
    /// Server port
    pub port: u16,
    /// SQLite database path
    pub db_path: String,
    /// Base of every monetized URL handed out at registration
    pub public_base_url: String,
    /// Settlement rail base URL
    pub settlement_url: String,
    /// API key sent to the rail on every request
    pub settlement_api_key: String,
    /// Proxy funding wallet that pays providers
    pub settlement_source_address: String,
    /// HMAC secret for signing transfer bodies (None = unsigned)
    pub settlement_signing_secret: Option<Vec<u8>>,
    pub currency: Currency,
    /// Deadline for unary upstream calls
    pub upstream_timeout: Duration,
    /// Deadline for one settlement transfer
    pub settlement_timeout: Duration,
    /// Session lifetime (None = sessions never expire)
    pub session_ttl: Option<Duration>,
    /// Accept localhost and private network upstreams at registration
    pub allow_private_upstreams: bool,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// Rate limit requests per minute
    pub rate_limit_rpm: u32,
    /// Bearer token required for /metrics endpoint (None = public)
    pub metrics_token: Option<String>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("public_base_url", &self.public_base_url)
            .field("settlement_url", &self.settlement_url)
            .field("settlement_api_key", &"[REDACTED]")
            .field("settlement_source_address", &self.settlement_source_address)
            .field(
                "settlement_signing_secret",
                &self.settlement_signing_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("currency", &self.currency)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("settlement_timeout", &self.settlement_timeout)
            .field("session_ttl", &self.session_ttl)
            .field("allow_private_upstreams", &self.allow_private_upstreams)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl ProxyConfig {
    /// Configuration with every optional setting at its default.
    pub fn new(settlement_url: &str, api_key: &str, source_address: &str) -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: DEFAULT_DB_PATH.to_string(),
            public_base_url: format!("http://localhost:{DEFAULT_PORT}"),
            settlement_url: settlement_url.to_string(),
            settlement_api_key: api_key.to_string(),
            settlement_source_address: source_address.to_string(),
            settlement_signing_secret: None,
            currency: Currency::default(),
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            settlement_timeout: Duration::from_secs(DEFAULT_SETTLEMENT_TIMEOUT_SECS),
            session_ttl: Some(Duration::from_secs(DEFAULT_SESSION_TTL_SECS)),
            allow_private_upstreams: false,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            rate_limit_rpm: DEFAULT_RATE_LIMIT_RPM,
            metrics_token: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        // Required: settlement rail
        let settlement_url = required("SETTLEMENT_URL")?;
        Url::parse(&settlement_url).map_err(|_| ConfigError::InvalidUrl(settlement_url.clone()))?;
        let api_key = required("SETTLEMENT_API_KEY")?;
        let source_address = required("SETTLEMENT_SOURCE_ADDRESS")?;

        let mut config = Self::new(&settlement_url, &api_key, &source_address);

        config.settlement_signing_secret = optional("SETTLEMENT_SIGNING_SECRET").map(String::into_bytes);

        if let Some(port) = parsed("PORT") {
            config.port = port;
        }
        config.public_base_url = optional("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", config.port));
        Url::parse(&config.public_base_url)
            .map_err(|_| ConfigError::InvalidUrl(config.public_base_url.clone()))?;

        if let Some(path) = optional("DB_PATH") {
            config.db_path = path;
        }

        let code = optional("CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        let decimals = parsed("CURRENCY_DECIMALS").unwrap_or(DEFAULT_MINOR_DECIMALS);
        if decimals > MAX_MINOR_DECIMALS {
            return Err(ConfigError::InvalidValue(
                "CURRENCY_DECIMALS",
                format!("{decimals} exceeds {MAX_MINOR_DECIMALS}"),
            ));
        }
        config.currency = Currency::new(code, decimals);

        if let Some(secs) = parsed::<u64>("UPSTREAM_TIMEOUT_SECS").filter(|s| *s > 0) {
            config.upstream_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>("SETTLEMENT_TIMEOUT_SECS").filter(|s| *s > 0) {
            config.settlement_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>("SESSION_TTL_SECS") {
            config.session_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config.allow_private_upstreams = optional("ALLOW_PRIVATE_UPSTREAMS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if let Some(origins) = optional("ALLOWED_ORIGINS") {
            config.allowed_origins = parse_origins(&origins);
        }
        if let Some(rpm) = parsed::<u32>("RATE_LIMIT_RPM").filter(|r| *r > 0) {
            config.rate_limit_rpm = rpm;
        }

        config.metrics_token = optional("METRICS_TOKEN");

        if config.settlement_signing_secret.is_none() {
            tracing::warn!("SETTLEMENT_SIGNING_SECRET not set, transfer bodies will be unsigned");
        }
        if config.allow_private_upstreams {
            tracing::warn!("ALLOW_PRIVATE_UPSTREAMS=true, providers may register private network upstreams");
        }
        if config.metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set, /metrics endpoint is publicly accessible");
        }

        Ok(config)
    }

    /// Public address a caller uses to reach `provider_id` through the proxy.
    pub fn monetized_url(&self, provider_id: &str) -> String {
        format!(
            "{}/invoke/{}",
            self.public_base_url.trim_end_matches('/'),
            urlencoding::encode(provider_id)
        )
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingRequired(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    optional(name).and_then(|s| s.trim().parse().ok())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::new("https://rail.example.com", "key", "1Funding");
        assert_eq!(config.port, 3001);
        assert_eq!(config.currency.code, "MNEE");
        assert_eq!(config.currency.minor_decimals, 2);
        assert_eq!(config.session_ttl, Some(Duration::from_secs(3600)));
        assert!(!config.allow_private_upstreams);
    }

    #[test]
    fn test_monetized_url_is_deterministic() {
        let mut config = ProxyConfig::new("https://rail.example.com", "key", "1Funding");
        config.public_base_url = "https://meter.example.com/".to_string();
        assert_eq!(
            config.monetized_url("weather_v2"),
            "https://meter.example.com/invoke/weather_v2"
        );
        assert_eq!(
            config.monetized_url("weather_v2"),
            config.monetized_url("weather_v2")
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = ProxyConfig::new("https://rail.example.com", "rail-key-123", "1Funding");
        config.settlement_signing_secret = Some(b"signing-secret-456".to_vec());
        config.metrics_token = Some("metrics-token-789".to_string());
        let debug = format!("{config:?}");
        assert!(!debug.contains("rail-key-123"));
        assert!(!debug.contains("signing-secret-456"));
        assert!(!debug.contains("metrics-token-789"));
    }

    #[test]
    fn test_parse_origins() {
        assert_eq!(
            parse_origins("http://a.test, http://b.test,,"),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }
}
