//! Settlement rail client.
//!
//! The rail is an external wallet service that can report balances and move
//! funds. The proxy pays each provider from its own funding wallet, one
//! transfer per priced tool call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SettlementError;

/// One transfer from the proxy's funding wallet to a provider's payout wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: String,
    pub destination: String,
    /// Decimal major-unit amount, e.g. "1.5".
    pub amount: String,
    pub currency: String,
    /// Free-form note stored by the rail next to the transfer.
    pub memo: String,
    /// Set only when the caller supplied an idempotency key of its own.
    pub idempotency_key: Option<String>,
}

/// Proof that the rail accepted a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementTicket {
    pub ticket_id: String,
}

/// Balance of a wallet as reported by the rail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceReport {
    pub address: String,
    /// Atomic units as the rail counts them.
    pub amount: i64,
    pub decimal_amount: f64,
}

/// Balance queries and transfers on a settlement rail.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Move funds. Returns the rail's ticket on success.
    async fn transfer(&self, request: &TransferRequest)
        -> Result<SettlementTicket, SettlementError>;

    /// Read a wallet balance.
    async fn balance(&self, address: &str) -> Result<BalanceReport, SettlementError>;
}

#[derive(Serialize)]
struct Recipient<'a> {
    address: &'a str,
    amount: &'a str,
}

#[derive(Serialize)]
struct TransferBody<'a> {
    source: &'a str,
    recipients: [Recipient<'a>; 1],
    currency: &'a str,
    memo: &'a str,
}

#[derive(Deserialize, Default)]
struct RailErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retryable: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferReply {
    #[serde(default)]
    ticket_id: Option<String>,
}

/// Whether a failed transfer with this status may succeed if tried again.
/// 402 means the funding wallet is short; topping it up fixes the call.
fn status_is_retryable(status: u16) -> bool {
    matches!(status, 402 | 408 | 429) || (500..600).contains(&status)
}

/// [`SettlementClient`] over the rail's HTTP API.
///
/// Every request carries the proxy's API key. When a signing secret is
/// configured, transfer bodies are also signed with HMAC-SHA256 in
/// `X-Signature`.
///
/// With [`with_timeout`](Self::with_timeout) every request runs under that
/// deadline, and an expiry is reported as [`SettlementError::Timeout`].
#[derive(Clone)]
pub struct HttpSettlementClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    signing_secret: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for HttpSettlementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSettlementClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl HttpSettlementClient {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: &str,
        signing_secret: Option<Vec<u8>>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            signing_secret,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> SettlementError {
        if e.is_timeout() {
            SettlementError::Timeout(self.timeout.map(|t| t.as_secs()).unwrap_or(0))
        } else {
            SettlementError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl SettlementClient for HttpSettlementClient {
    async fn transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<SettlementTicket, SettlementError> {
        let url = format!("{}/v1/transfers", self.base_url);
        let body = TransferBody {
            source: &request.source,
            recipients: [Recipient {
                address: &request.destination,
                amount: &request.amount,
            }],
            currency: &request.currency,
            memo: &request.memo,
        };
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| SettlementError::Transport(format!("serialization failed: {e}")))?;

        let mut builder = self
            .request(self.client.post(&url))
            .header("Content-Type", "application/json")
            .header("X-Api-Key", &self.api_key);

        if let Some(ref secret) = self.signing_secret {
            builder = builder.header("X-Signature", crate::hmac::sign_body(secret, &body_bytes));
        }
        if let Some(ref key) = request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let response = builder
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let parsed: RailErrorBody = serde_json::from_str(&text).unwrap_or_default();
            let code = status.as_u16();
            tracing::warn!(
                status = code,
                destination = %request.destination,
                amount = %request.amount,
                "settlement rail rejected transfer"
            );
            return Err(SettlementError::Rejected {
                status: code,
                reason: parsed
                    .error
                    .unwrap_or_else(|| format!("rail returned HTTP {code}")),
                retryable: parsed.retryable.unwrap_or_else(|| status_is_retryable(code)),
            });
        }

        // A 2xx without a ticket may still have moved funds; never invite a retry
        let reply: TransferReply = serde_json::from_str(&text).map_err(|e| {
            SettlementError::Rejected {
                status: status.as_u16(),
                reason: format!("unreadable transfer reply: {e}"),
                retryable: false,
            }
        })?;
        match reply.ticket_id.filter(|t| !t.is_empty()) {
            Some(ticket_id) => Ok(SettlementTicket { ticket_id }),
            None => Err(SettlementError::Rejected {
                status: status.as_u16(),
                reason: "transfer reply carried no ticket".to_string(),
                retryable: false,
            }),
        }
    }

    async fn balance(&self, address: &str) -> Result<BalanceReport, SettlementError> {
        let url = format!("{}/v1/balance", self.base_url);
        let response = self
            .request(self.client.get(&url))
            .query(&[("address", address)])
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let parsed: RailErrorBody = response.json().await.unwrap_or_default();
            return Err(SettlementError::Rejected {
                status: code,
                reason: parsed
                    .error
                    .unwrap_or_else(|| format!("rail returned HTTP {code}")),
                retryable: status_is_retryable(code),
            });
        }

        response
            .json::<BalanceReport>()
            .await
            .map_err(|e| self.transport_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retryability() {
        assert!(status_is_retryable(402));
        assert!(status_is_retryable(429));
        assert!(status_is_retryable(503));
        assert!(!status_is_retryable(400));
        assert!(!status_is_retryable(401));
        assert!(!status_is_retryable(404));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let client = HttpSettlementClient::new(
            reqwest::Client::new(),
            "https://rail.example.com/",
            "super-secret-key",
            Some(b"signing".to_vec()),
        );
        let debug = format!("{client:?}");
        assert!(!debug.contains("super-secret-key"));
        assert!(debug.contains("https://rail.example.com\""));
    }
}
