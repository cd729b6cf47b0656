use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use mcp_meter::SettlementError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Client input malformed; nothing was written
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("provider already registered: {0}")]
    DuplicateProvider(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// Forward or stream failure
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("settlement rail error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ProxyError::DuplicateProvider(_) => StatusCode::CONFLICT,
            ProxyError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Settlement(_) | ProxyError::Database(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ProxyError::InvalidPayload(msg) => serde_json::json!({
                "error": "invalid_payload",
                "message": msg
            }),
            ProxyError::DuplicateProvider(id) => serde_json::json!({
                "error": "duplicate_provider",
                "message": format!("Provider '{}' is already registered", id)
            }),
            ProxyError::ProviderNotFound(id) => serde_json::json!({
                "error": "provider_not_found",
                "message": format!("Provider '{}' not found", id)
            }),
            ProxyError::UpstreamUnavailable(msg) => {
                tracing::error!("Upstream error: {}", msg);
                serde_json::json!({
                    "error": "upstream_unavailable",
                    "message": "Failed to reach upstream service"
                })
            }
            ProxyError::Settlement(e) => {
                tracing::error!("Settlement rail error: {}", e);
                internal_body()
            }
            ProxyError::Database(e) => {
                tracing::error!("Database error: {}", e);
                internal_body()
            }
            ProxyError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                internal_body()
            }
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

fn internal_body() -> serde_json::Value {
    serde_json::json!({
        "error": "internal_error",
        "message": "An internal error occurred"
    })
}

/// JSON extractor config that reports malformed bodies as `InvalidPayload`.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(1024 * 1024)
        .error_handler(|err, _req| ProxyError::InvalidPayload(err.to_string()).into())
}

/// Query extractor config with the same treatment.
pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| ProxyError::InvalidPayload(err.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::InvalidPayload("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::DuplicateProvider("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProxyError::ProviderNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::UpstreamUnavailable("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Settlement(SettlementError::Transport("x".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_errors_leak_nothing() {
        let err = ProxyError::Internal("database lock poisoned at /var/secret".into());
        let body = err.error_response().into_body().try_into_bytes().unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("/var/secret"));
        assert!(text.contains("internal_error"));
    }
}
