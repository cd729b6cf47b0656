use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::db::Tool;
use crate::error::ProxyError;
use crate::metrics;
use crate::routes::with_db;
use crate::state::AppState;
use crate::validation::{validate_provider_id, validate_upstream_url};

/// Registration body. Fields are optional here so a missing one is reported
/// as a validation message instead of a deserializer error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default)]
    pub payout_address: Option<String>,
    #[serde(default)]
    pub tools: Option<Value>,
}

fn required(value: Option<String>, field: &str) -> Result<String, ProxyError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProxyError::InvalidPayload(format!("{field} is required")))
}

/// Validate the `tools` list: every entry needs a non-empty `toolName`, a
/// non-negative integer `priceMinorUnits`, and a name not used before.
pub fn parse_tools(raw: Option<&Value>) -> Result<Vec<Tool>, ProxyError> {
    let entries = raw
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::InvalidPayload("tools must be a list".to_string()))?;

    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let name = entry
            .get("toolName")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ProxyError::InvalidPayload(format!("tools[{i}].toolName must be a non-empty string"))
            })?;
        let price = entry
            .get("priceMinorUnits")
            .and_then(Value::as_i64)
            .filter(|p| *p >= 0)
            .ok_or_else(|| {
                ProxyError::InvalidPayload(format!(
                    "tools[{i}].priceMinorUnits must be a non-negative integer"
                ))
            })?;
        if !seen.insert(name.to_string()) {
            return Err(ProxyError::InvalidPayload(format!(
                "tool '{name}' is listed more than once"
            )));
        }
        tools.push(Tool {
            name: name.to_string(),
            price_minor_units: price,
        });
    }
    Ok(tools)
}

/// POST /register - Register a provider and its priced tools
pub async fn register(
    body: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let body = body.into_inner();

    // Validate everything before the first write
    let provider_id = required(body.provider_id, "providerId")?;
    let upstream_url = required(body.upstream_url, "upstreamUrl")?;
    let payout_address = required(body.payout_address, "payoutAddress")?;
    validate_provider_id(&provider_id)?;
    validate_upstream_url(&upstream_url, state.config.allow_private_upstreams)?;
    let tools = parse_tools(body.tools.as_ref())?;

    let provider = with_db(&state, move |db| {
        db.register_provider(&provider_id, &upstream_url, &payout_address, &tools)
    })
    .await?;

    metrics::PROVIDERS_REGISTERED.inc();
    tracing::info!(
        provider = %provider.id,
        tools = provider.tools.len(),
        "provider registered"
    );

    Ok(HttpResponse::Created().json(serde_json::json!({
        "success": true,
        "monetizedUrl": state.config.monetized_url(&provider.id),
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/register", web::post().to(register));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tools_valid() {
        let raw = json!([
            {"toolName": "echo", "priceMinorUnits": 100},
            {"toolName": "ping", "priceMinorUnits": 0}
        ]);
        let tools = parse_tools(Some(&raw)).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].price_minor_units, 100);
        assert_eq!(tools[1].price_minor_units, 0);

        assert!(parse_tools(Some(&json!([]))).unwrap().is_empty());
    }

    #[test]
    fn test_parse_tools_invalid() {
        assert!(parse_tools(None).is_err());
        assert!(parse_tools(Some(&json!({"toolName": "echo"}))).is_err());
        assert!(parse_tools(Some(&json!([{"toolName": "", "priceMinorUnits": 1}]))).is_err());
        assert!(parse_tools(Some(&json!([{"toolName": "echo"}]))).is_err());
        assert!(parse_tools(Some(&json!([{"toolName": "echo", "priceMinorUnits": -1}]))).is_err());
        assert!(parse_tools(Some(&json!([{"toolName": "echo", "priceMinorUnits": 1.5}]))).is_err());
        assert!(parse_tools(Some(&json!([{"toolName": "echo", "priceMinorUnits": "100"}]))).is_err());
        assert!(parse_tools(Some(&json!([
            {"toolName": "echo", "priceMinorUnits": 1},
            {"toolName": "echo", "priceMinorUnits": 2}
        ])))
        .is_err());
    }
}
