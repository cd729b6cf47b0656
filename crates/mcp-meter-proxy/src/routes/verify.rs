use actix_web::{web, HttpResponse};
use bytes::Bytes;
use mcp_meter::{protocol, METHOD_INITIALIZE, METHOD_TOOLS_LIST};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProxyError;
use crate::forwarder::{self, CallerHeaders};
use crate::state::AppState;
use crate::validation::validate_upstream_url;

const CLIENT_PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
}

/// Send one request and decode its JSON-RPC reply. Any failure means the
/// prospective upstream is not usable.
async fn rpc(
    state: &AppState,
    url: &str,
    message: Value,
    session: Option<&str>,
) -> Result<(Value, Option<String>), ProxyError> {
    let body = Bytes::from(message.to_string());
    let response =
        forwarder::send_message(&state.http_client, url, body, session, &CallerHeaders::default())
            .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::UpstreamUnavailable(format!(
            "upstream answered HTTP {}",
            status.as_u16()
        )));
    }

    let token = forwarder::session_token(&response);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let text = response
        .text()
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable(format!("failed to read reply: {e}")))?;

    let reply = protocol::decode_response(content_type.as_deref(), &text)
        .ok_or_else(|| ProxyError::UpstreamUnavailable("reply was not JSON-RPC".to_string()))?;
    if let Some(error) = reply.get("error") {
        return Err(ProxyError::UpstreamUnavailable(format!(
            "upstream returned error: {error}"
        )));
    }
    Ok((reply, token))
}

/// Pull `{name, description}` out of a `tools/list` result.
pub fn tool_infos(reply: &Value) -> Vec<ToolInfo> {
    reply
        .pointer("/result/tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| {
                    Some(ToolInfo {
                        name: tool.get("name")?.as_str()?.to_string(),
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// POST /verify - Handshake with a prospective upstream and list its tools
pub async fn verify(
    body: web::Json<VerifyRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let url = body
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ProxyError::InvalidPayload("url is required".to_string()))?;
    validate_upstream_url(url, state.config.allow_private_upstreams)?;

    let initialize = protocol::request(
        1,
        METHOD_INITIALIZE,
        json!({
            "protocolVersion": CLIENT_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "mcp-meter-proxy", "version": env!("CARGO_PKG_VERSION")},
        }),
    );
    let (_, session) = rpc(&state, url, initialize, None).await?;

    // Notifications get no reply body; a refusal here is not fatal
    let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    if let Err(e) = forwarder::send_message(
        &state.http_client,
        url,
        Bytes::from(initialized.to_string()),
        session.as_deref(),
        &CallerHeaders::default(),
    )
    .await
    {
        tracing::debug!(error = %e, "initialized notification not delivered");
    }

    let (reply, _) = rpc(
        &state,
        url,
        protocol::request(2, METHOD_TOOLS_LIST, json!({})),
        session.as_deref(),
    )
    .await?;

    let tools = tool_infos(&reply);
    tracing::info!(upstream = %url, tools = tools.len(), "verified upstream");
    Ok(HttpResponse::Ok().json(json!({ "tools": tools })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/verify", web::post().to(verify));
}
