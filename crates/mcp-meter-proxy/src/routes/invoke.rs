use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use mcp_meter::{MessageKind, ProtocolMessage};

use crate::db::Provider;
use crate::error::ProxyError;
use crate::forwarder::{self, CallerHeaders};
use crate::gate::GateOutcome;
use crate::metrics;
use crate::routes::with_db;
use crate::state::AppState;

async fn lookup(state: &AppState, provider_id: String) -> Result<Provider, ProxyError> {
    with_db(state, move |db| {
        db.get_provider(&provider_id)?
            .ok_or(ProxyError::ProviderNotFound(provider_id))
    })
    .await
}

/// POST /invoke/{provider_id} - Relay one protocol message
///
/// `initialize` opens a session, `tools/call` goes through the payment gate,
/// everything else is passed through with the current session token.
pub async fn invoke(
    req: HttpRequest,
    path: web::Path<String>,
    body: Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let provider = lookup(&state, path.into_inner()).await?;
    let message =
        ProtocolMessage::parse(&body).map_err(|e| ProxyError::InvalidPayload(e.to_string()))?;
    let caller = CallerHeaders::from_request(&req);

    let kind = message.kind();
    metrics::INVOCATIONS_TOTAL
        .with_label_values(&[kind.as_str()])
        .inc();

    match kind {
        MessageKind::Handshake => handshake(&state, &provider, body, &caller).await,
        MessageKind::ToolCall => {
            let caller_key = req
                .headers()
                .get("idempotency-key")
                .and_then(|v| v.to_str().ok())
                .filter(|k| !k.is_empty());
            match state.gate.authorize(&provider, &message, caller_key).await {
                GateOutcome::Proceed { ticket } => {
                    tracing::debug!(
                        provider = %provider.id,
                        ticket = ticket.as_ref().map(|t| t.ticket_id.as_str()).unwrap_or("free"),
                        "forwarding tool call"
                    );
                    passthrough(&state, &provider, body, &caller).await
                }
                GateOutcome::Reject(rejection) => {
                    Ok(HttpResponse::Ok().json(rejection.to_envelope(&message.response_id())))
                }
            }
        }
        MessageKind::Other => passthrough(&state, &provider, body, &caller).await,
    }
}

/// Forward `initialize` without a session and capture the token it returns.
/// A failed handshake clears the stale session for this provider.
async fn handshake(
    state: &AppState,
    provider: &Provider,
    body: Bytes,
    caller: &CallerHeaders,
) -> Result<HttpResponse, ProxyError> {
    let response =
        match forwarder::send_message(&state.http_client, &provider.upstream_url, body, None, caller)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                state.sessions.remove(&provider.id);
                return Err(e);
            }
        };

    if response.status().is_success() {
        if let Some(token) = forwarder::session_token(&response) {
            state.sessions.set(&provider.id, &token);
            tracing::info!(provider = %provider.id, "upstream session established");
        }
    } else {
        state.sessions.remove(&provider.id);
        tracing::warn!(
            provider = %provider.id,
            status = response.status().as_u16(),
            "upstream rejected handshake"
        );
    }

    forwarder::relay(response, &state.streams, &provider.id).await
}

async fn passthrough(
    state: &AppState,
    provider: &Provider,
    body: Bytes,
    caller: &CallerHeaders,
) -> Result<HttpResponse, ProxyError> {
    let session = state.sessions.get(&provider.id);
    let response = forwarder::send_message(
        &state.http_client,
        &provider.upstream_url,
        body,
        session.as_deref(),
        caller,
    )
    .await?;
    forwarder::relay(response, &state.streams, &provider.id).await
}

/// GET /invoke/{provider_id} - Relay the upstream's server-push stream
pub async fn subscribe(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let provider = lookup(&state, path.into_inner()).await?;
    let caller = CallerHeaders::from_request(&req);
    let session = state.sessions.get(&provider.id);

    let response = forwarder::open_stream(
        &state.stream_client,
        &provider.upstream_url,
        session.as_deref(),
        &caller,
    )
    .await?;

    if !response.status().is_success() || !forwarder::is_event_stream(&response) {
        return Err(ProxyError::UpstreamUnavailable(format!(
            "provider '{}' offered no stream (HTTP {})",
            provider.id,
            response.status().as_u16()
        )));
    }

    Ok(forwarder::relay_stream(response, &state.streams, &provider.id))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/invoke/{provider_id}", web::post().to(invoke))
        .route("/invoke/{provider_id}", web::get().to(subscribe));
}
