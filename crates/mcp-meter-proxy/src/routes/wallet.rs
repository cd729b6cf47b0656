use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::error::ProxyError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AddressParams {
    #[serde(default)]
    pub address: Option<String>,
}

impl AddressParams {
    fn address(&self) -> Option<&str> {
        self.address.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }
}

/// GET /balance?address= - Read-through balance query against the rail
pub async fn balance(
    query: web::Query<AddressParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let address = query
        .address()
        .ok_or_else(|| ProxyError::InvalidPayload("address is required".to_string()))?;

    let report = state.settlement.balance(address).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "address": report.address,
        "amount": report.amount,
        "decimalAmount": report.decimal_amount,
        "currency": state.config.currency.code,
    })))
}

/// POST /verify-wallet - Check that the rail knows an address
pub async fn verify_wallet(
    body: web::Json<AddressParams>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let Some(address) = body.address() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "verified": false,
            "error": "address is required"
        }));
    };

    match state.settlement.balance(address).await {
        Ok(report) => HttpResponse::Ok().json(serde_json::json!({
            "verified": true,
            "balance": report.decimal_amount,
        })),
        Err(e) => {
            tracing::info!(address = %address, error = %e, "wallet verification failed");
            HttpResponse::BadRequest().json(serde_json::json!({
                "verified": false,
                "error": "Wallet verification failed"
            }))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/balance", web::get().to(balance))
        .route("/verify-wallet", web::post().to(verify_wallet));
}
