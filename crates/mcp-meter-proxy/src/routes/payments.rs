use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::db::Earnings;
use crate::error::ProxyError;
use crate::routes::with_db;
use crate::state::AppState;

const DEFAULT_PAYMENT_LIMIT: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct PaymentsQuery {
    pub limit: Option<u32>,
}

/// Earnings row with revenue also rendered in major units.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EarningsView {
    #[serde(flatten)]
    earnings: Earnings,
    revenue_decimal: String,
    currency: String,
}

fn view(state: &AppState, earnings: Earnings) -> EarningsView {
    let currency = &state.config.currency;
    EarningsView {
        revenue_decimal: currency.minor_to_major(earnings.revenue_minor_units),
        currency: currency.code.clone(),
        earnings,
    }
}

/// GET /payments?limit= - Most recent audit rows, newest first
pub async fn list_payments(
    query: web::Query<PaymentsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAYMENT_LIMIT);
    let payments = with_db(&state, move |db| db.list_recent_payments(limit)).await?;
    Ok(HttpResponse::Ok().json(payments))
}

/// GET /earnings - Earnings for every provider
pub async fn list_earnings(state: web::Data<AppState>) -> Result<HttpResponse, ProxyError> {
    let earnings: Vec<_> = with_db(&state, |db| db.list_earnings())
        .await?
        .into_iter()
        .map(|e| view(&state, e))
        .collect();
    Ok(HttpResponse::Ok().json(earnings))
}

/// GET /earnings/{provider_id} - Earnings for one provider
pub async fn provider_earnings(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let provider_id = path.into_inner();
    let earnings = with_db(&state, move |db| {
        db.provider_earnings(&provider_id)?
            .ok_or(ProxyError::ProviderNotFound(provider_id))
    })
    .await?;
    Ok(HttpResponse::Ok().json(view(&state, earnings)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/payments", web::get().to(list_payments))
        .route("/earnings", web::get().to(list_earnings))
        .route("/earnings/{provider_id}", web::get().to(provider_earnings));
}
