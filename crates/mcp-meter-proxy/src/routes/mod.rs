use actix_web::web;

use crate::db::Database;
use crate::error::ProxyError;
use crate::state::AppState;

pub mod health;
pub mod invoke;
pub mod payments;
pub mod register;
pub mod verify;
pub mod wallet;

/// Mount every route plus the extractor configs that turn malformed input
/// into `InvalidPayload`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(crate::error::json_config())
        .app_data(crate::error::query_config())
        .configure(health::configure)
        .configure(register::configure)
        .configure(invoke::configure)
        .configure(wallet::configure)
        .configure(payments::configure)
        .configure(verify::configure);
}

/// Run a registry call on the blocking pool instead of the actix worker.
pub(crate) async fn with_db<T, F>(state: &AppState, f: F) -> Result<T, ProxyError>
where
    F: FnOnce(&Database) -> Result<T, ProxyError> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    web::block(move || f(&db))
        .await
        .map_err(|e| ProxyError::Internal(format!("registry task failed: {e}")))?
}
