pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod forwarder;
pub mod gate;
pub mod metrics;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod validation;

pub use config::ProxyConfig;
pub use db::Database;
pub use error::ProxyError;
pub use gate::{GateOutcome, PaymentGate};
pub use sessions::SessionDirectory;
pub use state::AppState;
