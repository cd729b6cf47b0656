//! Pay-per-call metering for MCP tool servers.
//!
//! A metering proxy sits between an agent and an upstream MCP server. Every
//! `tools/call` is priced in integer minor units, settled on an external
//! wallet rail, and only then forwarded. This crate holds the pieces that do
//! not depend on the HTTP server:
//!
//! - [`protocol`]: JSON-RPC message classification and the gate's error envelope
//! - [`amount`]: minor/major unit conversion for a configured [`Currency`]
//! - [`settlement`]: the [`SettlementClient`] trait and its HTTP implementation
//! - [`hmac`]: request signing and idempotency key derivation
//!
//! # Quick example
//!
//! ```no_run
//! use mcp_meter::{Currency, HttpSettlementClient, SettlementClient, TransferRequest};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let rail = HttpSettlementClient::new(
//!     reqwest::Client::new(),
//!     "https://rail.example.com",
//!     "api-key",
//!     None,
//! );
//! let currency = Currency::default();
//! let ticket = rail
//!     .transfer(&TransferRequest {
//!         source: "1Funding".into(),
//!         destination: "1Payout".into(),
//!         amount: currency.minor_to_major(150),
//!         currency: currency.code.clone(),
//!         memo: "echo".into(),
//!         idempotency_key: None,
//!     })
//!     .await
//!     .unwrap();
//! println!("settled: {}", ticket.ticket_id);
//! # }
//! ```

pub mod amount;
pub mod constants;
pub mod error;
pub mod hmac;
pub mod protocol;
pub mod settlement;

pub use amount::Currency;
pub use constants::*;
pub use error::{MeterError, SettlementError};
pub use protocol::{GateRejection, MessageKind, ProtocolMessage};
pub use settlement::{
    BalanceReport, HttpSettlementClient, SettlementClient, SettlementTicket, TransferRequest,
};
