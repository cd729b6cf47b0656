use thiserror::Error;

/// Errors returned while interpreting protocol messages.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Errors returned by a settlement rail.
///
/// Every variant knows whether the caller may retry the same invocation;
/// the gate copies that flag into the rejection envelope.
#[derive(Debug, Clone, Error)]
pub enum SettlementError {
    /// The rail answered and refused the transfer.
    #[error("transfer rejected ({status}): {reason}")]
    Rejected {
        status: u16,
        reason: String,
        retryable: bool,
    },

    /// The rail could not be reached or its answer could not be read.
    #[error("settlement rail unreachable: {0}")]
    Transport(String),

    /// No answer within the configured deadline.
    #[error("settlement timed out after {0}s")]
    Timeout(u64),
}

impl SettlementError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SettlementError::Rejected { retryable, .. } => *retryable,
            SettlementError::Transport(_) | SettlementError::Timeout(_) => true,
        }
    }

    /// Short machine-readable reason placed in the rejection envelope.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SettlementError::Rejected { status: 402, .. } => "insufficient_funds",
            SettlementError::Rejected { .. } => "transfer_rejected",
            SettlementError::Transport(_) => "rail_unreachable",
            SettlementError::Timeout(_) => "settlement_timeout",
        }
    }
}
