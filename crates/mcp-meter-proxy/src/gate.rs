//! Payment gate for `tools/call` messages.
//!
//! Each invocation is priced from the provider's registered tools, settled
//! with one transfer from the proxy's funding wallet to the provider's payout
//! wallet, and recorded in the audit log. Only a settled call is forwarded.
//! The gate never retries; the rejection envelope tells the caller whether
//! retrying can help.

use mcp_meter::{
    Currency, GateRejection, ProtocolMessage, SettlementClient, SettlementError,
    SettlementTicket, TransferRequest,
};
use std::sync::Arc;
use std::time::Duration;

use crate::db::{Database, PaymentEntry, PaymentStatus, Provider};
use crate::metrics;

#[derive(Debug)]
pub enum GateOutcome {
    /// Forward the message. `ticket` is None for free tools.
    Proceed { ticket: Option<SettlementTicket> },
    /// Answer the caller with this protocol error instead of forwarding.
    Reject(GateRejection),
}

#[derive(Clone)]
pub struct PaymentGate {
    db: Arc<Database>,
    settlement: Arc<dyn SettlementClient>,
    source_address: String,
    currency: Currency,
    timeout: Duration,
}

impl PaymentGate {
    pub fn new(
        db: Arc<Database>,
        settlement: Arc<dyn SettlementClient>,
        source_address: &str,
        currency: Currency,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            settlement,
            source_address: source_address.to_string(),
            currency,
            timeout,
        }
    }

    /// Price and settle one tool call.
    ///
    /// `caller_key` is the caller's `Idempotency-Key` header; when present it
    /// is scoped to this provider and tool before reaching the rail.
    pub async fn authorize(
        &self,
        provider: &Provider,
        message: &ProtocolMessage,
        caller_key: Option<&str>,
    ) -> GateOutcome {
        let tool_name = message.tool_name();
        let Some(tool) = tool_name.and_then(|name| provider.tool(name)) else {
            tracing::info!(
                provider = %provider.id,
                tool = tool_name.unwrap_or(""),
                "rejected call to unknown tool"
            );
            return GateOutcome::Reject(GateRejection::unknown_tool(
                tool_name,
                &provider.payout_address,
                &self.currency.code,
            ));
        };

        if tool.price_minor_units == 0 {
            return GateOutcome::Proceed { ticket: None };
        }

        let amount = self.currency.minor_to_major(tool.price_minor_units);
        let request = TransferRequest {
            source: self.source_address.clone(),
            destination: provider.payout_address.clone(),
            amount: amount.clone(),
            currency: self.currency.code.clone(),
            memo: format!("{}/{}", provider.id, tool.name),
            idempotency_key: caller_key
                .map(|key| mcp_meter::hmac::idempotency_key(&provider.id, &tool.name, key)),
        };

        let result = match tokio::time::timeout(self.timeout, self.settlement.transfer(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SettlementError::Timeout(self.timeout.as_secs())),
        };

        let mut entry = PaymentEntry {
            provider_id: provider.id.clone(),
            tool_name: tool.name.clone(),
            from_address: self.source_address.clone(),
            to_address: provider.payout_address.clone(),
            amount_minor_units: tool.price_minor_units,
            amount_decimal: amount,
            currency: self.currency.code.clone(),
            ticket_id: None,
            status: PaymentStatus::Failed,
        };

        match result {
            Ok(ticket) => {
                tracing::info!(
                    provider = %provider.id,
                    tool = %tool.name,
                    amount = tool.price_minor_units,
                    ticket = %ticket.ticket_id,
                    "tool call settled"
                );
                metrics::SETTLEMENTS_TOTAL.inc();
                metrics::PROVIDER_PAYMENTS
                    .with_label_values(&[provider.id.as_str()])
                    .inc();
                metrics::PROVIDER_REVENUE
                    .with_label_values(&[provider.id.as_str()])
                    .inc_by(tool.price_minor_units.unsigned_abs());

                entry.ticket_id = Some(ticket.ticket_id.clone());
                entry.status = PaymentStatus::Success;
                self.record(entry).await;
                GateOutcome::Proceed {
                    ticket: Some(ticket),
                }
            }
            Err(e) => {
                tracing::warn!(
                    provider = %provider.id,
                    tool = %tool.name,
                    error = %e,
                    retryable = e.is_retryable(),
                    "settlement failed, call not forwarded"
                );
                metrics::SETTLEMENTS_FAILED.inc();

                self.record(entry).await;
                GateOutcome::Reject(GateRejection::payment_required(
                    &tool.name,
                    tool.price_minor_units,
                    &provider.payout_address,
                    &self.currency.code,
                    &e,
                ))
            }
        }
    }

    /// Best-effort audit write. A failure is logged with the full entry so
    /// the transfer can be reconciled by hand, and never reaches the caller.
    async fn record(&self, entry: PaymentEntry) {
        let db = self.db.clone();
        let written = tokio::task::spawn_blocking(move || {
            if let Err(e) = db.record_payment(&entry) {
                tracing::warn!(
                    error = %e,
                    provider = %entry.provider_id,
                    tool = %entry.tool_name,
                    ticket = ?entry.ticket_id,
                    status = entry.status.as_str(),
                    amount = entry.amount_minor_units,
                    "failed to write payment audit row"
                );
                metrics::AUDIT_WRITE_FAILURES.inc();
            }
        })
        .await;

        if let Err(e) = written {
            tracing::warn!(error = %e, "payment audit task did not complete");
            metrics::AUDIT_WRITE_FAILURES.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Tool;
    use async_trait::async_trait;
    use mcp_meter::BalanceReport;
    use std::sync::Mutex;

    /// Settlement fake that records every transfer it is asked to make.
    struct RecordingRail {
        outcome: Result<&'static str, SettlementError>,
        delay: Duration,
        calls: Mutex<Vec<TransferRequest>>,
    }

    impl RecordingRail {
        fn paying(ticket: &'static str) -> Arc<Self> {
            Arc::new(Self {
                outcome: Ok(ticket),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: SettlementError) -> Arc<Self> {
            Arc::new(Self {
                outcome: Err(error),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<TransferRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SettlementClient for RecordingRail {
        async fn transfer(
            &self,
            request: &TransferRequest,
        ) -> Result<SettlementTicket, SettlementError> {
            self.calls.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            self.outcome.clone().map(|t| SettlementTicket {
                ticket_id: t.to_string(),
            })
        }

        async fn balance(&self, address: &str) -> Result<BalanceReport, SettlementError> {
            Ok(BalanceReport {
                address: address.to_string(),
                amount: 0,
                decimal_amount: 0.0,
            })
        }
    }

    fn setup(rail: Arc<RecordingRail>) -> (PaymentGate, Arc<Database>, Provider) {
        let db = Arc::new(Database::new(":memory:").unwrap());
        let provider = db
            .register_provider(
                "weather",
                "https://mcp.example.com/mcp",
                "1Payout",
                &[
                    Tool {
                        name: "echo".to_string(),
                        price_minor_units: 100,
                    },
                    Tool {
                        name: "ping".to_string(),
                        price_minor_units: 0,
                    },
                ],
            )
            .unwrap();
        let gate = PaymentGate::new(
            db.clone(),
            rail,
            "1Funding",
            Currency::default(),
            Duration::from_secs(5),
        );
        (gate, db, provider)
    }

    fn call(tool: &str) -> ProtocolMessage {
        ProtocolMessage::parse(
            format!(
                r#"{{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{{"name":"{tool}"}}}}"#
            )
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_settled_call_proceeds_and_is_recorded() {
        let rail = RecordingRail::paying("tkt-1");
        let (gate, db, provider) = setup(rail.clone());

        let outcome = gate.authorize(&provider, &call("echo"), None).await;
        match outcome {
            GateOutcome::Proceed { ticket: Some(t) } => assert_eq!(t.ticket_id, "tkt-1"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let calls = rail.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source, "1Funding");
        assert_eq!(calls[0].destination, "1Payout");
        assert_eq!(calls[0].amount, "1");
        assert_eq!(calls[0].idempotency_key, None);

        let payments = db.list_recent_payments(10).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Success);
        assert_eq!(payments[0].ticket_id.as_deref(), Some("tkt-1"));
        assert_eq!(payments[0].amount_minor_units, 100);
        assert_eq!(payments[0].amount_decimal, "1");
    }

    #[tokio::test]
    async fn test_failed_settlement_rejects_and_records() {
        let rail = RecordingRail::failing(SettlementError::Rejected {
            status: 402,
            reason: "insufficient funds".into(),
            retryable: true,
        });
        let (gate, db, provider) = setup(rail);

        let GateOutcome::Reject(rejection) = gate.authorize(&provider, &call("echo"), None).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.code, 40201);
        assert_eq!(rejection.data.price_minor_units, Some(100));
        assert_eq!(rejection.data.payout_address, "1Payout");
        assert!(rejection.data.retryable);
        assert_eq!(rejection.data.reason, "insufficient_funds");

        let payments = db.list_recent_payments(10).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Failed);
        assert!(payments[0].ticket_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_never_settles() {
        let rail = RecordingRail::paying("tkt-1");
        let (gate, db, provider) = setup(rail.clone());

        let GateOutcome::Reject(rejection) =
            gate.authorize(&provider, &call("missing"), None).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.code, -32602);
        assert!(!rejection.data.retryable);
        assert!(rail.calls().is_empty());
        assert!(db.list_recent_payments(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_free_tool_skips_settlement() {
        let rail = RecordingRail::paying("tkt-1");
        let (gate, db, provider) = setup(rail.clone());

        let outcome = gate.authorize(&provider, &call("ping"), None).await;
        assert!(matches!(outcome, GateOutcome::Proceed { ticket: None }));
        assert!(rail.calls().is_empty());
        assert!(db.list_recent_payments(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_caller_key_is_scoped() {
        let rail = RecordingRail::paying("tkt-1");
        let (gate, _db, provider) = setup(rail.clone());

        gate.authorize(&provider, &call("echo"), Some("req-7")).await;
        let calls = rail.calls();
        assert_eq!(
            calls[0].idempotency_key.as_deref(),
            Some(mcp_meter::hmac::idempotency_key("weather", "echo", "req-7").as_str())
        );
    }

    #[tokio::test]
    async fn test_slow_rail_times_out_as_retryable() {
        let rail = Arc::new(RecordingRail {
            outcome: Ok("late"),
            delay: Duration::from_secs(5),
            calls: Mutex::new(Vec::new()),
        });
        let (mut gate, db, provider) = setup(rail);
        gate.timeout = Duration::from_millis(50);

        let GateOutcome::Reject(rejection) = gate.authorize(&provider, &call("echo"), None).await
        else {
            panic!("expected rejection");
        };
        assert!(rejection.data.retryable);
        assert_eq!(rejection.data.reason, "settlement_timeout");
        assert_eq!(
            db.list_recent_payments(10).unwrap()[0].status,
            PaymentStatus::Failed
        );
    }
}
