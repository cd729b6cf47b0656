//! JSON-RPC message handling for the metering proxy.
//!
//! The proxy never rewrites a caller's message. It only needs to know which
//! branch a message takes (handshake, priced tool call, or passthrough) and,
//! for tool calls, which tool is being invoked.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::{
    EVENT_STREAM, METHOD_INITIALIZE, METHOD_TOOLS_CALL, PAYMENT_REQUIRED_CODE, UNKNOWN_TOOL_CODE,
};
use crate::error::{MeterError, SettlementError};

/// Which path a message takes through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `initialize`: forwarded without payment, captures the session token.
    Handshake,
    /// `tools/call`: priced and settled before forwarding.
    ToolCall,
    /// Everything else, including notifications and responses.
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::ToolCall => "tool_call",
            MessageKind::Other => "other",
        }
    }
}

/// The parts of a JSON-RPC message the proxy looks at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtocolMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl ProtocolMessage {
    /// Parse a single message from a request body.
    ///
    /// Batches are refused: a batch could carry a `tools/call` past the gate.
    pub fn parse(body: &[u8]) -> Result<Self, MeterError> {
        let value: Value = serde_json::from_slice(body)?;
        match value {
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            Value::Array(_) => Err(MeterError::InvalidMessage(
                "batch requests are not supported".to_string(),
            )),
            _ => Err(MeterError::InvalidMessage(
                "message must be a JSON object".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.method.as_deref() {
            Some(METHOD_INITIALIZE) => MessageKind::Handshake,
            Some(METHOD_TOOLS_CALL) => MessageKind::ToolCall,
            _ => MessageKind::Other,
        }
    }

    /// Tool name from `params.name`, if present and a non-empty string.
    pub fn tool_name(&self) -> Option<&str> {
        self.params
            .as_ref()?
            .get("name")?
            .as_str()
            .filter(|name| !name.is_empty())
    }

    /// Request id to echo in a synthesized response (`null` for notifications).
    pub fn response_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// Structured data attached to a gate rejection so an agent can decide
/// programmatically whether and how much to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionData {
    pub tool: Option<String>,
    pub price_minor_units: Option<i64>,
    pub payout_address: String,
    pub currency: String,
    pub retryable: bool,
    pub reason: String,
}

/// Application-level error the gate returns instead of forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRejection {
    pub code: i64,
    pub message: String,
    pub data: RejectionData,
}

impl GateRejection {
    /// Settlement failed: the call is not forwarded.
    pub fn payment_required(
        tool: &str,
        price_minor_units: i64,
        payout_address: &str,
        currency: &str,
        error: &SettlementError,
    ) -> Self {
        Self {
            code: PAYMENT_REQUIRED_CODE,
            message: "Payment required".to_string(),
            data: RejectionData {
                tool: Some(tool.to_string()),
                price_minor_units: Some(price_minor_units),
                payout_address: payout_address.to_string(),
                currency: currency.to_string(),
                retryable: error.is_retryable(),
                reason: error.reason_code().to_string(),
            },
        }
    }

    /// The tool is not registered for this provider (or no name was given).
    pub fn unknown_tool(tool: Option<&str>, payout_address: &str, currency: &str) -> Self {
        let reason = if tool.is_some() {
            "unknown_tool"
        } else {
            "missing_tool_name"
        };
        Self {
            code: UNKNOWN_TOOL_CODE,
            message: "Unknown tool".to_string(),
            data: RejectionData {
                tool: tool.map(String::from),
                price_minor_units: None,
                payout_address: payout_address.to_string(),
                currency: currency.to_string(),
                retryable: false,
                reason: reason.to_string(),
            },
        }
    }

    /// JSON-RPC 2.0 error response carrying this rejection.
    pub fn to_envelope(&self, id: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": self.code,
                "message": self.message,
                "data": self.data,
            }
        })
    }
}

/// Build a JSON-RPC request. Used when the proxy itself talks to an upstream.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Extract the JSON-RPC response from an upstream body.
///
/// Streamable HTTP servers may answer a POST with either plain JSON or an
/// event stream whose `data:` lines carry the response.
pub fn decode_response(content_type: Option<&str>, body: &str) -> Option<Value> {
    let is_stream = content_type
        .map(|ct| ct.starts_with(EVENT_STREAM))
        .unwrap_or(false);
    if !is_stream {
        return serde_json::from_str(body).ok();
    }
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|msg| msg.get("result").is_some() || msg.get("error").is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_methods() {
        let init = ProtocolMessage::parse(br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .unwrap();
        assert_eq!(init.kind(), MessageKind::Handshake);

        let call = ProtocolMessage::parse(
            br#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo"}}"#,
        )
        .unwrap();
        assert_eq!(call.kind(), MessageKind::ToolCall);
        assert_eq!(call.tool_name(), Some("echo"));

        let list = ProtocolMessage::parse(br#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#)
            .unwrap();
        assert_eq!(list.kind(), MessageKind::Other);

        // A response sent back by the caller has no method
        let reply = ProtocolMessage::parse(br#"{"jsonrpc":"2.0","id":4,"result":{}}"#).unwrap();
        assert_eq!(reply.kind(), MessageKind::Other);
    }

    #[test]
    fn test_tool_name_edge_cases() {
        let no_params =
            ProtocolMessage::parse(br#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#).unwrap();
        assert_eq!(no_params.tool_name(), None);

        let empty = ProtocolMessage::parse(
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":""}}"#,
        )
        .unwrap();
        assert_eq!(empty.tool_name(), None);

        let numeric = ProtocolMessage::parse(
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":5}}"#,
        )
        .unwrap();
        assert_eq!(numeric.tool_name(), None);
    }

    #[test]
    fn test_rejects_batches_and_garbage() {
        assert!(ProtocolMessage::parse(br#"[{"method":"tools/call"}]"#).is_err());
        assert!(ProtocolMessage::parse(b"42").is_err());
        assert!(ProtocolMessage::parse(b"not json").is_err());
    }

    #[test]
    fn test_payment_required_envelope() {
        let err = SettlementError::Transport("connection refused".into());
        let rejection = GateRejection::payment_required("echo", 100, "1Payout", "MNEE", &err);
        let envelope = rejection.to_envelope(&json!(7));

        assert_eq!(envelope["jsonrpc"], "2.0");
        assert_eq!(envelope["id"], 7);
        assert_eq!(envelope["error"]["code"], 40201);
        assert_eq!(envelope["error"]["data"]["tool"], "echo");
        assert_eq!(envelope["error"]["data"]["priceMinorUnits"], 100);
        assert_eq!(envelope["error"]["data"]["payoutAddress"], "1Payout");
        assert_eq!(envelope["error"]["data"]["currency"], "MNEE");
        assert_eq!(envelope["error"]["data"]["retryable"], true);
        assert_eq!(envelope["error"]["data"]["reason"], "rail_unreachable");
    }

    #[test]
    fn test_unknown_tool_envelope() {
        let rejection = GateRejection::unknown_tool(Some("nope"), "1Payout", "MNEE");
        let envelope = rejection.to_envelope(&Value::Null);
        assert_eq!(envelope["error"]["code"], -32602);
        assert_eq!(envelope["error"]["data"]["priceMinorUnits"], Value::Null);
        assert_eq!(envelope["error"]["data"]["retryable"], false);

        let missing = GateRejection::unknown_tool(None, "1Payout", "MNEE");
        assert_eq!(missing.data.reason, "missing_tool_name");
    }

    #[test]
    fn test_decode_response_json_and_sse() {
        let plain = decode_response(
            Some("application/json"),
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#,
        )
        .unwrap();
        assert!(plain["result"]["tools"].is_array());

        let sse = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\nevent: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n";
        let decoded = decode_response(Some("text/event-stream"), sse).unwrap();
        assert_eq!(decoded["result"]["ok"], true);

        assert!(decode_response(Some("text/event-stream"), "data: nope\n\n").is_none());
    }
}
