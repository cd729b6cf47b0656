/// JSON-RPC method that opens an upstream session.
pub const METHOD_INITIALIZE: &str = "initialize";

/// JSON-RPC method that invokes a priced tool.
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// JSON-RPC method that lists an upstream's tools.
pub const METHOD_TOOLS_LIST: &str = "tools/list";

/// Header carrying the upstream session token (streamable HTTP transport).
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Header carrying the negotiated MCP protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Accept header sent upstream on unary calls.
pub const UNARY_ACCEPT: &str = "application/json, text/event-stream";

/// Content type of a server-push stream.
pub const EVENT_STREAM: &str = "text/event-stream";

/// Application error code for a tool call whose settlement failed.
pub const PAYMENT_REQUIRED_CODE: i64 = 40201;

/// JSON-RPC "invalid params", used for an unknown or missing tool name.
pub const UNKNOWN_TOOL_CODE: i64 = -32602;

/// Default settlement currency.
pub const DEFAULT_CURRENCY: &str = "MNEE";

/// Default number of decimal places between minor and major units.
pub const DEFAULT_MINOR_DECIMALS: u32 = 2;
