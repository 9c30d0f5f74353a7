//! Error codes used by the action service.

// Standard JSON-RPC 2.0 codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application codes, allocated downward from -32000.
pub const AUTH_ERROR: i64 = -32000;
pub const CONFIG_ERROR: i64 = -32001;
pub const EXECUTION_ERROR: i64 = -32002;
pub const NOT_FOUND_ERROR: i64 = -32003;
pub const VALIDATION_ERROR: i64 = -32004;
