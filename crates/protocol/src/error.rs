use thiserror::Error;

use crate::schema::ValidationError;

/// JSON-RPC error codes used on the wire.
pub struct RpcCode;

impl RpcCode {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL: i32 = -32603;
    pub const EXECUTION_FAILED: i32 = -32001;
    pub const RESOLUTION_MISS: i32 = -32002;
    pub const UNAUTHORIZED: i32 = -32003;
}

/// Why the security gate refused a frame.
#[derive(Debug, Error)]
pub enum GateError {
    /// The frame is not a well-formed `starlight` envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The envelope is fine but its params fail the method schema.
    #[error("schema error in {method}: {}", summarize(.errors))]
    Schema {
        method: String,
        errors: Vec<ValidationError>,
    },
}

impl GateError {
    pub fn code(&self) -> i32 {
        match self {
            GateError::Protocol(_) => RpcCode::INVALID_REQUEST,
            GateError::UnknownMethod(_) => RpcCode::METHOD_NOT_FOUND,
            GateError::Schema { .. } => RpcCode::INVALID_PARAMS,
        }
    }

    /// Malformed envelopes are recorded as security events; schema misses are
    /// ordinary validation warnings. Neither is answered on the wire.
    pub fn is_security_event(&self) -> bool {
        matches!(self, GateError::Protocol(_) | GateError::UnknownMethod(_))
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
