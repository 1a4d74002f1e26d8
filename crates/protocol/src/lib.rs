//! Starlight wire protocol.
//!
//! Every frame exchanged between the hub, its sentinels and intent clients is a
//! JSON-RPC 2.0 envelope whose method lives in the `starlight.` namespace. This
//! crate owns the envelope, the closed set of methods, the typed parameter
//! payloads and the [`SecurityGate`] that screens every inbound frame before the
//! hub acts on it or writes it anywhere.

pub mod envelope;
pub mod error;
pub mod gate;
pub mod method;
pub mod params;
pub mod redact;
pub mod schema;

pub use envelope::{Envelope, RpcError, JSONRPC_VERSION};
pub use error::{GateError, RpcCode};
pub use gate::{Screened, SecurityGate};
pub use method::{Method, METHOD_NAMESPACE};
pub use params::*;
pub use redact::Redactor;
pub use schema::{SchemaValidator, ValidationError, ValidationReason};

/// Version announced to sentinels in `registration_ack`.
pub const PROTOCOL_VERSION: &str = "1.0.0";
