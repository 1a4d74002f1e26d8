use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::GateError;
use crate::method::Method;
use crate::redact::Redactor;
use crate::schema::{SchemaValidator, ENVELOPE_SCHEMA};

/// A frame that passed the gate.
///
/// `envelope` keeps the original values for the handlers that must act on
/// them (a fill really has to type the password). `redacted` is the scrubbed
/// copy and is the only form that may reach logs, the audit trail or other
/// sentinels.
#[derive(Debug, Clone)]
pub struct Screened {
    pub method: Method,
    pub envelope: Envelope,
    pub redacted: Value,
}

impl Screened {
    pub fn id(&self) -> Option<String> {
        self.envelope.id_string()
    }

    pub fn params<T: DeserializeOwned>(&self) -> Result<T, GateError> {
        let params = if self.envelope.params.is_null() {
            Value::Object(Default::default())
        } else {
            self.envelope.params.clone()
        };
        serde_json::from_value(params).map_err(|err| GateError::Schema {
            method: self.method.to_string(),
            errors: vec![crate::schema::ValidationError {
                path: "params".to_string(),
                reason: crate::schema::ValidationReason::TypeMismatch,
                detail: err.to_string(),
            }],
        })
    }

    pub fn redacted_params(&self) -> Value {
        self.redacted.get("params").cloned().unwrap_or(Value::Null)
    }
}

/// Inbound screening: envelope check, per-method schema, then redaction.
pub struct SecurityGate {
    validator: SchemaValidator,
    redactor: Redactor,
}

impl Default for SecurityGate {
    fn default() -> Self {
        Self::new(Redactor::default())
    }
}

impl SecurityGate {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            validator: SchemaValidator::new(),
            redactor,
        }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Screen a raw text frame.
    pub fn process(&self, raw: &str) -> Result<Screened, GateError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| GateError::Protocol(format!("malformed JSON: {err}")))?;
        self.process_value(&value)
    }

    /// Screen an already parsed frame. Pure: `frame` is not modified.
    pub fn process_value(&self, frame: &Value) -> Result<Screened, GateError> {
        let envelope_errors = self.validator.validate_against(&ENVELOPE_SCHEMA, frame);
        if let Some(first) = envelope_errors.first() {
            return Err(GateError::Protocol(first.to_string()));
        }

        let envelope: Envelope = serde_json::from_value(frame.clone())
            .map_err(|err| GateError::Protocol(format!("bad envelope: {err}")))?;
        let raw_method = envelope.method.clone().unwrap_or_default();
        let method =
            Method::parse(&raw_method).ok_or_else(|| GateError::UnknownMethod(raw_method.clone()))?;

        self.validator
            .validate(method, &envelope.params)
            .map_err(|errors| GateError::Schema {
                method: method.to_string(),
                errors,
            })?;

        let redacted = self.redactor.redact_value(frame);
        debug!(method = %method, "frame passed security gate");
        Ok(Screened {
            method,
            envelope,
            redacted,
        })
    }

    /// Scrub a value for logging without validating it.
    pub fn redact(&self, value: &Value) -> Value {
        self.redactor.redact_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::IntentParams;
    use serde_json::json;

    #[test]
    fn envelope_without_jsonrpc_is_a_protocol_error() {
        let gate = SecurityGate::default();
        let err = gate
            .process_value(&json!({"method": "starlight.intent", "params": {"cmd": "goto"}}))
            .unwrap_err();
        assert!(matches!(err, GateError::Protocol(_)));
        assert!(err.is_security_event());
    }

    #[test]
    fn unknown_method_is_reported() {
        let gate = SecurityGate::default();
        let err = gate
            .process(r#"{"jsonrpc":"2.0","method":"starlight.teleport","params":{}}"#)
            .unwrap_err();
        assert!(matches!(err, GateError::UnknownMethod(ref m) if m == "starlight.teleport"));
        assert_eq!(err.code(), -32601);
    }

    #[test]
    fn schema_failure_keeps_method_name() {
        let gate = SecurityGate::default();
        let err = gate
            .process(r#"{"jsonrpc":"2.0","id":"1","method":"starlight.intent","params":{"cmd":"click!"}}"#)
            .unwrap_err();
        match err {
            GateError::Schema { method, errors } => {
                assert_eq!(method, "intent");
                assert_eq!(errors[0].path, "params.cmd");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn goal_only_intent_is_a_click() {
        let gate = SecurityGate::default();
        let screened = gate
            .process(r#"{"jsonrpc":"2.0","id":"1","method":"starlight.intent","params":{"goal":"Login"}}"#)
            .unwrap();
        let params: IntentParams = screened.params().unwrap();
        assert!(params.cmd.is_empty());
        assert_eq!(params.action(), crate::params::ActionKind::Click);
        assert_eq!(params.goal.as_deref(), Some("Login"));
    }

    #[test]
    fn accepted_frame_keeps_original_values_and_scrubbed_copy() {
        let gate = SecurityGate::default();
        let raw = json!({
            "jsonrpc": "2.0",
            "id": "c1",
            "method": "intent",
            "params": {"cmd": "fill", "goal": "Email", "value": "user@example.com"}
        });
        let screened = gate.process_value(&raw).unwrap();
        assert_eq!(screened.method, Method::Intent);
        assert_eq!(screened.id().as_deref(), Some("c1"));

        let params: IntentParams = screened.params().unwrap();
        assert_eq!(params.value.as_deref(), Some("user@example.com"));
        assert_eq!(screened.redacted_params()["value"], "[REDACTED:EMAIL]");
        assert!(!screened.redacted.to_string().contains("user@example.com"));
        assert_eq!(raw["params"]["value"], "user@example.com");
    }
}
