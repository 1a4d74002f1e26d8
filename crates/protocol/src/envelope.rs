use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::method::Method;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 frame. Requests and notifications carry `method`,
/// responses carry `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn request(method: Method, id: impl Into<Value>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: Some(method.wire_name()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: Method, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.wire_name()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: Value::Null,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: Value::Null,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Parsed method, with or without the `starlight.` prefix.
    pub fn parsed_method(&self) -> Option<Method> {
        self.method.as_deref().and_then(Method::parse)
    }

    /// The id rendered as a plain string, for correlation keys and log fields.
    pub fn id_string(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn to_text(&self) -> String {
        // Envelope only holds JSON values, so serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_methods_are_namespaced() {
        let env = Envelope::notification(Method::PreCheck, json!({"goal": "Login"}));
        let text = env.to_text();
        assert!(text.contains("\"method\":\"starlight.pre_check\""));
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn numeric_and_string_ids_render_as_strings() {
        let mut env = Envelope::response(Some(json!(7)), json!({}));
        assert_eq!(env.id_string().as_deref(), Some("7"));
        env.id = Some(json!("cmd-1"));
        assert_eq!(env.id_string().as_deref(), Some("cmd-1"));
        assert!(env.is_response());
    }
}
