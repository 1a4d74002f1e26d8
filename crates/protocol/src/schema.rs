//! Minimal JSON-Schema validation for method parameters.
//!
//! Supports the keywords the protocol schemas use: `type`, `required`,
//! `properties`, `items`, `enum`, `const`, `oneOf`, `anyOf`, `minLength`, `maxLength`,
//! `pattern`, `minimum` and `maximum`. Unknown keywords are ignored.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::method::Method;

/// A single validation failure with the JSON path where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub reason: ValidationReason,
    pub detail: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?} ({})", self.path, self.reason, self.detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationReason {
    MissingProperty,
    TypeMismatch,
    InvalidEnum,
    InvalidConst,
    NoVariantMatched,
    AmbiguousVariant,
    InvalidLength,
    PatternMismatch,
    OutOfRange,
}

/// Per-method parameter schemas with their patterns compiled up front.
pub struct SchemaValidator {
    schemas: HashMap<Method, Value>,
    patterns: HashMap<String, Regex>,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaValidator {
    pub fn new() -> Self {
        let schemas = builtin_schemas();
        let mut patterns = HashMap::new();
        for schema in schemas.values() {
            collect_patterns(schema, &mut patterns);
        }
        Self { schemas, patterns }
    }

    pub fn schema_for(&self, method: Method) -> Option<&Value> {
        self.schemas.get(&method)
    }

    /// Validate `params` for `method`. Methods without a schema accept any
    /// object (or no params at all).
    pub fn validate(&self, method: Method, params: &Value) -> Result<(), Vec<ValidationError>> {
        let empty = json!({});
        let params = if params.is_null() { &empty } else { params };
        let mut errors = Vec::new();
        match self.schemas.get(&method) {
            Some(schema) => self.check(schema, params, "params", &mut errors),
            None => {
                if !params.is_object() {
                    errors.push(ValidationError {
                        path: "params".to_string(),
                        reason: ValidationReason::TypeMismatch,
                        detail: "expected object".to_string(),
                    });
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate an arbitrary value against an arbitrary schema.
    pub fn validate_against(&self, schema: &Value, value: &Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        self.check(schema, value, "$", &mut errors);
        errors
    }

    fn check(&self, schema: &Value, value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
        let Some(rules) = schema.as_object() else {
            return;
        };

        if let Some(expected) = rules.get("type") {
            if !type_matches(expected, value) {
                errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::TypeMismatch,
                    detail: format!("expected {}, got {}", expected, type_name(value)),
                });
                return;
            }
        }

        if let Some(constant) = rules.get("const") {
            if constant != value {
                errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::InvalidConst,
                    detail: format!("expected {constant}"),
                });
            }
        }

        if let Some(Value::Array(allowed)) = rules.get("enum") {
            if !allowed.contains(value) {
                errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::InvalidEnum,
                    detail: format!("{value} not in {}", Value::Array(allowed.clone())),
                });
            }
        }

        if let Some(Value::Array(variants)) = rules.get("oneOf") {
            let matched = variants
                .iter()
                .filter(|variant| {
                    let mut scratch = Vec::new();
                    self.check(variant, value, path, &mut scratch);
                    scratch.is_empty()
                })
                .count();
            match matched {
                1 => {}
                0 => errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::NoVariantMatched,
                    detail: "matches none of oneOf".to_string(),
                }),
                n => errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::AmbiguousVariant,
                    detail: format!("matches {n} oneOf variants"),
                }),
            }
        }

        if let Some(Value::Array(variants)) = rules.get("anyOf") {
            let any = variants.iter().any(|variant| {
                let mut scratch = Vec::new();
                self.check(variant, value, path, &mut scratch);
                scratch.is_empty()
            });
            if !any {
                errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::NoVariantMatched,
                    detail: "matches none of anyOf".to_string(),
                });
            }
        }

        match value {
            Value::String(text) => self.check_string(rules, text, path, errors),
            Value::Number(number) => {
                let n = number.as_f64().unwrap_or_default();
                if let Some(min) = rules.get("minimum").and_then(Value::as_f64) {
                    if n < min {
                        errors.push(out_of_range(path, n, "minimum", min));
                    }
                }
                if let Some(max) = rules.get("maximum").and_then(Value::as_f64) {
                    if n > max {
                        errors.push(out_of_range(path, n, "maximum", max));
                    }
                }
            }
            Value::Array(items) => {
                if let Some(item_schema) = rules.get("items") {
                    for (idx, item) in items.iter().enumerate() {
                        self.check(item_schema, item, &format!("{path}[{idx}]"), errors);
                    }
                }
            }
            Value::Object(map) => {
                if let Some(Value::Array(required)) = rules.get("required") {
                    for key in required.iter().filter_map(Value::as_str) {
                        if !map.contains_key(key) {
                            errors.push(ValidationError {
                                path: format!("{path}.{key}"),
                                reason: ValidationReason::MissingProperty,
                                detail: "required".to_string(),
                            });
                        }
                    }
                }
                if let Some(Value::Object(properties)) = rules.get("properties") {
                    for (key, property_schema) in properties {
                        if let Some(child) = map.get(key) {
                            // Explicit nulls are treated as absent optional fields.
                            if child.is_null() {
                                continue;
                            }
                            self.check(property_schema, child, &format!("{path}.{key}"), errors);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn check_string(
        &self,
        rules: &serde_json::Map<String, Value>,
        text: &str,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        let len = text.chars().count() as u64;
        if let Some(min) = rules.get("minLength").and_then(Value::as_u64) {
            if len < min {
                errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::InvalidLength,
                    detail: format!("length {len} < {min}"),
                });
            }
        }
        if let Some(max) = rules.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::InvalidLength,
                    detail: format!("length {len} > {max}"),
                });
            }
        }
        if let Some(pattern) = rules.get("pattern").and_then(Value::as_str) {
            let matched = match self.patterns.get(pattern) {
                Some(re) => re.is_match(text),
                None => Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false),
            };
            if !matched {
                errors.push(ValidationError {
                    path: path.to_string(),
                    reason: ValidationReason::PatternMismatch,
                    detail: format!("does not match /{pattern}/"),
                });
            }
        }
    }
}

fn out_of_range(path: &str, value: f64, bound: &str, limit: f64) -> ValidationError {
    ValidationError {
        path: path.to_string(),
        reason: ValidationReason::OutOfRange,
        detail: format!("{value} violates {bound} {limit}"),
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(name, value)),
        _ => true,
    }
}

fn single_type_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn collect_patterns(schema: &Value, out: &mut HashMap<String, Regex>) {
    match schema {
        Value::Object(map) => {
            if let Some(pattern) = map.get("pattern").and_then(Value::as_str) {
                if let Ok(re) = Regex::new(pattern) {
                    out.insert(pattern.to_string(), re);
                }
            }
            for child in map.values() {
                collect_patterns(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_patterns(item, out);
            }
        }
        _ => {}
    }
}

/// Envelope-level schema, applied before the method is known.
pub static ENVELOPE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["jsonrpc", "method"],
        "properties": {
            "jsonrpc": { "const": "2.0" },
            "method": { "type": "string", "minLength": 1, "maxLength": 128 },
            "id": { "type": ["string", "integer"] },
            "params": { "type": "object" }
        }
    })
});

fn builtin_schemas() -> HashMap<Method, Value> {
    let round_id = json!({ "type": "string", "maxLength": 128 });
    let string_list = json!({ "type": "array", "items": { "type": "string", "maxLength": 512 } });
    let files = json!({
        "oneOf": [
            { "type": "string", "minLength": 1 },
            { "type": "array", "items": { "type": "string", "minLength": 1 } }
        ]
    });

    let mut schemas = HashMap::new();
    schemas.insert(
        Method::Registration,
        json!({
            "type": "object",
            "required": ["layer"],
            "properties": {
                "layer": { "type": "string", "minLength": 1, "maxLength": 64, "pattern": "^[A-Za-z0-9_.:-]+$" },
                "priority": { "type": "integer", "minimum": 0, "maximum": 255 },
                "capabilities": string_list.clone(),
                "selectors": string_list.clone(),
                "version": { "type": "string", "maxLength": 64 },
                "authToken": { "type": "string", "maxLength": 4096 }
            }
        }),
    );
    schemas.insert(
        Method::ChallengeResponse,
        json!({
            "type": "object",
            "required": ["response"],
            "properties": { "response": { "type": "string", "minLength": 1, "maxLength": 256 } }
        }),
    );
    schemas.insert(
        Method::Pulse,
        json!({
            "type": "object",
            "properties": { "health": { "type": "string", "maxLength": 64 } }
        }),
    );
    schemas.insert(
        Method::Intent,
        json!({
            "type": "object",
            "anyOf": [{ "required": ["cmd"] }, { "required": ["goal"] }],
            "properties": {
                "cmd": { "type": "string", "minLength": 1, "maxLength": 64, "pattern": "^[A-Za-z_-]+$" },
                "goal": { "type": "string", "minLength": 1, "maxLength": 1024 },
                "selector": { "type": "string", "minLength": 1, "maxLength": 4096 },
                "url": { "type": "string", "maxLength": 8192 },
                "value": { "type": "string", "maxLength": 65536 },
                "text": { "type": "string", "maxLength": 65536 },
                "key": { "type": "string", "minLength": 1, "maxLength": 64 },
                "files": files.clone(),
                "context": { "type": "object" }
            }
        }),
    );
    schemas.insert(
        Method::Clear,
        json!({
            "type": "object",
            "properties": {
                "id": round_id.clone(),
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
            }
        }),
    );
    schemas.insert(
        Method::Wait,
        json!({
            "type": "object",
            "properties": {
                "id": round_id.clone(),
                "retryAfterMs": { "type": "integer", "minimum": 0 }
            }
        }),
    );
    schemas.insert(
        Method::Hijack,
        json!({
            "type": "object",
            "required": ["reason"],
            "properties": {
                "id": round_id.clone(),
                "reason": { "type": "string", "minLength": 1, "maxLength": 2048 },
                "complexity": { "enum": ["low", "medium", "high"] }
            }
        }),
    );
    schemas.insert(
        Method::Action,
        json!({
            "type": "object",
            "required": ["cmd"],
            "properties": {
                "cmd": {
                    "enum": ["click", "fill", "select", "hover", "check", "uncheck",
                             "scroll", "press", "key-press", "key_press", "type", "upload",
                             "goto", "navigate"]
                },
                "selector": { "type": "string", "maxLength": 4096 },
                "goal": { "type": "string", "maxLength": 1024 },
                "text": { "type": "string" },
                "value": { "type": "string" },
                "key": { "type": "string", "maxLength": 64 },
                "files": files
            }
        }),
    );
    schemas.insert(
        Method::Resume,
        json!({
            "type": "object",
            "properties": {
                "id": round_id,
                "re_check": { "type": "boolean" },
                "request_recheck": { "type": "boolean" }
            }
        }),
    );
    schemas.insert(
        Method::ContextUpdate,
        json!({
            "type": "object",
            "required": ["context"],
            "properties": { "context": { "type": "object" } }
        }),
    );
    schemas.insert(
        Method::Sidetalk,
        json!({
            "type": "object",
            "required": ["from", "to", "topic"],
            "properties": {
                "from": { "type": "string", "minLength": 1, "maxLength": 64 },
                "to": { "type": "string", "minLength": 1, "maxLength": 64 },
                "topic": { "type": "string", "minLength": 1, "maxLength": 128, "pattern": "^[A-Za-z0-9_.:/-]+$" },
                "replyTo": { "type": "string", "maxLength": 128 }
            }
        }),
    );
    let shutdown = json!({
        "type": "object",
        "properties": {
            "reason": { "type": "string", "maxLength": 1024 },
            "success": { "type": "boolean" }
        }
    });
    schemas.insert(Method::Shutdown, shutdown.clone());
    schemas.insert(Method::Finish, shutdown);
    schemas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_field_is_reported_with_path() {
        let validator = SchemaValidator::new();
        let errors = validator
            .validate(Method::Hijack, &json!({"confidence": 1}))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "params.reason");
        assert_eq!(errors[0].reason, ValidationReason::MissingProperty);
    }

    #[test]
    fn one_of_accepts_exactly_one_shape() {
        let validator = SchemaValidator::new();
        assert!(validator
            .validate(Method::Intent, &json!({"cmd": "upload", "files": "/tmp/x"}))
            .is_ok());
        assert!(validator
            .validate(Method::Intent, &json!({"cmd": "upload", "files": ["/a", "/b"]}))
            .is_ok());
        let errors = validator
            .validate(Method::Intent, &json!({"cmd": "upload", "files": 42}))
            .unwrap_err();
        assert_eq!(errors[0].reason, ValidationReason::NoVariantMatched);
    }

    #[test]
    fn enum_and_pattern_are_enforced() {
        let validator = SchemaValidator::new();
        let errors = validator
            .validate(Method::Action, &json!({"cmd": "rm -rf"}))
            .unwrap_err();
        assert_eq!(errors[0].reason, ValidationReason::InvalidEnum);

        let errors = validator
            .validate(Method::Registration, &json!({"layer": "bad layer!"}))
            .unwrap_err();
        assert_eq!(errors[0].reason, ValidationReason::PatternMismatch);
    }

    #[test]
    fn intent_needs_a_command_or_a_goal() {
        let validator = SchemaValidator::new();
        assert!(validator.validate(Method::Intent, &json!({"goal": "Login"})).is_ok());
        assert!(validator.validate(Method::Intent, &json!({"cmd": "checkpoint"})).is_ok());
        assert!(validator.validate(Method::Intent, &json!({"cmd": "key-press", "key": "Enter"})).is_ok());

        let errors = validator
            .validate(Method::Intent, &json!({"selector": "#login"}))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "params");
        assert_eq!(errors[0].reason, ValidationReason::NoVariantMatched);
    }

    #[test]
    fn string_bounds_and_numeric_ranges() {
        let validator = SchemaValidator::new();
        let errors = validator
            .validate(Method::Hijack, &json!({"reason": ""}))
            .unwrap_err();
        assert_eq!(errors[0].reason, ValidationReason::InvalidLength);

        let errors = validator
            .validate(Method::Clear, &json!({"confidence": 1.5}))
            .unwrap_err();
        assert_eq!(errors[0].reason, ValidationReason::OutOfRange);
    }

    #[test]
    fn methods_without_schema_still_require_objects() {
        let validator = SchemaValidator::new();
        assert!(validator.validate(Method::Entropy, &Value::Null).is_ok());
        assert!(validator.validate(Method::Entropy, &json!([1, 2])).is_err());
    }

    #[test]
    fn envelope_schema_rejects_wrong_version() {
        let validator = SchemaValidator::new();
        let errors = validator.validate_against(
            &ENVELOPE_SCHEMA,
            &json!({"jsonrpc": "1.0", "method": "starlight.pulse"}),
        );
        assert_eq!(errors[0].reason, ValidationReason::InvalidConst);
    }
}
