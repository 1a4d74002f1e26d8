//! Sensitive-data scrubbing for everything the hub logs or persists.
//!
//! Two passes over a JSON value: values stored under sensitive keys are
//! replaced wholesale with a category tag, and every remaining string is
//! scanned for PII patterns which are replaced in place.

use regex::Regex;
use serde_json::{Map, Value};

struct PiiRule {
    category: &'static str,
    pattern: Regex,
}

/// Key fragments (lowercase, separators stripped) and the tag they map to.
/// Fragments inside a longer word count, e.g. `userPassword`.
const SENSITIVE_FRAGMENTS: &[(&str, &str)] = &[
    ("password", "PASSWORD"),
    ("passwd", "PASSWORD"),
    ("passphrase", "PASSWORD"),
    ("secret", "SECRET"),
    ("token", "TOKEN"),
    ("apikey", "API_KEY"),
    ("authorization", "CREDENTIAL"),
    ("credential", "CREDENTIAL"),
    ("cookie", "CREDENTIAL"),
    ("cardnumber", "CREDIT_CARD"),
    ("creditcard", "CREDIT_CARD"),
];

/// Short names that only count as a whole word (`className` is not an SSN).
const SENSITIVE_WORDS: &[(&str, &str)] = &[("ssn", "SSN"), ("cvv", "CREDIT_CARD"), ("pin", "PIN")];

/// PII redactor for protocol payloads.
pub struct Redactor {
    rules: Vec<PiiRule>,
    scan_strings: bool,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Redactor {
    /// `scan_strings = false` keeps key-based redaction but skips the
    /// pattern pass over free text.
    pub fn new(scan_strings: bool) -> Self {
        // Order matters: card and SSN shapes would otherwise be eaten by the
        // phone rule.
        let builtin: [(&'static str, &str); 6] = [
            ("EMAIL", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
            ("CREDIT_CARD", r"\b(?:\d[ -]?){12,15}\d\b"),
            ("SSN", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("PHONE", r"(?:\+?1[-.\s]?)?\(?\b\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}\b"),
            ("IP", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
            ("DOB", r"\b(?:0?[1-9]|1[0-2])/(?:0?[1-9]|[12]\d|3[01])/(?:19|20)\d{2}\b"),
        ];
        let rules = builtin
            .into_iter()
            .filter_map(|(category, pattern)| {
                Regex::new(pattern).ok().map(|pattern| PiiRule { category, pattern })
            })
            .collect();
        Self {
            rules,
            scan_strings,
        }
    }

    /// Scrub a single string.
    pub fn redact_str(&self, input: &str) -> String {
        if !self.scan_strings {
            return input.to_string();
        }
        let mut out = input.to_string();
        for rule in &self.rules {
            if rule.pattern.is_match(&out) {
                let tag = format!("[REDACTED:{}]", rule.category);
                out = rule.pattern.replace_all(&out, tag.as_str()).into_owned();
            }
        }
        out
    }

    /// Deep copy of `value` with sensitive content replaced. The input is
    /// never touched.
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.redact_str(text)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    let scrubbed = match sensitive_category(key) {
                        Some(category) if !child.is_null() => {
                            Value::String(format!("[REDACTED:{category}]"))
                        }
                        _ => self.redact_value(child),
                    };
                    out.insert(key.clone(), scrubbed);
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

/// Category tag for keys that always hold secrets, e.g. `authToken` or
/// `card_number`.
pub fn sensitive_category(key: &str) -> Option<&'static str> {
    let normalized: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if let Some((_, category)) = SENSITIVE_FRAGMENTS
        .iter()
        .find(|(fragment, _)| normalized.contains(fragment))
    {
        return Some(category);
    }
    let words = key_words(key);
    SENSITIVE_WORDS
        .iter()
        .find(|(word, _)| words.iter().any(|w| w == word))
        .map(|(_, category)| *category)
}

/// Split `userSsn`, `user_ssn` and `user-ssn` into lowercase words.
fn key_words(key: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in key.chars() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_ascii_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
