//! Typed parameter payloads for each method.
//!
//! Field names follow the wire (camelCase where sentinels send camelCase);
//! aliases accept the snake_case spellings some SDKs emit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ContextMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationParams {
    pub layer: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(
        default,
        rename = "authToken",
        alias = "auth_token",
        skip_serializing_if = "Option::is_none"
    )]
    pub auth_token: Option<String>,
}

/// Reply to `registration`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationReply {
    pub success: bool,
    #[serde(rename = "assignedId")]
    pub assigned_id: String,
    pub challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeResponseParams {
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationAckParams {
    #[serde(rename = "assignedId")]
    pub assigned_id: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PulseParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
}

/// Upload paths may be sent as a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FileList {
    One(String),
    Many(Vec<String>),
}

impl FileList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            FileList::One(path) => vec![path],
            FileList::Many(paths) => paths,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntentParams {
    /// Empty when the client sent only a goal; see [`IntentParams::action`].
    #[serde(default, alias = "command", skip_serializing_if = "String::is_empty")]
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FileList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextMap>,
}

impl IntentParams {
    /// A goal without a command is a click on that goal.
    pub fn action(&self) -> ActionKind {
        if self.cmd.trim().is_empty() {
            return ActionKind::Click;
        }
        ActionKind::parse(&self.cmd)
    }

    /// Text to type or option to select: `value` wins over `text`.
    pub fn input(&self) -> Option<&str> {
        self.value.as_deref().or(self.text.as_deref())
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.files.clone().map(FileList::into_vec).unwrap_or_default()
    }

    /// Navigation target: explicit `url`, else a goal that looks like one.
    pub fn target_url(&self) -> Option<&str> {
        self.url.as_deref().or(self.goal.as_deref())
    }
}

/// Element flagged in a pre-check because it matches a sentinel's watch list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockingElement {
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "className", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, rename = "matchedBy", skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreCheckParams {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub url: String,
    #[serde(default)]
    pub snapshot: Value,
    #[serde(default)]
    pub blocking: Vec<BlockingElement>,
}

/// Round correlation shared by clear/wait/hijack/resume. Absent means the
/// currently active round.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClearParams {
    #[serde(default, alias = "roundId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WaitParams {
    #[serde(default, alias = "roundId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "retryAfterMs", alias = "retry_after_ms")]
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HijackParams {
    #[serde(default, alias = "roundId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
}

/// Remediation step a sentinel performs while it holds a hijack.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionParams {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FileList>,
}

impl ActionParams {
    pub fn action(&self) -> ActionKind {
        ActionKind::parse(&self.cmd)
    }

    pub fn input(&self) -> Option<&str> {
        self.value.as_deref().or(self.text.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResumeParams {
    #[serde(default, alias = "roundId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "request_recheck", alias = "reCheck")]
    pub re_check: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextUpdateParams {
    pub context: ContextMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SidetalkParams {
    pub from: String,
    pub to: String,
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, rename = "replyTo", alias = "reply_to", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl SidetalkParams {
    pub const BROADCAST: &'static str = "*";

    pub fn is_broadcast(&self) -> bool {
        self.to == Self::BROADCAST
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Undeliverable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SidetalkAckParams {
    #[serde(rename = "originalId")]
    pub original_id: Option<String>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "availableSentinels")]
    pub available_sentinels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShutdownParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Outcome envelope returned for every intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOutcome {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub result: CommandEvidence,
}

pub const COMMAND_COMPLETE: &str = "COMMAND_COMPLETE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEvidence {
    pub success: bool,
    #[serde(rename = "beforeScreenshot")]
    pub before_screenshot: Option<String>,
    #[serde(rename = "afterScreenshot")]
    pub after_screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub timestamp: String,
}

/// Closed set of page actions. Unknown commands land in `Generic`, which the
/// executor rejects instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    Select,
    Hover,
    Check,
    Uncheck,
    Scroll,
    Press,
    Type,
    Upload,
    Checkpoint,
    Generic(String),
}

impl ActionKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "goto" | "navigate" | "open" => ActionKind::Navigate,
            "click" | "tap" => ActionKind::Click,
            "fill" => ActionKind::Fill,
            "select" => ActionKind::Select,
            "hover" => ActionKind::Hover,
            "check" => ActionKind::Check,
            "uncheck" => ActionKind::Uncheck,
            "scroll" | "scroll_to" | "scroll_to_bottom" => ActionKind::Scroll,
            "press" | "key" | "keypress" | "key-press" | "key_press" => ActionKind::Press,
            "type" => ActionKind::Type,
            "upload" => ActionKind::Upload,
            "checkpoint" => ActionKind::Checkpoint,
            _ => ActionKind::Generic(raw.trim().to_string()),
        }
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self, ActionKind::Navigate)
    }

    /// Actions that touch a specific element and so need a target.
    pub fn needs_target(&self) -> bool {
        !matches!(
            self,
            ActionKind::Navigate | ActionKind::Checkpoint | ActionKind::Press | ActionKind::Generic(_)
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Navigate => "goto",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Select => "select",
            ActionKind::Hover => "hover",
            ActionKind::Check => "check",
            ActionKind::Uncheck => "uncheck",
            ActionKind::Scroll => "scroll",
            ActionKind::Press => "press",
            ActionKind::Type => "type",
            ActionKind::Upload => "upload",
            ActionKind::Checkpoint => "checkpoint",
            ActionKind::Generic(name) => name.as_str(),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_aliases_collapse_to_one_kind() {
        assert_eq!(ActionKind::parse("goto"), ActionKind::Navigate);
        assert_eq!(ActionKind::parse("NAVIGATE"), ActionKind::Navigate);
        assert_eq!(ActionKind::parse("keypress"), ActionKind::Press);
        assert_eq!(ActionKind::parse("key-press"), ActionKind::Press);
        assert_eq!(ActionKind::parse("Key_Press"), ActionKind::Press);
        assert_eq!(
            ActionKind::parse("drag"),
            ActionKind::Generic("drag".to_string())
        );
        assert!(ActionKind::Fill.needs_target());
        assert!(!ActionKind::Press.needs_target());
    }

    #[test]
    fn intent_accepts_single_file_or_list() {
        let one: IntentParams =
            serde_json::from_value(json!({"cmd": "upload", "files": "/tmp/a.txt"})).unwrap();
        assert_eq!(one.file_paths(), vec!["/tmp/a.txt".to_string()]);

        let many: IntentParams =
            serde_json::from_value(json!({"command": "upload", "files": ["/a", "/b"]})).unwrap();
        assert_eq!(many.file_paths().len(), 2);
    }

    #[test]
    fn intent_input_prefers_value_over_text() {
        let params = IntentParams {
            cmd: "fill".into(),
            value: Some("v".into()),
            text: Some("t".into()),
            ..Default::default()
        };
        assert_eq!(params.input(), Some("v"));
    }

    #[test]
    fn resume_accepts_request_recheck_spelling() {
        let params: ResumeParams = serde_json::from_value(json!({"request_recheck": true})).unwrap();
        assert!(params.re_check);
    }
}
