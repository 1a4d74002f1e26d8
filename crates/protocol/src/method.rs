use std::fmt;
use std::str::FromStr;

pub const METHOD_NAMESPACE: &str = "starlight.";

/// Every method the hub understands, inbound or outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Registration,
    ChallengeResponse,
    RegistrationAck,
    Pulse,
    Intent,
    PreCheck,
    Clear,
    Wait,
    Hijack,
    Action,
    Resume,
    ContextUpdate,
    SovereignUpdate,
    Sidetalk,
    SidetalkAck,
    CommandComplete,
    Entropy,
    Shutdown,
    Finish,
}

impl Method {
    pub const ALL: [Method; 19] = [
        Method::Registration,
        Method::ChallengeResponse,
        Method::RegistrationAck,
        Method::Pulse,
        Method::Intent,
        Method::PreCheck,
        Method::Clear,
        Method::Wait,
        Method::Hijack,
        Method::Action,
        Method::Resume,
        Method::ContextUpdate,
        Method::SovereignUpdate,
        Method::Sidetalk,
        Method::SidetalkAck,
        Method::CommandComplete,
        Method::Entropy,
        Method::Shutdown,
        Method::Finish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Registration => "registration",
            Method::ChallengeResponse => "challenge_response",
            Method::RegistrationAck => "registration_ack",
            Method::Pulse => "pulse",
            Method::Intent => "intent",
            Method::PreCheck => "pre_check",
            Method::Clear => "clear",
            Method::Wait => "wait",
            Method::Hijack => "hijack",
            Method::Action => "action",
            Method::Resume => "resume",
            Method::ContextUpdate => "context_update",
            Method::SovereignUpdate => "sovereign_update",
            Method::Sidetalk => "sidetalk",
            Method::SidetalkAck => "sidetalk_ack",
            Method::CommandComplete => "command_complete",
            Method::Entropy => "entropy_stream",
            Method::Shutdown => "shutdown",
            Method::Finish => "finish",
        }
    }

    pub fn wire_name(self) -> String {
        format!("{METHOD_NAMESPACE}{}", self.as_str())
    }

    /// Accepts both `starlight.clear` and bare `clear`.
    pub fn parse(raw: &str) -> Option<Self> {
        let bare = raw.trim();
        let bare = bare.strip_prefix(METHOD_NAMESPACE).unwrap_or(bare);
        match bare {
            "entropy" => Some(Method::Entropy),
            "challenge" => Some(Method::ChallengeResponse),
            other => Method::ALL.into_iter().find(|m| m.as_str() == other),
        }
    }

    /// Heartbeats are high volume and carry no forensic value.
    pub fn is_audited(self) -> bool {
        !matches!(self, Method::Pulse | Method::Entropy)
    }

    /// Methods only a verified sentinel may send.
    pub fn requires_sentinel(self) -> bool {
        matches!(
            self,
            Method::Pulse
                | Method::Clear
                | Method::Wait
                | Method::Hijack
                | Method::Action
                | Method::Resume
                | Method::ContextUpdate
                | Method::Sidetalk
                | Method::Entropy
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::parse(s).ok_or_else(|| format!("unknown method '{s}'"))
    }
}
