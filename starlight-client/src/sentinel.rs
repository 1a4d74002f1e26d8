//! A sentinel's side of the hub protocol.
//!
//! [`SentinelSession::connect`] performs the full handshake: registration,
//! echoing the challenge, and waiting for `registration_ack`. After that the
//! session receives `pre_check` broadcasts through [`SentinelSession::next_event`]
//! and answers with clear, wait or hijack.

use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use starlight_protocol::{
    ActionParams, ContextMap, Envelope, Method, PreCheckParams, RegistrationAckParams, RegistrationReply,
    SidetalkAckParams, SidetalkParams,
};
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Default)]
pub struct SentinelOptions {
    pub layer: String,
    pub priority: u8,
    pub capabilities: Vec<String>,
    /// Selectors this sentinel watches for; matches show up in `blocking`.
    pub selectors: Vec<String>,
    pub auth_token: Option<String>,
    /// Shared HS256 secret; the session signs a token for its layer.
    pub jwt_secret: Option<String>,
}

impl SentinelOptions {
    pub fn new(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            priority: 5,
            ..Self::default()
        }
    }

    pub fn watching<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    /// Token to present at registration: an explicit token, else one signed
    /// with the JWT secret.
    fn registration_token(&self) -> ClientResult<Option<String>> {
        if let Some(token) = &self.auth_token {
            return Ok(Some(token.clone()));
        }
        match &self.jwt_secret {
            Some(secret) => Ok(Some(sign_registration(secret, &self.layer, TOKEN_TTL_SECS)?)),
            None => Ok(None),
        }
    }
}

#[derive(Serialize)]
struct RegistrationClaims<'a> {
    sub: &'a str,
    iat: i64,
    exp: i64,
    iss: &'static str,
}

/// HS256 token whose subject is the sentinel's layer.
pub fn sign_registration(secret: &str, layer: &str, ttl_secs: i64) -> ClientResult<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = RegistrationClaims {
        sub: layer,
        iat: now,
        exp: now + ttl_secs,
        iss: "starlight-client",
    };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}

/// What the hub pushed to this sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    PreCheck(PreCheckParams),
    CommandComplete(Value),
    SovereignUpdate(ContextMap),
    Sidetalk(SidetalkParams),
    SidetalkAck(SidetalkAckParams),
    Entropy(Value),
    Other(Envelope),
}

pub struct SentinelSession {
    transport: Transport,
    layer: String,
    assigned_id: String,
}

impl SentinelSession {
    pub async fn connect(url: &str, options: SentinelOptions) -> ClientResult<Self> {
        let mut transport = Transport::connect(url, "sentinel").await?;

        let mut registration = json!({
            "layer": options.layer,
            "priority": options.priority,
            "capabilities": options.capabilities,
            "selectors": options.selectors,
            "version": env!("CARGO_PKG_VERSION"),
        });
        if let Some(token) = options.registration_token()? {
            registration["authToken"] = Value::String(token);
        }
        let reply: RegistrationReply = serde_json::from_value(
            transport
                .request(Method::Registration, registration, HANDSHAKE_TIMEOUT)
                .await?,
        )?;
        transport
            .request(
                Method::ChallengeResponse,
                json!({ "response": reply.challenge }),
                HANDSHAKE_TIMEOUT,
            )
            .await?;

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        let mut early = Vec::new();
        let ack = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Some(envelope) = transport.next(remaining).await? else {
                return Err(ClientError::Timeout("registration_ack".to_string()));
            };
            if envelope.parsed_method() == Some(Method::RegistrationAck) {
                break serde_json::from_value::<RegistrationAckParams>(envelope.params)?;
            }
            early.push(envelope);
        };
        for envelope in early.into_iter().rev() {
            transport.push_front(envelope);
        }

        info!(layer = %options.layer, assigned_id = %ack.assigned_id, protocol = %ack.protocol_version, "sentinel verified");
        Ok(Self {
            transport,
            layer: options.layer,
            assigned_id: ack.assigned_id,
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn assigned_id(&self) -> &str {
        &self.assigned_id
    }

    /// Next pushed event, or `None` if nothing arrived within `wait`.
    pub async fn next_event(&mut self, wait: Duration) -> ClientResult<Option<HubEvent>> {
        let Some(envelope) = self.transport.next(wait).await? else {
            return Ok(None);
        };
        let event = match envelope.parsed_method() {
            Some(Method::PreCheck) => HubEvent::PreCheck(serde_json::from_value(envelope.params)?),
            Some(Method::CommandComplete) => HubEvent::CommandComplete(envelope.params),
            Some(Method::SovereignUpdate) => {
                let context = envelope.params.get("context").cloned().unwrap_or(Value::Null);
                HubEvent::SovereignUpdate(serde_json::from_value(context).unwrap_or_default())
            }
            Some(Method::Sidetalk) => HubEvent::Sidetalk(serde_json::from_value(envelope.params)?),
            Some(Method::SidetalkAck) => HubEvent::SidetalkAck(serde_json::from_value(envelope.params)?),
            Some(Method::Entropy) => HubEvent::Entropy(envelope.params),
            _ => HubEvent::Other(envelope),
        };
        Ok(Some(event))
    }

    /// Wait for the next `pre_check`, skipping everything else.
    pub async fn next_pre_check(&mut self, wait: Duration) -> ClientResult<Option<PreCheckParams>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_event(remaining).await? {
                Some(HubEvent::PreCheck(pre_check)) => return Ok(Some(pre_check)),
                Some(other) => debug!(event = ?other, "skipping while waiting for pre_check"),
                None => return Ok(None),
            }
        }
    }

    pub async fn pulse(&mut self, health: &str) -> ClientResult<()> {
        self.transport
            .notify(Method::Pulse, json!({ "health": health }))
            .await
    }

    pub async fn clear(&mut self, round: Option<&str>) -> ClientResult<()> {
        self.transport.notify(Method::Clear, round_params(round)).await
    }

    pub async fn wait(&mut self, round: Option<&str>, retry_after: Duration) -> ClientResult<()> {
        let mut params = round_params(round);
        params["retryAfterMs"] = json!(retry_after.as_millis() as u64);
        self.transport.notify(Method::Wait, params).await
    }

    pub async fn hijack(&mut self, round: Option<&str>, reason: &str) -> ClientResult<()> {
        let mut params = round_params(round);
        params["reason"] = json!(reason);
        self.transport.notify(Method::Hijack, params).await
    }

    pub async fn action(&mut self, action: &ActionParams) -> ClientResult<()> {
        self.transport
            .notify(Method::Action, serde_json::to_value(action)?)
            .await
    }

    pub async fn click(&mut self, selector: &str) -> ClientResult<()> {
        self.action(&ActionParams {
            cmd: "click".to_string(),
            selector: Some(selector.to_string()),
            ..ActionParams::default()
        })
        .await
    }

    pub async fn resume(&mut self, round: Option<&str>, re_check: bool) -> ClientResult<()> {
        let mut params = round_params(round);
        params["re_check"] = json!(re_check);
        self.transport.notify(Method::Resume, params).await
    }

    pub async fn context_update(&mut self, context: ContextMap) -> ClientResult<()> {
        self.transport
            .notify(Method::ContextUpdate, json!({ "context": context }))
            .await
    }

    /// Message another sentinel by layer, or every sentinel with `*`.
    pub async fn sidetalk(&mut self, to: &str, topic: &str, payload: Value) -> ClientResult<()> {
        let id = self.transport.next_id();
        let params = SidetalkParams {
            from: self.layer.clone(),
            to: to.to_string(),
            topic: topic.to_string(),
            payload,
            reply_to: None,
        };
        self.transport
            .send(&Envelope::request(Method::Sidetalk, id, serde_json::to_value(params)?))
            .await
    }

    pub async fn close(mut self) -> ClientResult<()> {
        self.transport.close().await
    }
}

fn round_params(round: Option<&str>) -> Value {
    match round {
        Some(id) => json!({ "id": id }),
        None => json!({}),
    }
}
