use std::time::Duration;

use serde_json::json;
use starlight_protocol::{CommandOutcome, IntentParams, Method};
use tracing::info;

use crate::error::ClientResult;
use crate::transport::Transport;

/// Default wait for an intent reply; covers a full consensus round plus
/// tiered execution.
pub const DEFAULT_INTENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends intents to the hub and waits for their completion envelopes.
pub struct IntentClient {
    transport: Transport,
    timeout: Duration,
}

impl IntentClient {
    pub async fn connect(url: &str) -> ClientResult<Self> {
        Ok(Self {
            transport: Transport::connect(url, "intent").await?,
            timeout: DEFAULT_INTENT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn intent(&mut self, params: &IntentParams) -> ClientResult<CommandOutcome> {
        let result = self
            .transport
            .request(Method::Intent, serde_json::to_value(params)?, self.timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn goto(&mut self, url: &str) -> ClientResult<CommandOutcome> {
        self.intent(&IntentParams {
            cmd: "goto".to_string(),
            url: Some(url.to_string()),
            ..IntentParams::default()
        })
        .await
    }

    pub async fn click(&mut self, goal: &str) -> ClientResult<CommandOutcome> {
        self.intent(&IntentParams {
            cmd: "click".to_string(),
            goal: Some(goal.to_string()),
            ..IntentParams::default()
        })
        .await
    }

    pub async fn fill(&mut self, goal: &str, value: &str) -> ClientResult<CommandOutcome> {
        self.intent(&IntentParams {
            cmd: "fill".to_string(),
            goal: Some(goal.to_string()),
            value: Some(value.to_string()),
            ..IntentParams::default()
        })
        .await
    }

    pub async fn checkpoint(&mut self, name: &str) -> ClientResult<CommandOutcome> {
        self.intent(&IntentParams {
            cmd: "checkpoint".to_string(),
            goal: Some(name.to_string()),
            ..IntentParams::default()
        })
        .await
    }

    /// Send a frame exactly as given. The hub may not answer it.
    pub async fn send_raw(&mut self, frame: &str) -> ClientResult<()> {
        self.transport.send_text(frame.to_string()).await
    }

    /// Ask the hub to end the mission.
    pub async fn finish(&mut self, reason: &str) -> ClientResult<()> {
        info!(reason, "requesting mission finish");
        self.transport
            .request(Method::Finish, json!({ "reason": reason }), self.timeout)
            .await?;
        Ok(())
    }

    pub async fn close(mut self) -> ClientResult<()> {
        self.transport.close().await
    }
}
