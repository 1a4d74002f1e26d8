//! Starlight client library.
//!
//! Two roles talk to the hub: intent clients, which ask for page actions and
//! wait for their outcome, and sentinels, which watch every risky action and
//! may clear, hold or hijack it. [`IntentClient`] and [`SentinelSession`]
//! cover both over the hub's WebSocket endpoint.

mod error;
mod intent;
mod sentinel;
mod transport;

pub use error::{ClientError, ClientResult};
pub use intent::{IntentClient, DEFAULT_INTENT_TIMEOUT};
pub use sentinel::{sign_registration, HubEvent, SentinelOptions, SentinelSession};

/// Hub address used when neither a flag nor `HUB_URL` says otherwise.
pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:8080";

/// Environment variable the hub sets for the sentinels it launches.
pub const HUB_URL_ENV: &str = "HUB_URL";

/// Hub URL from the environment, falling back to [`DEFAULT_HUB_URL`].
pub fn hub_url_from_env() -> String {
    std::env::var(HUB_URL_ENV)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HUB_URL.to_string())
}
