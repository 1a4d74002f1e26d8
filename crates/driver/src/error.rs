use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to connect to browser at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("{method} timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    #[error("CDP error {code}: {message}")]
    Cdp { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("page script failed: {0}")]
    Script(String),

    #[error("element {0} is no longer attached")]
    Detached(String),

    #[error("driver is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
