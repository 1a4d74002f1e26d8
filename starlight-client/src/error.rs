use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach hub at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("hub closed the connection")]
    Closed,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("hub rejected the request ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("cannot sign registration token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("unexpected frame: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;
