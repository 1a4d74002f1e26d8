//! One WebSocket connection to the hub, speaking envelopes.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use starlight_protocol::{Envelope, Method};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct Transport {
    writer: SplitSink<Socket, Message>,
    reader: SplitStream<Socket>,
    /// Frames that arrived while waiting for a specific response.
    backlog: VecDeque<Envelope>,
    prefix: &'static str,
    next_id: u64,
}

impl Transport {
    pub(crate) async fn connect(url: &str, prefix: &'static str) -> ClientResult<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|source| ClientError::Connect {
                url: url.to_string(),
                source,
            })?;
        let (writer, reader) = socket.split();
        debug!(url, "connected to hub");
        Ok(Self {
            writer,
            reader,
            backlog: VecDeque::new(),
            prefix,
            next_id: 1,
        })
    }

    pub(crate) fn next_id(&mut self) -> String {
        let id = format!("{}-{}", self.prefix, self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) async fn send(&mut self, envelope: &Envelope) -> ClientResult<()> {
        self.send_text(envelope.to_text()).await
    }

    pub(crate) async fn send_text(&mut self, text: String) -> ClientResult<()> {
        trace!(frame = %text, "sending");
        self.writer.send(Message::Text(text)).await?;
        Ok(())
    }

    pub(crate) async fn notify(&mut self, method: Method, params: Value) -> ClientResult<()> {
        self.send(&Envelope::notification(method, params)).await
    }

    /// Send a request and wait for the response carrying its id. Anything
    /// else that arrives meanwhile is kept for [`Transport::next`].
    pub(crate) async fn request(&mut self, method: Method, params: Value, wait: Duration) -> ClientResult<Value> {
        let id = self.next_id();
        self.send(&Envelope::request(method, id.clone(), params)).await?;

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let envelope = match tokio::time::timeout(remaining, self.read()).await {
                Ok(frame) => frame?,
                Err(_) => return Err(ClientError::Timeout(format!("reply to {method}"))),
            };
            if envelope.is_response() && envelope.id_string().as_deref() == Some(id.as_str()) {
                if let Some(error) = envelope.error {
                    return Err(ClientError::Rejected {
                        code: error.code,
                        message: error.message,
                    });
                }
                return Ok(envelope.result.unwrap_or(Value::Null));
            }
            self.backlog.push_back(envelope);
        }
    }

    /// Put a frame back so [`Transport::next`] returns it first.
    pub(crate) fn push_front(&mut self, envelope: Envelope) {
        self.backlog.push_front(envelope);
    }

    /// Next frame from the hub, backlog first. `Ok(None)` on timeout.
    pub(crate) async fn next(&mut self, wait: Duration) -> ClientResult<Option<Envelope>> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Ok(Some(envelope));
        }
        match tokio::time::timeout(wait, self.read()).await {
            Ok(frame) => frame.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn read(&mut self) -> ClientResult<Envelope> {
        loop {
            let message = match self.reader.next().await {
                Some(message) => message?,
                None => return Err(ClientError::Closed),
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8(bytes)
                    .map_err(|_| ClientError::Protocol("binary frame is not UTF-8".to_string()))?,
                Message::Close(_) => return Err(ClientError::Closed),
                _ => continue,
            };
            trace!(frame = %text, "received");
            return Ok(serde_json::from_str(&text)?);
        }
    }

    pub(crate) async fn close(&mut self) -> ClientResult<()> {
        match self.writer.send(Message::Close(None)).await {
            Ok(()) | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
