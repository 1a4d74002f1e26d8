//! Chrome DevTools Protocol transport.
//!
//! One WebSocket per page target. Commands get monotonically increasing ids;
//! a background reader routes each response to the oneshot registered for
//! its id. Events are logged at trace level and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::DriverError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, DriverError>>>>>;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CdpClient {
    next_id: AtomicU64,
    pending: Pending,
    writer: Mutex<SplitSink<Socket, Message>>,
    reader: JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self, DriverError> {
        debug!(url = ws_url, "connecting to DevTools target");
        let (socket, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|err| DriverError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: err.to_string(),
            })?;
        let (writer, reader) = socket.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending)));
        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            reader,
        })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        self.call_with_timeout(method, params, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DriverError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({ "id": id, "method": method, "params": params }).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        trace!(id, method, "CDP command");
        let sent = self.writer.lock().await.send(Message::Text(frame)).await;
        if let Err(err) = sent {
            self.pending.lock().await.remove(&id);
            return Err(DriverError::Protocol(format!("send failed: {err}")));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(DriverError::Timeout {
                    method: method.to_string(),
                    duration: timeout,
                })
            }
        }
    }

    pub async fn close(&self) {
        let _ = self.writer.lock().await.close().await;
        self.reader.abort();
    }
}

async fn read_loop(mut reader: SplitStream<Socket>, pending: Pending) {
    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(error = %err, "DevTools socket error");
                break;
            }
        };
        let Ok(message) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            trace!(method = ?message.get("method"), "CDP event");
            continue;
        };
        let Some(tx) = pending.lock().await.remove(&id) else {
            continue;
        };
        let outcome = match message.get("error") {
            Some(error) => Err(DriverError::Cdp {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            }),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }

    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(DriverError::Closed));
    }
}
