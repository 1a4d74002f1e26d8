//! WebSocket listener and health endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::hub::{Flow, Hub};
use crate::registry::Outbound;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Serve until the hub starts shutting down.
pub async fn serve(hub: Arc<Hub>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr().context("reading listener address")?;
    info!("Hub listening on ws://{}", addr);
    let app = router(hub.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { hub.stopped().await })
    .await
    .context("hub listener failed")
}

async fn health_handler(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(hub.health().await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, hub))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = hub.attach(peer.to_string(), tx.clone()).await;

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(conn, "Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if hub.handle_frame(conn, &text).await == Flow::Close {
            break;
        }
    }

    hub.detach(conn).await;
    let _ = tx.send(Outbound::Close);
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use starlight_driver::scripted::ScriptedPage;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn health_reports_counts() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.audit = dir.path().join("audit.ndjson");
        config.paths.history = dir.path().join("memory.json");
        config.paths.trace = dir.path().join("trace.json");
        config.paths.report = dir.path().join("report.json");
        config.security.audit_key = Some("k".to_string());
        let hub = Arc::new(Hub::new(config, Arc::new(ScriptedPage::new("about:blank"))));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(hub.clone(), listener));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("\"sentinels\":0"));
        assert!(body.contains("\"status\":\"ok\""));

        hub.shutdown("test over", crate::hub::ShutdownCause::Requested).await;
        server.await.unwrap().unwrap();
    }
}
