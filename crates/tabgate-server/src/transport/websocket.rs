//! WebSocket listener using tokio-tungstenite.
//!
//! Browser tabs speak JSON text frames. Each accepted connection is handed to
//! the server through a channel once the upgrade handshake completes.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tabgate_core::{GatewayError, GatewayResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind `bind_addr` and start accepting browser connections.
///
/// Returns the bound address (useful with port 0) and a receiver of upgraded
/// connections. Each upgrade runs on its own task.
pub async fn start_listener(
    bind_addr: &str,
) -> GatewayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("cannot listen on {bind_addr}: {e}")))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "accepting tab connections");

    let (conn_tx, conn_rx) = mpsc::channel(64);
    tokio::spawn(accept_loop(listener, conn_tx));
    Ok((local_addr, conn_rx))
}

async fn accept_loop(listener: TcpListener, conn_tx: mpsc::Sender<WebSocketConnection>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        if conn_tx.is_closed() {
            debug!("server stopped; accept loop exiting");
            return;
        }
        tokio::spawn(upgrade(stream, remote_addr, conn_tx.clone()));
    }
}

async fn upgrade(stream: TcpStream, remote_addr: SocketAddr, conn_tx: mpsc::Sender<WebSocketConnection>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(remote = %remote_addr, error = %e, "upgrade rejected");
            return;
        }
    };
    debug!(remote = %remote_addr, "upgraded to WebSocket");
    let conn = WebSocketConnection {
        ws_stream,
        remote_addr,
    };
    if conn_tx.send(conn).await.is_err() {
        debug!(remote = %remote_addr, "server stopped before connection was handed over");
    }
}

/// Send one text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> GatewayResult<()> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| GatewayError::Transport(format!("send failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` once the peer closes. Pings are answered, binary frames are
/// ignored, and frames over `max_frame_bytes` are rejected.
pub async fn ws_recv_text(
    ws: &mut WebSocketStream<TcpStream>,
    max_frame_bytes: usize,
) -> GatewayResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_frame_bytes {
                    return Err(GatewayError::InvalidMessage(format!(
                        "frame of {} bytes exceeds the {max_frame_bytes} byte limit",
                        text.len()
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                if let Err(e) = ws.send(Message::Pong(payload)).await {
                    return Err(GatewayError::Transport(format!("pong failed: {e}")));
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(GatewayError::Transport(format!("receive failed: {e}"))),
            None => return Ok(None),
        }
    }
}
