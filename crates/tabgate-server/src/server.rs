//! Core server: accepts WebSocket connections and runs one router per socket.
//!
//! Owns the shared gateway state (tab registry, session context, replay
//! buffer, transcript writer) and the idle-binding collector.

use crate::config::ServerConfig;
use crate::router::{ConnectionRouter, GatewayState};
use crate::session::{MessageBuffer, SessionContext, SessionRegistry, TabRegistry, TranscriptLog};
use crate::transport::websocket;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tabgate_core::{frame_encode, GatewayResult, ServerMessage};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// How often idle tab bindings are collected.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// The tabgate server instance.
pub struct GatewayServer {
    config: ServerConfig,
    state: Arc<GatewayState>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    /// Build the shared state. Must be called inside a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let transcript = match &config.transcript_dir {
            Some(dir) => {
                info!(path = %dir.display(), "transcripts enabled");
                TranscriptLog::spawn(dir.clone())
            }
            None => TranscriptLog::disabled(),
        };

        let context = Arc::new(SessionContext::new(
            config.spawn.clone(),
            Arc::new(MessageBuffer::new(config.buffer_capacity)),
            transcript,
            Arc::new(SessionRegistry::new()),
        ));
        let state = Arc::new(GatewayState::new(
            TabRegistry::new(context),
            config.default_working_directory.clone(),
        ));

        Self {
            config,
            state,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind, then serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> GatewayResult<()> {
        let (addr, listener) = websocket::start_listener(&self.config.bind_addr()).await?;
        info!(
            addr = %addr,
            program = %self.config.spawn.program,
            dir = %self.config.default_working_directory.display(),
            "tabgate ready"
        );
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections from `listener` until `shutdown` resolves.
    pub async fn serve(
        self,
        mut listener: mpsc::Receiver<websocket::WebSocketConnection>,
        shutdown: impl Future<Output = ()>,
    ) {
        let server = Arc::new(self);

        let gc_state = Arc::clone(&server.state);
        let idle_timeout = server.config.idle_timeout;
        let gc_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = gc_state.tabs.gc(idle_timeout);
                if !removed.is_empty() {
                    info!(
                        count = removed.len(),
                        remaining = gc_state.tabs.len(),
                        "collected idle tabs"
                    );
                }
            }
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = listener.recv() => {
                    let Some(conn) = conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = Arc::clone(&server);
                    tokio::spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = srv.handle_websocket(conn).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
            }
        }

        gc_task.abort();
        debug!("notifying connected clients of shutdown");
        let _ = server.shutdown_tx.send(());
    }

    async fn handle_websocket(&self, mut conn: websocket::WebSocketConnection) -> GatewayResult<()> {
        let remote: SocketAddr = conn.remote_addr;
        info!(remote = %remote, "client connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut router = ConnectionRouter::new(Arc::clone(&self.state), out_tx);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_frame_bytes = self.config.max_frame_bytes;

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(remote = %remote, "closing connection for shutdown");
                    let _ = conn.ws_stream.close(None).await;
                    break Ok(());
                }

                Some(message) = out_rx.recv() => {
                    let frame = frame_encode(&message)?;
                    if let Err(e) = websocket::ws_send_text(&mut conn.ws_stream, frame).await {
                        break Err(e);
                    }
                }

                inbound = websocket::ws_recv_text(&mut conn.ws_stream, max_frame_bytes) => {
                    match inbound {
                        Ok(Some(text)) => router.handle_frame(&text).await,
                        Ok(None) => {
                            debug!(remote = %remote, "peer closed");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let tabs = router.attached_tabs();
        drop(router);
        info!(remote = %remote, tabs, "client disconnected");
        result
    }
}
