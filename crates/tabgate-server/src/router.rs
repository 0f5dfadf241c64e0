//! Per-connection dispatcher.
//!
//! A [`ConnectionRouter`] decodes inbound control frames, drives the tab
//! registry, and forwards every event of the sessions its tabs are bound to
//! onto the connection's outbound queue, tagged with the tab id. Dropping the
//! router detaches its listeners; the sessions themselves stay bound and
//! registered so a reconnecting client can resume them.

use crate::session::process::ListenerId;
use crate::session::{ProcessSession, TabRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tabgate_core::{
    Attachment, ControlMessage, EventEnvelope, EventKind, GatewayError, ReplyMessage,
    ServerMessage, SessionEvent, TranscriptEntry, TranscriptRecord,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by every connection.
pub struct GatewayState {
    pub tabs: TabRegistry,
    /// Directory used when neither the message nor the tab names one.
    pub default_working_directory: PathBuf,
}

impl GatewayState {
    pub fn new(tabs: TabRegistry, default_working_directory: PathBuf) -> Self {
        Self {
            tabs,
            default_working_directory,
        }
    }

    /// Full history of a conversation.
    ///
    /// Reads the durable transcript when enabled, otherwise whatever the
    /// replay buffer still holds.
    pub async fn history(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, GatewayError> {
        let ctx = self.tabs.context();
        if ctx.transcript.dir().is_some() {
            ctx.transcript.flush().await;
            return Ok(ctx.transcript.load(session_id).await?);
        }
        Ok(ctx
            .buffer
            .since(session_id, 0)
            .into_iter()
            .map(|m| TranscriptEntry {
                timestamp: m.timestamp,
                record: TranscriptRecord::Event {
                    sequence_id: m.sequence_id,
                    kind: m.kind,
                    content: m.content,
                },
            })
            .collect())
    }
}

/// A tab of this connection attached to a session.
struct TabLink {
    session: Arc<ProcessSession>,
    listener: ListenerId,
    forwarder: JoinHandle<()>,
}

/// Socket-facing dispatcher for one connection.
pub struct ConnectionRouter {
    state: Arc<GatewayState>,
    out: mpsc::UnboundedSender<ServerMessage>,
    links: HashMap<String, TabLink>,
}

impl ConnectionRouter {
    /// `out` is drained by the connection's writer.
    pub fn new(state: Arc<GatewayState>, out: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            state,
            out,
            links: HashMap::new(),
        }
    }

    /// Decode and dispatch one text frame. Failures are reported to the client.
    pub async fn handle_frame(&mut self, frame: &str) {
        match ControlMessage::decode(frame) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                debug!(error = %e, "rejected inbound frame");
                let tab_id = frame_tab_id(frame);
                self.reply(tab_id.as_deref(), SessionEvent::error(e.to_string()));
            }
        }
    }

    /// Number of tabs this connection is listening to.
    pub fn attached_tabs(&self) -> usize {
        self.links.len()
    }

    pub async fn dispatch(&mut self, message: ControlMessage) {
        let tab_id = message.tab_id().to_string();
        match message {
            ControlMessage::Command {
                content,
                working_directory,
                attachments,
                ..
            } => self.command(&tab_id, &content, working_directory, &attachments),
            ControlMessage::Abort { .. } => self.abort(&tab_id),
            ControlMessage::Reset { .. } => self.reset(&tab_id),
            ControlMessage::Resume {
                session_id,
                working_directory,
                ..
            } => match session_id.filter(|s| !s.is_empty()) {
                Some(sid) => self.resume(&tab_id, &sid, working_directory),
                None => self.missing_session_id(&tab_id),
            },
            ControlMessage::TabClose { .. } => self.close(&tab_id),
            ControlMessage::Replay {
                session_id,
                after_sequence_id,
                ..
            } => match session_id.filter(|s| !s.is_empty()) {
                Some(sid) => match after_sequence_id {
                    Some(after) => self.missed_messages(&sid, after),
                    None => self.full_history(&tab_id, &sid).await,
                },
                None => self.missing_session_id(&tab_id),
            },
            ControlMessage::History { session_id, .. } => {
                match session_id.filter(|s| !s.is_empty()) {
                    Some(sid) => self.full_history(&tab_id, &sid).await,
                    None => self.missing_session_id(&tab_id),
                }
            }
        }
    }

    fn command(
        &mut self,
        tab_id: &str,
        content: &str,
        working_directory: Option<String>,
        attachments: &[Attachment],
    ) {
        if content.trim().is_empty() && attachments.is_empty() {
            self.reply(Some(tab_id), SessionEvent::error("Empty command"));
            self.reply(Some(tab_id), SessionEvent::complete());
            return;
        }

        let dir = self.working_directory_for(tab_id, working_directory);
        let session = self.state.tabs.resolve(tab_id, &dir);
        self.attach(tab_id, &session);
        debug!(tab_id, session = session.key(), attachments = attachments.len(), "command");
        session.send_command(content, attachments);
    }

    fn abort(&mut self, tab_id: &str) {
        let Some(session) = self.state.tabs.get(tab_id) else {
            self.reply(Some(tab_id), SessionEvent::complete());
            return;
        };
        self.attach(tab_id, &session);
        if !session.abort() {
            // Nothing running; still settle the client's state machine.
            self.reply(Some(tab_id), SessionEvent::complete());
        }
    }

    fn reset(&mut self, tab_id: &str) {
        if let Some(session) = self.state.tabs.get(tab_id) {
            self.attach(tab_id, &session);
            let forgotten = self.state.tabs.session_id(tab_id);
            self.state.tabs.context().registry.remove_session(&session);
            session.reset();
            info!(tab_id, session_id = forgotten.as_deref().unwrap_or("-"), "tab reset");
        }
        self.reply(Some(tab_id), SessionEvent::status("reset"));
    }

    fn resume(&mut self, tab_id: &str, session_id: &str, working_directory: Option<String>) {
        let dir = self.working_directory_for(tab_id, working_directory);
        let resumed = self.state.tabs.resume(tab_id, session_id, &dir);
        self.attach(tab_id, &resumed.session);

        self.reply(Some(tab_id), SessionEvent::session(session_id));
        if resumed.session.is_processing() {
            self.reply(Some(tab_id), SessionEvent::status("processing"));
        }
        info!(tab_id, session_id, reattached = resumed.reattached, "resume");
    }

    fn close(&mut self, tab_id: &str) {
        self.detach(tab_id);
        if !self.state.tabs.close(tab_id) {
            debug!(tab_id, "close for unbound tab");
        }
    }

    fn missed_messages(&self, session_id: &str, after: u64) {
        let messages = self.state.tabs.context().buffer.since(session_id, after);
        debug!(session_id, after, count = messages.len(), "replaying missed messages");
        self.send(ReplyMessage::MissedMessages {
            session_id: session_id.to_string(),
            messages,
        });
    }

    async fn full_history(&self, tab_id: &str, session_id: &str) {
        match self.state.history(session_id).await {
            Ok(entries) => {
                debug!(session_id, count = entries.len(), "sending history");
                self.send(ReplyMessage::History {
                    session_id: session_id.to_string(),
                    entries,
                });
            }
            Err(e) => {
                warn!(session_id, error = %e, "failed to load history");
                self.reply(
                    Some(tab_id),
                    SessionEvent::error(format!("Failed to load history: {e}")),
                );
            }
        }
    }

    fn missing_session_id(&self, tab_id: &str) {
        self.reply(Some(tab_id), SessionEvent::error("Missing sessionId"));
    }

    /// Explicit directory, else the tab's current one, else the default.
    fn working_directory_for(&self, tab_id: &str, requested: Option<String>) -> PathBuf {
        if let Some(dir) = requested.filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        self.state
            .tabs
            .get(tab_id)
            .map(|s| s.working_directory().to_path_buf())
            .unwrap_or_else(|| self.state.default_working_directory.clone())
    }

    /// Forward `session`'s events to this connection as `tab_id`.
    fn attach(&mut self, tab_id: &str, session: &Arc<ProcessSession>) {
        if let Some(link) = self.links.get(tab_id) {
            if Arc::ptr_eq(&link.session, session) {
                return;
            }
        }
        self.detach(tab_id);

        let (listener, mut rx) = session.subscribe();
        let out = self.out.clone();
        let state = Arc::clone(&self.state);
        let tab = tab_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if update.event.kind == EventKind::Session {
                    state.tabs.note_session_id(&tab, &update.event.content);
                }
                let envelope =
                    EventEnvelope::new(update.event, Some(tab.clone()), update.sequence_id);
                if out.send(envelope.into()).is_err() {
                    break;
                }
            }
        });

        debug!(tab_id, session = session.key(), listener, "tab attached");
        self.links.insert(
            tab_id.to_string(),
            TabLink {
                session: Arc::clone(session),
                listener,
                forwarder,
            },
        );
    }

    fn detach(&mut self, tab_id: &str) {
        if let Some(link) = self.links.remove(tab_id) {
            link.session.unsubscribe(link.listener);
            link.forwarder.abort();
            debug!(tab_id, session = link.session.key(), "tab detached");
        }
    }

    /// Send an unsequenced event to the client.
    ///
    /// For an attached tab it is queued behind the session events already
    /// forwarded to that tab, so replies never overtake what caused them.
    fn reply(&self, tab_id: Option<&str>, event: SessionEvent) {
        if let Some(link) = tab_id.and_then(|t| self.links.get(t)) {
            if link.session.notify(link.listener, event.clone()) {
                return;
            }
        }
        self.send(EventEnvelope::new(event, tab_id.map(str::to_string), None));
    }

    fn send(&self, message: impl Into<ServerMessage>) {
        let _ = self.out.send(message.into());
    }
}

impl Drop for ConnectionRouter {
    fn drop(&mut self) {
        let count = self.links.len();
        for (_, link) in self.links.drain() {
            link.session.unsubscribe(link.listener);
            link.forwarder.abort();
        }
        debug!(tabs = count, "connection listeners detached");
    }
}

/// Best-effort `tabId` of a frame that failed validation.
fn frame_tab_id(frame: &str) -> Option<String> {
    let value: Value = serde_json::from_str(frame).ok()?;
    value.get("tabId")?.as_str().map(str::to_string)
}
