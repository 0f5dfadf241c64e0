//! Session and tab registries.
//!
//! [`TabRegistry`] owns the binding from each browser tab to the
//! [`ProcessSession`] serving it; bindings hold strong references.
//! [`SessionRegistry`] maps conversation ids to sessions through weak
//! references, so it never keeps a session alive on its own. A session that is
//! still running is kept alive by its driver task and stays discoverable for
//! reattachment after its tab or connection goes away.

use super::process::{ProcessSession, SessionContext};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Conversation id → session lookup (non-owning).
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Weak<ProcessSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `session_id` at `session`, replacing any previous entry.
    pub fn register(&self, session_id: &str, session: &Arc<ProcessSession>) {
        self.lock()
            .insert(session_id.to_string(), Arc::downgrade(session));
        debug!(session_id, session = session.key(), "session registered");
    }

    /// The live session for a conversation id, if any.
    pub fn lookup(&self, session_id: &str) -> Option<Arc<ProcessSession>> {
        let mut entries = self.lock();
        match entries.get(session_id).map(Weak::upgrade) {
            Some(Some(session)) => Some(session),
            Some(None) => {
                entries.remove(session_id);
                None
            }
            None => None,
        }
    }

    /// Like [`lookup`](Self::lookup), but only while a subprocess is live.
    pub fn lookup_running(&self, session_id: &str) -> Option<Arc<ProcessSession>> {
        self.lookup(session_id).filter(|s| s.is_running())
    }

    /// Whether any conversation id maps to `session`.
    pub fn references(&self, session: &Arc<ProcessSession>) -> bool {
        let target = Arc::downgrade(session);
        self.lock().values().any(|w| w.ptr_eq(&target))
    }

    /// Drop every entry that maps to `session`. Returns the removed ids.
    pub fn remove_session(&self, session: &Arc<ProcessSession>) -> Vec<String> {
        let target = Arc::downgrade(session);
        let mut removed = Vec::new();
        self.lock().retain(|id, w| {
            if w.ptr_eq(&target) {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Weak<ProcessSession>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A tab's current session.
#[derive(Debug, Clone)]
pub struct TabBinding {
    pub session: Arc<ProcessSession>,
    /// Last conversation id this tab was told about.
    pub last_seen_session_id: Option<String>,
}

/// Outcome of [`TabRegistry::resume`].
#[derive(Debug, Clone)]
pub struct Resumed {
    pub session: Arc<ProcessSession>,
    /// True when the tab was bound to an already-running session.
    pub reattached: bool,
}

/// Tab id → session bindings (owning).
pub struct TabRegistry {
    bindings: Mutex<HashMap<String, TabBinding>>,
    ctx: Arc<SessionContext>,
}

impl TabRegistry {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// The tab's session for `working_directory`, creating or replacing it as needed.
    pub fn resolve(&self, tab_id: &str, working_directory: &Path) -> Arc<ProcessSession> {
        let mut bindings = self.lock();
        if let Some(binding) = bindings.get(tab_id) {
            if binding.session.working_directory() == working_directory {
                return Arc::clone(&binding.session);
            }
        }

        let session = self.ctx.create_session(working_directory.to_path_buf());
        self.bind(&mut bindings, tab_id, Arc::clone(&session), None);
        info!(tab_id, session = session.key(), dir = %working_directory.display(), "tab bound");
        session
    }

    /// Bind the tab to conversation `session_id`.
    ///
    /// A session that is still running under that id is adopted as-is, so an
    /// in-flight subprocess is never orphaned or spawned twice. Otherwise the
    /// tab's session for `working_directory` takes the id.
    pub fn resume(&self, tab_id: &str, session_id: &str, working_directory: &Path) -> Resumed {
        if let Some(running) = self.ctx.registry.lookup_running(session_id) {
            let mut bindings = self.lock();
            self.bind(
                &mut bindings,
                tab_id,
                Arc::clone(&running),
                Some(session_id.to_string()),
            );
            info!(tab_id, session_id, session = running.key(), "tab reattached to running session");
            return Resumed {
                session: running,
                reattached: true,
            };
        }

        let mut session = self.resolve(tab_id, working_directory);
        match session.session_id() {
            Some(current) if current == session_id => {}
            Some(_) if session.is_running() => {
                // The tab's session is busy with another conversation; leave it
                // running for whoever owns that conversation.
                let fresh = self.ctx.create_session(working_directory.to_path_buf());
                let mut bindings = self.lock();
                self.bind(&mut bindings, tab_id, Arc::clone(&fresh), None);
                session = fresh;
            }
            Some(_) => {
                self.ctx.registry.remove_session(&session);
                session.reset();
            }
            None => {}
        }

        session.set_session_id(session_id);
        if let Some(binding) = self.lock().get_mut(tab_id) {
            binding.last_seen_session_id = Some(session_id.to_string());
        }
        info!(tab_id, session_id, session = session.key(), "tab resumed conversation");
        Resumed {
            session,
            reattached: false,
        }
    }

    /// Tear down a tab. Other tabs are unaffected.
    ///
    /// Returns false if the tab was not bound.
    pub fn close(&self, tab_id: &str) -> bool {
        let mut bindings = self.lock();
        let Some(binding) = bindings.remove(tab_id) else {
            return false;
        };
        let session = binding.session;
        let shared = bindings
            .values()
            .any(|b| Arc::ptr_eq(&b.session, &session));
        drop(bindings);

        if shared {
            debug!(tab_id, session = session.key(), "closed tab shared its session; leaving it running");
        } else {
            session.detach_listeners();
            session.abort();
            let removed = self.ctx.registry.remove_session(&session);
            debug!(tab_id, session = session.key(), unregistered = removed.len(), "session released");
        }
        info!(tab_id, "tab closed");
        true
    }

    /// The tab's current session.
    pub fn get(&self, tab_id: &str) -> Option<Arc<ProcessSession>> {
        self.lock().get(tab_id).map(|b| Arc::clone(&b.session))
    }

    /// The tab's conversation id: the session's own, else the last one seen.
    pub fn session_id(&self, tab_id: &str) -> Option<String> {
        let bindings = self.lock();
        let binding = bindings.get(tab_id)?;
        binding
            .session
            .session_id()
            .or_else(|| binding.last_seen_session_id.clone())
    }

    /// Remember that the tab was told about `session_id`.
    pub fn note_session_id(&self, tab_id: &str, session_id: &str) {
        if let Some(binding) = self.lock().get_mut(tab_id) {
            binding.last_seen_session_id = Some(session_id.to_string());
        }
    }

    /// Drop bindings whose session is idle, unwatched, and older than `max_idle`.
    ///
    /// Conversations left without a live session lose their replay buffer.
    /// Returns the removed tab ids.
    pub fn gc(&self, max_idle: Duration) -> Vec<String> {
        let mut bindings = self.lock();
        let mut released = Vec::new();
        let mut removed = Vec::new();

        bindings.retain(|tab_id, binding| {
            let session = &binding.session;
            let keep = session.is_running()
                || session.listener_count() > 0
                || session.idle_for() <= max_idle;
            if !keep {
                removed.push(tab_id.clone());
                released.push(binding.clone());
            }
            keep
        });

        for binding in released {
            let session = binding.session;
            if bindings.values().any(|b| Arc::ptr_eq(&b.session, &session)) {
                continue;
            }
            let mut ids = self.ctx.registry.remove_session(&session);
            ids.extend(session.session_id());
            ids.extend(binding.last_seen_session_id);
            ids.sort();
            ids.dedup();
            for id in ids {
                if self.ctx.registry.lookup(&id).is_none() && self.ctx.buffer.clear(&id) {
                    debug!(session_id = %id, "replay buffer released");
                }
            }
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "GC removed idle tab bindings");
        }
        removed
    }

    /// Number of bound tabs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Install `session` for the tab, retiring whatever it replaced.
    fn bind(
        &self,
        bindings: &mut HashMap<String, TabBinding>,
        tab_id: &str,
        session: Arc<ProcessSession>,
        last_seen_session_id: Option<String>,
    ) {
        let previous = bindings.insert(
            tab_id.to_string(),
            TabBinding {
                session: Arc::clone(&session),
                last_seen_session_id,
            },
        );
        if let Some(old) = previous {
            if !Arc::ptr_eq(&old.session, &session) {
                self.retire(bindings, old.session);
            }
        }
    }

    /// Release a session no longer bound to a tab.
    ///
    /// It keeps running if another tab still uses it, or if a conversation id
    /// still routes to it so a later `resume` can reattach.
    fn retire(&self, bindings: &HashMap<String, TabBinding>, session: Arc<ProcessSession>) {
        if bindings.values().any(|b| Arc::ptr_eq(&b.session, &session)) {
            return;
        }
        session.detach_listeners();
        if session.is_running() && self.ctx.registry.references(&session) {
            debug!(session = session.key(), "retired session left running for reattachment");
        } else {
            session.abort();
            debug!(session = session.key(), "retired session stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TabBinding>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::message_buffer::MessageBuffer;
    use crate::session::process::{SequencedEvent, SpawnConfig};
    use crate::session::transcript::TranscriptLog;
    use std::path::PathBuf;
    use tabgate_core::EventKind;
    use tokio::sync::mpsc;

    const SLOW: &str = r#"cat >/dev/null
printf '%s\n' '{"type":"system","session_id":"live-1"}'
exec sleep 30
"#;

    fn registry(script: &str) -> TabRegistry {
        let ctx = Arc::new(SessionContext::new(
            SpawnConfig {
                program: "sh".into(),
                base_args: vec!["-c".into(), script.into(), "fake-assistant".into()],
                allowed_tools: vec![],
            },
            Arc::new(MessageBuffer::new(100)),
            TranscriptLog::disabled(),
            Arc::new(SessionRegistry::new()),
        ));
        TabRegistry::new(ctx)
    }

    fn dir() -> PathBuf {
        std::env::temp_dir()
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<SequencedEvent>, kind: EventKind) {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out")
                .expect("listener closed");
            if next.event.kind == kind {
                return;
            }
        }
    }

    #[test]
    fn resolve_reuses_matching_directory() {
        let tabs = registry("true");
        let a = tabs.resolve("t1", &dir());
        let b = tabs.resolve("t1", &dir());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tabs.len(), 1);
    }

    #[test]
    fn resolve_replaces_on_directory_switch() {
        let tabs = registry("true");
        let a = tabs.resolve("t1", &dir());
        let (_, _rx) = a.subscribe();
        let b = tabs.resolve("t1", Path::new("/"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.working_directory(), Path::new("/"));
        assert_eq!(a.listener_count(), 0);
        assert!(Arc::ptr_eq(&tabs.get("t1").unwrap(), &b));
    }

    #[tokio::test]
    async fn tabs_in_same_directory_are_independent() {
        let tabs = registry(SLOW);
        let a = tabs.resolve("a", &dir());
        let b = tabs.resolve("b", &dir());
        assert!(!Arc::ptr_eq(&a, &b));

        let (_, mut rx_b) = b.subscribe();
        a.send_command("x", &[]);
        b.send_command("y", &[]);
        wait_for(&mut rx_b, EventKind::Status).await;
        assert!(a.is_running());
        assert!(b.is_running());

        a.abort();
        assert!(!a.is_running());
        assert!(b.is_running());

        assert!(tabs.close("a"));
        assert!(b.is_running());
        assert!(tabs.close("b"));
        assert!(!b.is_running());
        assert_eq!(tabs.len(), 0);
    }

    #[tokio::test]
    async fn resume_reattaches_running_session() {
        let tabs = registry(SLOW);
        let original = tabs.resolve("old-tab", &dir());
        let (_, mut rx) = original.subscribe();
        original.send_command("long job", &[]);
        wait_for(&mut rx, EventKind::Session).await;
        assert_eq!(original.session_id().as_deref(), Some("live-1"));

        let resumed = tabs.resume("new-tab", "live-1", &dir());
        assert!(resumed.reattached);
        assert!(Arc::ptr_eq(&resumed.session, &original));
        assert_eq!(tabs.session_id("new-tab").as_deref(), Some("live-1"));

        original.abort();
    }

    #[tokio::test]
    async fn resume_of_idle_conversation_assigns_id() {
        let tabs = registry("true");
        let resumed = tabs.resume("t1", "conv-9", &dir());
        assert!(!resumed.reattached);
        assert_eq!(resumed.session.session_id().as_deref(), Some("conv-9"));
        let ctx = tabs.context();
        assert!(Arc::ptr_eq(
            &ctx.registry.lookup("conv-9").unwrap(),
            &resumed.session
        ));
        // Not running, so a second resume does not count as reattachment.
        assert!(ctx.registry.lookup_running("conv-9").is_none());
        let again = tabs.resume("t1", "conv-9", &dir());
        assert!(!again.reattached);
        assert!(Arc::ptr_eq(&again.session, &resumed.session));
    }

    #[test]
    fn resume_switches_idle_session_to_new_conversation() {
        let tabs = registry("true");
        let first = tabs.resume("t1", "conv-a", &dir());
        let second = tabs.resume("t1", "conv-b", &dir());
        assert!(Arc::ptr_eq(&first.session, &second.session));
        assert_eq!(second.session.session_id().as_deref(), Some("conv-b"));
        assert!(tabs.context().registry.lookup("conv-a").is_none());
    }

    #[tokio::test]
    async fn directory_switch_keeps_registered_running_session() {
        let tabs = registry(SLOW);
        let a = tabs.resolve("t1", &dir());
        let (_, mut rx) = a.subscribe();
        a.send_command("x", &[]);
        wait_for(&mut rx, EventKind::Session).await;

        let b = tabs.resolve("t1", Path::new("/"));
        assert!(!Arc::ptr_eq(&a, &b));
        // Registered under live-1, so it stays available for reattachment.
        assert!(a.is_running());
        let resumed = tabs.resume("t2", "live-1", &dir());
        assert!(resumed.reattached);
        a.abort();
    }

    #[test]
    fn directory_switch_stops_unregistered_session() {
        let tabs = registry("true");
        let a = tabs.resolve("t1", &dir());
        tabs.resolve("t1", Path::new("/"));
        assert!(!a.is_running());
        assert!(!a.is_processing());
    }

    #[tokio::test]
    async fn close_unregisters_only_its_own_session() {
        let tabs = registry("true");
        let a = tabs.resume("a", "conv-a", &dir());
        let b = tabs.resume("b", "conv-b", &dir());
        assert!(tabs.close("a"));
        assert!(!tabs.close("a"));

        let ctx = tabs.context();
        assert!(ctx.registry.lookup("conv-a").is_none());
        assert!(!ctx.registry.references(&a.session));
        assert!(Arc::ptr_eq(&ctx.registry.lookup("conv-b").unwrap(), &b.session));
        assert!(tabs.get("a").is_none());
        assert!(tabs.get("b").is_some());
    }

    #[test]
    fn gc_drops_only_idle_unwatched_bindings() {
        let tabs = registry("true");
        let watched = tabs.resolve("watched", &dir());
        let (_, _rx) = watched.subscribe();
        tabs.resolve("idle", &dir());

        let removed = tabs.gc(Duration::ZERO);
        assert_eq!(removed, vec!["idle".to_string()]);
        assert!(tabs.get("watched").is_some());
        assert!(tabs.gc(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn weak_entries_do_not_keep_sessions_alive() {
        let tabs = registry("true");
        let ids = SessionRegistry::new();
        let session = tabs.context().create_session(dir());
        ids.register("conv-x", &session);
        assert!(ids.lookup("conv-x").is_some());
        drop(session);
        assert!(ids.lookup("conv-x").is_none());
    }

    #[test]
    fn gc_releases_replay_buffers() {
        let tabs = registry("true");
        tabs.resume("idle", "conv-old", &dir());
        let watched = tabs.resume("watched", "conv-live", &dir());
        let (_, _rx) = watched.session.subscribe();

        let buffer = &tabs.context().buffer;
        buffer.append("conv-old", EventKind::Output, "x");
        buffer.append("conv-live", EventKind::Output, "y");

        assert_eq!(tabs.gc(Duration::ZERO), vec!["idle".to_string()]);
        assert!(buffer.since("conv-old", 0).is_empty());
        assert_eq!(buffer.since("conv-live", 0).len(), 1);
        assert!(tabs.context().registry.lookup("conv-old").is_none());
        assert_eq!(tabs.len(), 1);
    }

    #[tokio::test]
    async fn closing_one_tab_of_a_shared_session_keeps_it_running() {
        let tabs = registry(SLOW);
        let shared = tabs.resolve("first", &dir());
        let (_, mut rx) = shared.subscribe();
        shared.send_command("x", &[]);
        wait_for(&mut rx, EventKind::Session).await;

        let resumed = tabs.resume("second", "live-1", &dir());
        assert!(resumed.reattached);
        drop(resumed);

        assert!(tabs.close("first"));
        assert!(shared.is_running());
        assert_eq!(shared.listener_count(), 1);
        assert!(Arc::ptr_eq(
            &tabs.context().registry.lookup("live-1").unwrap(),
            &shared
        ));

        assert!(tabs.close("second"));
        assert!(!shared.is_running());
        assert_eq!(shared.listener_count(), 0);
        assert!(tabs.context().registry.lookup("live-1").is_none());
    }
}
