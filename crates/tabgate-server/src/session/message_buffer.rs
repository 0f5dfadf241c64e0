//! Sequence-numbered replay buffer.
//!
//! Keeps the last N events of every conversation so a reconnecting client can
//! ask for everything after the last sequence id it saw. Sequence ids come
//! from one counter shared by all conversations, so a client can detect gaps
//! even after reattaching to a different conversation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tabgate_core::{BufferedMessage, EventKind};

/// Default number of events retained per conversation.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

#[derive(Debug)]
struct BufferState {
    /// Last sequence id handed out; ids start at 1.
    last_sequence_id: u64,
    sessions: HashMap<String, VecDeque<BufferedMessage>>,
}

/// Capped per-conversation append log.
#[derive(Debug)]
pub struct MessageBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
}

impl MessageBuffer {
    /// Create a buffer retaining at most `capacity` events per conversation.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                last_sequence_id: 0,
                sessions: HashMap::new(),
            }),
            capacity,
        }
    }

    /// Append an event, evicting the oldest entry once the cap is exceeded.
    pub fn append(&self, session_id: &str, kind: EventKind, content: &str) -> BufferedMessage {
        let mut state = self.lock();
        state.last_sequence_id += 1;
        let message = BufferedMessage {
            sequence_id: state.last_sequence_id,
            kind,
            content: content.to_string(),
            timestamp: now_millis(),
        };

        if self.capacity > 0 {
            let entries = state.sessions.entry(session_id.to_string()).or_default();
            entries.push_back(message.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        message
    }

    /// Every retained event with `sequence_id > after_id`, oldest first.
    ///
    /// Unknown conversations yield an empty list.
    pub fn since(&self, session_id: &str, after_id: u64) -> Vec<BufferedMessage> {
        let state = self.lock();
        state
            .sessions
            .get(session_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|m| m.sequence_id > after_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop everything retained for a conversation.
    ///
    /// The sequence counter is unaffected.
    pub fn clear(&self, session_id: &str) -> bool {
        self.lock().sessions.remove(session_id).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        // State is a plain counter and queues; a poisoned lock leaves it consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_returns_only_newer_entries() {
        let buf = MessageBuffer::new(10);
        for i in 0..5 {
            buf.append("s", EventKind::Output, &format!("m{i}"));
        }
        let after = buf.since("s", 2);
        let ids: Vec<u64> = after.iter().map(|m| m.sequence_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(after[0].content, "m2");
    }

    #[test]
    fn sequence_is_global_across_sessions() {
        let buf = MessageBuffer::new(10);
        let a1 = buf.append("a", EventKind::Output, "a1");
        let b1 = buf.append("b", EventKind::Status, "b1");
        let a2 = buf.append("a", EventKind::Complete, "");
        assert_eq!((a1.sequence_id, b1.sequence_id, a2.sequence_id), (1, 2, 3));

        let a: Vec<u64> = buf.since("a", 0).iter().map(|m| m.sequence_id).collect();
        assert_eq!(a, vec![1, 3]);
    }

    #[test]
    fn since_is_strictly_increasing() {
        let buf = MessageBuffer::new(100);
        for i in 0..40 {
            let sid = if i % 3 == 0 { "x" } else { "y" };
            buf.append(sid, EventKind::Output, "m");
        }
        for after in [0, 5, 17, 39, 40] {
            let got = buf.since("y", after);
            assert!(got.iter().all(|m| m.sequence_id > after));
            assert!(got.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
        }
    }

    #[test]
    fn overflow_evicts_oldest() {
        let buf = MessageBuffer::new(1000);
        for i in 1..=1050 {
            buf.append("s", EventKind::Output, &format!("append #{i}"));
        }
        let all = buf.since("s", 0);
        assert_eq!(all.len(), 1000);
        assert_eq!(all[0].content, "append #51");
        assert_eq!(all[999].content, "append #1050");
    }

    #[test]
    fn unknown_session_is_empty() {
        let buf = MessageBuffer::default();
        buf.append("known", EventKind::Output, "x");
        assert!(buf.since("missing", 0).is_empty());
    }

    #[test]
    fn zero_capacity_still_numbers() {
        let buf = MessageBuffer::new(0);
        let m = buf.append("s", EventKind::Output, "x");
        assert_eq!(m.sequence_id, 1);
        assert!(buf.since("s", 0).is_empty());
    }

    #[test]
    fn clear_drops_session() {
        let buf = MessageBuffer::new(5);
        buf.append("s", EventKind::Output, "x");
        assert!(buf.clear("s"));
        assert!(!buf.clear("s"));
        assert!(buf.since("s", 0).is_empty());
        // Counter keeps running.
        assert_eq!(buf.append("s", EventKind::Output, "y").sequence_id, 2);
    }
}
