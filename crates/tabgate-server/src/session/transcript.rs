//! Durable conversation transcripts.
//!
//! Every prompt and every sequenced event is appended to
//! `<dir>/<session_id>.jsonl` as newline-delimited JSON. Writes go through a
//! single background task so lines land in the order they were produced.
//! Transcripts are best-effort: failures are logged, never propagated.

use super::message_buffer::now_millis;
use std::path::{Path, PathBuf};
use tabgate_core::{TranscriptEntry, TranscriptRecord};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug)]
enum WriterCommand {
    Append {
        session_id: String,
        entry: TranscriptEntry,
    },
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to the transcript writer.
///
/// A disabled handle accepts records and drops them.
#[derive(Clone, Debug)]
pub struct TranscriptLog {
    dir: Option<PathBuf>,
    tx: Option<mpsc::UnboundedSender<WriterCommand>>,
}

impl TranscriptLog {
    /// Start the writer task for `dir`. Must be called inside a Tokio runtime.
    pub fn spawn(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(path = %dir.display(), error = %e, "could not create transcript dir");
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();
        let writer_dir = dir.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriterCommand::Append { session_id, entry } => {
                        let path = transcript_path(&writer_dir, &session_id);
                        if let Err(e) = append_entry(&path, &entry).await {
                            error!(path = %path.display(), error = %e, "failed to write transcript");
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("transcript writer stopped");
        });

        Self {
            dir: Some(dir),
            tx: Some(tx),
        }
    }

    /// A handle that records nothing.
    pub fn disabled() -> Self {
        Self { dir: None, tx: None }
    }

    /// Directory transcripts are written to, if enabled.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Queue a record for a conversation.
    pub fn record(&self, session_id: &str, record: TranscriptRecord) {
        let Some(tx) = &self.tx else { return };
        if !is_safe_session_id(session_id) {
            warn!(session_id, "refusing to write transcript for unsafe session id");
            return;
        }
        let entry = TranscriptEntry {
            timestamp: now_millis(),
            record,
        };
        let _ = tx.send(WriterCommand::Append {
            session_id: session_id.to_string(),
            entry,
        });
    }

    /// Wait until every record queued so far has been written.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Full transcript of a conversation, oldest first.
    pub async fn load(&self, session_id: &str) -> std::io::Result<Vec<TranscriptEntry>> {
        match &self.dir {
            Some(dir) => load_transcript(dir, session_id).await,
            None => Ok(Vec::new()),
        }
    }
}

/// Session ids come from the assistant process and become file names.
fn is_safe_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn transcript_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.jsonl"))
}

async fn append_entry(path: &Path, entry: &TranscriptEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Load a transcript from disk. A missing file is an empty transcript.
pub async fn load_transcript(dir: &Path, session_id: &str) -> std::io::Result<Vec<TranscriptEntry>> {
    if !is_safe_session_id(session_id) {
        return Ok(Vec::new());
    }
    let path = transcript_path(dir, session_id);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!(error = %e, "skipping malformed transcript line");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabgate_core::EventKind;

    #[tokio::test]
    async fn records_are_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::spawn(dir.path().to_path_buf());

        log.record(
            "sess-1",
            TranscriptRecord::Prompt {
                text: "hi".into(),
                attachments: 0,
            },
        );
        for seq in 1..=3 {
            log.record(
                "sess-1",
                TranscriptRecord::Event {
                    sequence_id: seq,
                    kind: EventKind::Output,
                    content: format!("line {seq}"),
                },
            );
        }
        log.flush().await;

        let entries = log.load("sess-1").await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(matches!(entries[0].record, TranscriptRecord::Prompt { .. }));
        match &entries[3].record {
            TranscriptRecord::Event {
                sequence_id,
                content,
                ..
            } => {
                assert_eq!(*sequence_id, 3);
                assert_eq!(content, "line 3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_transcript_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = load_transcript(dir.path(), "nope").await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&TranscriptEntry {
            timestamp: 1,
            record: TranscriptRecord::Prompt {
                text: "ok".into(),
                attachments: 1,
            },
        })
        .unwrap();
        std::fs::write(dir.path().join("s.jsonl"), format!("garbage\n{good}\n\n")).unwrap();

        let entries = load_transcript(dir.path(), "s").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn unsafe_ids_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::spawn(dir.path().to_path_buf());
        log.record(
            "../escape",
            TranscriptRecord::Prompt {
                text: "x".into(),
                attachments: 0,
            },
        );
        log.flush().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(log.load("../escape").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_log_is_inert() {
        let log = TranscriptLog::disabled();
        log.record(
            "s",
            TranscriptRecord::Prompt {
                text: "x".into(),
                attachments: 0,
            },
        );
        log.flush().await;
        assert!(log.load("s").await.unwrap().is_empty());
        assert!(log.dir().is_none());
    }
}
