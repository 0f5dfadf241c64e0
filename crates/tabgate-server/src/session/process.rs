//! One assistant subprocess per conversation.
//!
//! A [`ProcessSession`] builds the assistant's argument list, spawns it in the
//! session's working directory, feeds the prompt over stdin and decodes its
//! line-delimited JSON stdout into [`SessionEvent`]s. Events are stamped with a
//! sequence id once the conversation id is known and fanned out to every
//! attached listener in the order the lines were read.
//!
//! Every command ends with exactly one `complete` event, whether it succeeds,
//! fails to spawn, exits non-zero or is aborted.

use super::message_buffer::MessageBuffer;
use super::registry::SessionRegistry;
use super::transcript::TranscriptLog;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tabgate_core::{decode_line, Attachment, LineDecoder, SessionEvent, StreamItem, TranscriptRecord};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Error text sent when a command arrives while another is running.
pub const BUSY_MESSAGE: &str = "Already processing a command";

/// Lines of stderr kept for exit error reports.
const STDERR_TAIL_LINES: usize = 20;

const READ_CHUNK: usize = 8 * 1024;

/// How the assistant binary is invoked.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the generated flags.
    pub base_args: Vec<String>,
    /// Tool names the assistant may use without asking.
    pub allowed_tools: Vec<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: "claude".into(),
            base_args: Vec::new(),
            allowed_tools: Vec::new(),
        }
    }
}

impl SpawnConfig {
    /// Build the argument list for one command.
    ///
    /// The prompt itself travels over stdin, so the prompt flag takes no
    /// positional value. `--resume` is added only for a known conversation.
    pub fn build_args(&self, resume_id: Option<&str>, structured_input: bool) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("--print".into());
        if let Some(id) = resume_id {
            args.push("--resume".into());
            args.push(id.into());
        }
        args.extend(["--output-format", "stream-json", "--verbose"].map(String::from));
        if structured_input {
            args.extend(["--input-format", "stream-json"].map(String::from));
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(self.allowed_tools.join(","));
        }
        args
    }
}

/// Bytes written to the assistant's stdin for one command.
///
/// Plain prompts are sent verbatim; prompts with attachments become a single
/// structured user message with one content block per part.
pub fn stdin_payload(text: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return text.to_string();
    }

    let mut content: Vec<Value> = Vec::with_capacity(attachments.len() + 1);
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    for attachment in attachments {
        if attachment.is_image() {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": attachment.media_type,
                    "data": attachment.data,
                }
            }));
        } else {
            let name = attachment.name.as_deref().unwrap_or("attachment");
            content.push(json!({
                "type": "text",
                "text": format!("Attached file {name}:\n{}", attachment.data),
            }));
        }
    }

    let mut line = json!({
        "type": "user",
        "message": {"role": "user", "content": content}
    })
    .to_string();
    line.push('\n');
    line
}

/// Conversation id that can be assigned once until explicitly cleared.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionIdCell(Option<String>);

impl SessionIdCell {
    /// Store `id` if empty. Returns false, leaving the cell untouched, otherwise.
    pub fn set(&mut self, id: impl Into<String>) -> bool {
        if self.0.is_some() {
            return false;
        }
        self.0 = Some(id.into());
        true
    }

    pub fn get(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

/// Stable identity of a session, used in logs.
pub type SessionKey = u64;

/// Identity of a listener attached to a session.
pub type ListenerId = u64;

/// An event as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedEvent {
    pub event: SessionEvent,
    /// Present once the conversation id is known.
    pub sequence_id: Option<u64>,
}

/// Shared collaborators handed to every session.
pub struct SessionContext {
    pub spawn: SpawnConfig,
    pub buffer: Arc<MessageBuffer>,
    pub transcript: TranscriptLog,
    pub registry: Arc<SessionRegistry>,
    next_key: AtomicU64,
}

impl SessionContext {
    pub fn new(
        spawn: SpawnConfig,
        buffer: Arc<MessageBuffer>,
        transcript: TranscriptLog,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            spawn,
            buffer,
            transcript,
            registry,
            next_key: AtomicU64::new(1),
        }
    }

    /// Create an idle session bound to `working_directory`.
    pub fn create_session(self: &Arc<Self>, working_directory: PathBuf) -> Arc<ProcessSession> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        debug!(session = key, dir = %working_directory.display(), "session created");
        Arc::new(ProcessSession {
            key,
            working_directory,
            ctx: Arc::clone(self),
            state: Mutex::new(ProcessState {
                session_id: SessionIdCell::default(),
                processing: false,
                was_aborted: false,
                child: None,
                run_generation: 0,
                finished_generation: 0,
                pending_prompts: Vec::new(),
                last_activity: Instant::now(),
            }),
            listeners: Mutex::new(Listeners {
                next_id: 1,
                senders: Vec::new(),
            }),
        })
    }
}

/// Handle to the live subprocess. Dropping or firing `kill` terminates it.
struct ChildHandle {
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
}

struct ProcessState {
    session_id: SessionIdCell,
    processing: bool,
    was_aborted: bool,
    child: Option<ChildHandle>,
    /// Incremented for every accepted command.
    run_generation: u64,
    /// Highest generation that has emitted its `complete`.
    finished_generation: u64,
    /// Prompts submitted before the conversation id was known.
    pending_prompts: Vec<TranscriptRecord>,
    last_activity: Instant,
}

struct Listeners {
    next_id: ListenerId,
    senders: Vec<(ListenerId, mpsc::UnboundedSender<SequencedEvent>)>,
}

enum RunOutcome {
    Killed,
    Exited(std::io::Result<ExitStatus>, Vec<String>),
}

/// Owner of one assistant subprocess and its conversation id.
pub struct ProcessSession {
    key: SessionKey,
    working_directory: PathBuf,
    ctx: Arc<SessionContext>,
    state: Mutex<ProcessState>,
    listeners: Mutex<Listeners>,
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("key", &self.key)
            .field("working_directory", &self.working_directory)
            .field("session_id", &self.session_id())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Finalizer for one command run; emits `complete` when dropped.
struct RunGuard {
    session: Arc<ProcessSession>,
    generation: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.session.finish_run(self.generation);
    }
}

impl ProcessSession {
    /// Start a command.
    ///
    /// Returns false when rejected because a command is already running; the
    /// rejection is also reported as an error event. Spawn failures are
    /// reported as events and still count as accepted.
    pub fn send_command(self: &Arc<Self>, text: &str, attachments: &[Attachment]) -> bool {
        let (generation, resume_id) = {
            let mut state = self.lock_state();
            if state.processing {
                drop(state);
                debug!(session = self.key, "command rejected: busy");
                self.emit(SessionEvent::error(BUSY_MESSAGE));
                return false;
            }
            state.processing = true;
            state.was_aborted = false;
            state.run_generation += 1;
            state.last_activity = Instant::now();
            (state.run_generation, state.session_id.get().map(str::to_string))
        };
        let guard = RunGuard {
            session: Arc::clone(self),
            generation,
        };

        self.record_prompt(text, attachments.len());
        self.emit(SessionEvent::status("processing"));

        if !self.working_directory.is_dir() {
            self.emit(SessionEvent::error(format!(
                "Working directory does not exist: {}",
                self.working_directory.display()
            )));
            return true;
        }

        let spawn = &self.ctx.spawn;
        let args = spawn.build_args(resume_id.as_deref(), !attachments.is_empty());
        let mut command = Command::new(&spawn.program);
        command
            .args(&args)
            .current_dir(&self.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(session = self.key, program = %spawn.program, error = %e, "spawn failed");
                self.emit(SessionEvent::error(format!(
                    "Failed to start {}: {e}",
                    spawn.program
                )));
                return true;
            }
        };

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.lock_state().child = Some(ChildHandle { pid, kill: kill_tx });
        info!(
            session = self.key,
            pid,
            resume = resume_id.as_deref().unwrap_or("-"),
            dir = %self.working_directory.display(),
            "assistant spawned"
        );

        let payload = stdin_payload(text, attachments);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.drive(child, payload, kill_rx, guard).await;
        });
        true
    }

    /// Hard-kill the running command, if any.
    ///
    /// Emits `status: "aborted"` followed by the command's `complete`. Returns
    /// false when nothing was running.
    pub fn abort(&self) -> bool {
        let (handle, generation) = {
            let mut state = self.lock_state();
            let Some(handle) = state.child.take() else {
                return false;
            };
            state.was_aborted = true;
            state.processing = false;
            (handle, state.run_generation)
        };

        info!(session = self.key, pid = handle.pid, "aborting assistant");
        let _ = handle.kill.send(());
        self.emit(SessionEvent::status("aborted"));
        self.finish_run(generation);
        true
    }

    /// Abort and forget the conversation id so the next command starts fresh.
    pub fn reset(&self) {
        self.abort();
        let mut state = self.lock_state();
        state.session_id.clear();
        state.pending_prompts.clear();
        info!(session = self.key, "session reset");
    }

    /// Assign the conversation id and register it for reattachment.
    ///
    /// Returns false if an id is already set; the existing id is kept.
    pub fn set_session_id(self: &Arc<Self>, id: &str) -> bool {
        let pending = {
            let mut state = self.lock_state();
            if !state.session_id.set(id) {
                return false;
            }
            std::mem::take(&mut state.pending_prompts)
        };
        self.ctx.registry.register(id, self);
        for record in pending {
            self.ctx.transcript.record(id, record);
        }
        true
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock_state().session_id.get().map(str::to_string)
    }

    /// Whether a subprocess is currently live.
    pub fn is_running(&self) -> bool {
        self.lock_state().child.is_some()
    }

    /// Whether a command is in flight (including the window before spawn).
    pub fn is_processing(&self) -> bool {
        self.lock_state().processing
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Time since the last command started or finished.
    pub fn idle_for(&self) -> Duration {
        self.lock_state().last_activity.elapsed()
    }

    /// Attach a listener. Events arrive in emission order.
    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<SequencedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.lock_listeners();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.senders.push((id, tx));
        (id, rx)
    }

    /// Detach one listener. Its receiver sees the stream end.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.senders.len();
        listeners.senders.retain(|(lid, _)| *lid != id);
        listeners.senders.len() < before
    }

    /// Detach every listener.
    pub fn detach_listeners(&self) {
        self.lock_listeners().senders.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().senders.len()
    }

    /// Queue an unsequenced event for one listener only.
    ///
    /// It arrives after every event already delivered to that listener.
    /// Returns false if the listener is gone.
    pub fn notify(&self, id: ListenerId, event: SessionEvent) -> bool {
        let listeners = self.lock_listeners();
        listeners
            .senders
            .iter()
            .find(|(lid, _)| *lid == id)
            .is_some_and(|(_, tx)| {
                tx.send(SequencedEvent {
                    event,
                    sequence_id: None,
                })
                .is_ok()
            })
    }

    /// Buffer the event under the conversation id (if known), then deliver it.
    fn emit(&self, event: SessionEvent) {
        self.emit_for(None, event);
    }

    /// Like [`emit`](Self::emit), but dropped once `generation` has completed.
    fn emit_for_run(&self, generation: u64, event: SessionEvent) {
        self.emit_for(Some(generation), event);
    }

    fn emit_for(&self, generation: Option<u64>, event: SessionEvent) {
        // Holding the listener lock across sequencing keeps delivery order
        // identical to sequence order.
        let mut listeners = self.lock_listeners();
        if generation.is_some_and(|g| self.run_finished(g)) {
            debug!(session = self.key, kind = ?event.kind, "dropping event from finished run");
            return;
        }
        let sequence_id = self.session_id().map(|sid| {
            let message = self.ctx.buffer.append(&sid, event.kind, &event.content);
            self.ctx.transcript.record(
                &sid,
                TranscriptRecord::Event {
                    sequence_id: message.sequence_id,
                    kind: event.kind,
                    content: event.content.clone(),
                },
            );
            message.sequence_id
        });
        let update = SequencedEvent { event, sequence_id };
        listeners
            .senders
            .retain(|(_, tx)| tx.send(update.clone()).is_ok());
    }

    fn record_prompt(&self, text: &str, attachments: usize) {
        let record = TranscriptRecord::Prompt {
            text: text.to_string(),
            attachments,
        };
        let sid = {
            let mut state = self.lock_state();
            match state.session_id.get() {
                Some(sid) => sid.to_string(),
                None => {
                    state.pending_prompts.push(record);
                    return;
                }
            }
        };
        self.ctx.transcript.record(&sid, record);
    }

    fn run_finished(&self, generation: u64) -> bool {
        self.lock_state().finished_generation >= generation
    }

    fn handle_line(self: &Arc<Self>, generation: u64, line: &str) {
        if self.run_finished(generation) {
            return;
        }
        for item in decode_line(line) {
            match item {
                StreamItem::SessionId(id) => {
                    if self.set_session_id(&id) {
                        info!(session = self.key, session_id = %id, "conversation id captured");
                        self.emit_for_run(generation, SessionEvent::session(id));
                    } else {
                        debug!(session = self.key, session_id = %id, "ignoring repeated conversation id");
                    }
                }
                StreamItem::Event(event) => self.emit_for_run(generation, event),
                StreamItem::Result(summary) => {
                    info!(
                        session = self.key,
                        subtype = summary.subtype.as_deref().unwrap_or("-"),
                        is_error = summary.is_error,
                        duration_ms = summary.duration_ms,
                        cost_usd = summary.total_cost_usd,
                        "assistant turn finished"
                    );
                }
            }
        }
    }

    /// Own the subprocess until it exits or is killed.
    async fn drive(
        self: Arc<Self>,
        mut child: Child,
        payload: String,
        mut kill_rx: oneshot::Receiver<()>,
        guard: RunGuard,
    ) {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let generation = guard.generation;
        let outcome = tokio::select! {
            biased;
            _ = &mut kill_rx => RunOutcome::Killed,
            (status, stderr_tail) = async {
                let (_, _, tail) = tokio::join!(
                    write_stdin(stdin, payload),
                    self.read_stdout(generation, stdout),
                    read_stderr(stderr),
                );
                (child.wait().await, tail)
            } => RunOutcome::Exited(status, stderr_tail),
        };

        match outcome {
            RunOutcome::Killed => {
                if let Err(e) = child.kill().await {
                    debug!(session = self.key, error = %e, "kill after abort");
                }
                debug!(session = self.key, "assistant killed");
            }
            RunOutcome::Exited(status, stderr_tail) => {
                self.report_exit(generation, status, &stderr_tail);
            }
        }

        drop(guard);
    }

    async fn read_stdout(self: &Arc<Self>, generation: u64, stdout: Option<tokio::process::ChildStdout>) {
        let Some(mut stdout) = stdout else { return };
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if self.run_finished(generation) {
                        break;
                    }
                    for line in decoder.feed(&buf[..n]) {
                        self.handle_line(generation, &line);
                    }
                }
                Err(e) => {
                    warn!(session = self.key, error = %e, "stdout read failed");
                    break;
                }
            }
        }
        if let Some(rest) = decoder.finish() {
            self.handle_line(generation, &rest);
        }
    }

    fn report_exit(&self, generation: u64, status: std::io::Result<ExitStatus>, stderr_tail: &[String]) {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(session = self.key, error = %e, "wait failed");
                self.emit(SessionEvent::error(format!("Failed to wait for process: {e}")));
                return;
            }
        };

        if status.success() {
            info!(session = self.key, "assistant exited");
            return;
        }

        let aborted = {
            let state = self.lock_state();
            state.was_aborted || state.finished_generation >= generation
        };
        if aborted {
            debug!(session = self.key, ?status, "non-zero exit after abort");
            return;
        }

        let mut message = match status.code() {
            Some(code) => format!("Process exited with code {code}"),
            None => "Process was terminated by a signal".to_string(),
        };
        if !stderr_tail.is_empty() {
            message.push_str(": ");
            message.push_str(stderr_tail.join("\n").trim());
        }
        warn!(session = self.key, ?status, "assistant failed");
        self.emit(SessionEvent::error(message));
    }

    /// Emit `complete` for `generation` unless it already has one.
    fn finish_run(&self, generation: u64) {
        {
            let mut state = self.lock_state();
            if state.finished_generation >= generation {
                return;
            }
            state.finished_generation = generation;
            if state.run_generation == generation {
                state.processing = false;
                state.child = None;
            }
            state.last_activity = Instant::now();
        }
        self.emit(SessionEvent::complete());
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn write_stdin(stdin: Option<ChildStdin>, payload: String) {
    let Some(mut stdin) = stdin else { return };
    if let Err(e) = stdin.write_all(payload.as_bytes()).await {
        debug!(error = %e, "stdin write failed");
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "stdin close failed");
    }
}

async fn read_stderr<R: AsyncRead + Unpin>(stderr: Option<R>) -> Vec<String> {
    let Some(mut stderr) = stderr else {
        return Vec::new();
    };
    let mut decoder = LineDecoder::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in decoder.feed(&buf[..n]) {
                    push_tail(&mut tail, line);
                }
            }
        }
    }
    if let Some(rest) = decoder.finish() {
        push_tail(&mut tail, rest);
    }
    tail.into_iter().collect()
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if line.trim().is_empty() {
        return;
    }
    debug!(line = %line, "assistant stderr");
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}
