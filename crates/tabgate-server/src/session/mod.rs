//! Session subsystem: assistant subprocesses, replay buffer, transcripts and
//! the tab/conversation registries.

pub mod message_buffer;
pub mod process;
pub mod registry;
pub mod transcript;

pub use message_buffer::{MessageBuffer, DEFAULT_BUFFER_CAPACITY};
pub use process::{ProcessSession, SessionContext, SpawnConfig};
pub use registry::{SessionRegistry, TabRegistry};
pub use transcript::TranscriptLog;
