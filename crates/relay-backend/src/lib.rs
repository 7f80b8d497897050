//! Channels to the agent engine CLI.
//!
//! [`StructuredBackend`] speaks the bidirectional stream-json protocol and
//! treats any malformed message as a hard decode failure.
//! [`SubprocessBackend`] runs a one-shot `-p` invocation and skips lines it
//! cannot parse. [`ScriptedBackend`] replays canned runs for tests and demos.

pub mod command;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod scripted;
pub mod structured;
pub mod subprocess;

pub use command::EngineCommand;
pub use config::EngineConfig;
pub use protocol::{EngineMessage, TranscriptBuilder};
pub use registry::ActiveRuns;
pub use scripted::{RecordingSink, ScriptedBackend, ScriptedRun};
pub use structured::StructuredBackend;
pub use subprocess::SubprocessBackend;

/// Last `max_chars` characters of `text`, for error messages.
pub(crate) fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim().to_string();
    }
    text.chars().skip(count - max_chars).collect::<String>().trim().to_string()
}
