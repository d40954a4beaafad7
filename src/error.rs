//! Error types for the engine and its collaborators.

use std::path::PathBuf;

use crate::engine::EngineStatus;
use crate::spider::SpiderId;
use crate::stage::Component;

/// Errors surfaced by the engine.
///
/// Setup errors (`Configuration`, `TableLoad`, `StageStart`) are fatal: the
/// engine actor exits and its name is unregistered. Steady-state control
/// errors are returned to the caller; `ControlContract` additionally
/// terminates the engine, since continuing would leave the status field
/// lying about actual stage state.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine was constructed with invalid options.
    #[error("invalid engine configuration: {0}")]
    Configuration(String),

    /// A table file could not be read, or failed its integrity check.
    #[error("failed to load table file {}: {reason}", file.display())]
    TableLoad { file: PathBuf, reason: String },

    /// A table file could not be written or flushed.
    #[error("failed to dump table file {}: {reason}", file.display())]
    TableDump { file: PathBuf, reason: String },

    /// A stage constructor failed during setup.
    #[error("{component} stage failed to start: {reason}")]
    StageStart {
        component: Component,
        reason: String,
    },

    /// A stage replied with something other than an acknowledgement to a
    /// suspend or continue broadcast.
    #[error("{component} stage broke the control contract: {reply}")]
    ControlContract {
        component: Component,
        reply: String,
    },

    /// The operation requires the suspended status.
    #[error("operation requires a suspended engine, status is {status}")]
    StatusError { status: EngineStatus },

    /// An engine with this spider id is already running.
    #[error("an engine named {0} is already running")]
    AlreadyStarted(SpiderId),

    /// No running engine is registered under this spider id.
    #[error("no engine named {0}")]
    NotFound(SpiderId),

    /// The engine actor is gone; its mailbox is closed.
    #[error("engine is down")]
    EngineDown,

    /// A control call did not complete within the caller's timeout. The
    /// operation keeps running inside the engine; re-check with `status`.
    #[error("{op} timed out")]
    Timeout { op: &'static str },
}
