//! Command definitions for the engine actor.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::stage::Component;

use super::EngineStatus;

/// Commands the engine actor accepts.
///
/// Each control command carries a response channel; the actor processes one
/// command at a time, so no lock guards the engine state. Commands queued
/// while setup is still running are served only after it completes.
pub enum EngineCommand {
    /// Read the current lifecycle status. Never blocks on stage activity.
    Status {
        responder: oneshot::Sender<EngineStatus>,
    },
    /// Suspend all three stages, then transition to suspended.
    Suspend {
        responder: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Resume all three stages, then transition back to running.
    Resume {
        responder: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Dump the seven tables under a base path. Requires suspended status;
    /// replies with the base actually written.
    Dump {
        base: Option<PathBuf>,
        responder: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
    /// Run the teardown sequence and exit the actor.
    Stop {
        reason: StopReason,
        responder: oneshot::Sender<()>,
    },
    /// Posted by a stage monitor when a stage's worker exits on its own.
    StageExited { component: Component },
}

/// Why the engine is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Normal,
    Abnormal(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Normal => f.write_str("normal"),
            StopReason::Abnormal(reason) => write!(f, "abnormal: {reason}"),
        }
    }
}
