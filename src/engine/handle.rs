//! Handle for communicating with the engine actor.

use std::path::PathBuf;
use std::time::Duration;

use kanal::AsyncSender;
use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::spider::SpiderId;

use super::commands::{EngineCommand, StopReason};
use super::EngineStatus;

/// Clonable handle to a running engine.
///
/// Every blocking operation takes an optional timeout (`None` waits
/// indefinitely). A timeout aborts only the waiting caller; the operation
/// keeps running inside the actor and the resulting status can be observed
/// with [`EngineHandle::status`].
#[derive(Clone, Debug)]
pub struct EngineHandle {
    spider: SpiderId,
    sender: AsyncSender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(spider: SpiderId, sender: AsyncSender<EngineCommand>) -> Self {
        EngineHandle { spider, sender }
    }

    pub fn spider(&self) -> &SpiderId {
        &self.spider
    }

    /// Current lifecycle status. Constant-time; never blocks on stage
    /// activity.
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (responder, reply) = oneshot::channel();
        self.send(EngineCommand::Status { responder }).await?;
        reply.await.map_err(|_| EngineError::EngineDown)
    }

    /// Suspends all three stages. Returns once each has acknowledged
    /// quiescence. Idempotent: suspending a suspended engine succeeds
    /// immediately.
    ///
    /// Suspension is the engine's quiescent point, not a drain barrier: the
    /// stages stop mutating the tables, but whatever was in flight between
    /// them before the broadcast is wherever they left it.
    pub async fn suspend(&self, timeout: Option<Duration>) -> Result<(), EngineError> {
        let (responder, reply) = oneshot::channel();
        self.send(EngineCommand::Suspend { responder }).await?;
        await_reply(reply, timeout, "suspend").await?
    }

    /// Resumes all three stages. Symmetric to [`EngineHandle::suspend`].
    pub async fn resume(&self, timeout: Option<Duration>) -> Result<(), EngineError> {
        let (responder, reply) = oneshot::channel();
        self.send(EngineCommand::Resume { responder }).await?;
        await_reply(reply, timeout, "continue").await?
    }

    /// Dumps the seven tables under `base`, deriving
    /// `./data/<spider>_<unix_seconds>` when absent. Requires the engine to
    /// be suspended. Returns the base path written.
    pub async fn dump2file(
        &self,
        base: Option<PathBuf>,
        timeout: Option<Duration>,
    ) -> Result<PathBuf, EngineError> {
        self.dump2file_force(base, timeout).await
    }

    /// Same gate and effect as [`EngineHandle::dump2file`]; callers that
    /// confirm interactively wrap this one.
    pub async fn dump2file_force(
        &self,
        base: Option<PathBuf>,
        timeout: Option<Duration>,
    ) -> Result<PathBuf, EngineError> {
        let (responder, reply) = oneshot::channel();
        self.send(EngineCommand::Dump { base, responder }).await?;
        await_reply(reply, timeout, "dump2file").await?
    }

    /// Runs the teardown sequence and stops the actor. Returns once the
    /// hooks have run and the detached stage stop is scheduled.
    pub async fn stop(&self, reason: StopReason) -> Result<(), EngineError> {
        let (responder, reply) = oneshot::channel();
        self.send(EngineCommand::Stop { reason, responder }).await?;
        reply.await.map_err(|_| EngineError::EngineDown)
    }

    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| EngineError::EngineDown)
    }
}

async fn await_reply<T>(
    reply: oneshot::Receiver<T>,
    timeout: Option<Duration>,
    op: &'static str,
) -> Result<T, EngineError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, reply).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(EngineError::EngineDown),
            Err(_) => Err(EngineError::Timeout { op }),
        },
        None => reply.await.map_err(|_| EngineError::EngineDown),
    }
}
