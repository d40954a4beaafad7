//! # Engine Module
//!
//! The per-spider control plane.
//!
//! ## Overview
//!
//! One engine runs per spider. It assembles the three-stage pipeline
//! (Downloader → Spider → ItemProcessor), wires the seven shared tables
//! between the stages, owns the lifecycle status, and coordinates
//! suspend/continue broadcasts and table snapshots. The engine never
//! touches the data flowing through the pipeline; it only sets up,
//! suspends, resumes, snapshots, and tears down.
//!
//! ## Architecture
//!
//! The engine is a mailbox actor: a dedicated task consuming typed
//! commands, each carrying a reply channel. Setup runs as the actor's
//! first work item, so [`crate::EngineBuilder::start`] returns before the
//! engine is running and any command issued in the meantime is serialized
//! behind setup.
//!
//! ## Internal components
//!
//! - `commands`: the command enum and stop reasons
//! - `core`: the state machine (setup, control, dump, teardown)
//! - `actor`: the spawn function and command loop
//! - `handle`: the clonable public handle

mod actor;
mod commands;
mod core;
mod handle;

use std::path::PathBuf;
use std::time::Duration;

pub use self::commands::StopReason;
pub use self::core::{EngineStatus, SHUTDOWN_BUDGET};
pub use self::handle::EngineHandle;

pub(crate) use self::actor::spawn_engine;
pub(crate) use self::core::EngineConfig;

use crate::error::EngineError;
use crate::registry;
use crate::spider::SpiderId;

fn lookup(spider: &SpiderId) -> Result<EngineHandle, EngineError> {
    registry::engine(spider).ok_or_else(|| EngineError::NotFound(spider.clone()))
}

/// Status of the engine registered under `spider`.
pub async fn status(spider: &SpiderId) -> Result<EngineStatus, EngineError> {
    lookup(spider)?.status().await
}

/// Suspends the engine registered under `spider`.
pub async fn suspend(spider: &SpiderId, timeout: Option<Duration>) -> Result<(), EngineError> {
    lookup(spider)?.suspend(timeout).await
}

/// Resumes the engine registered under `spider`.
pub async fn resume(spider: &SpiderId, timeout: Option<Duration>) -> Result<(), EngineError> {
    lookup(spider)?.resume(timeout).await
}

/// Dumps the tables of the engine registered under `spider`.
pub async fn dump2file(
    spider: &SpiderId,
    base: Option<PathBuf>,
    timeout: Option<Duration>,
) -> Result<PathBuf, EngineError> {
    lookup(spider)?.dump2file(base, timeout).await
}

/// See [`EngineHandle::dump2file_force`].
pub async fn dump2file_force(
    spider: &SpiderId,
    base: Option<PathBuf>,
    timeout: Option<Duration>,
) -> Result<PathBuf, EngineError> {
    lookup(spider)?.dump2file_force(base, timeout).await
}

/// Stops the engine registered under `spider`.
pub async fn stop(spider: &SpiderId, reason: StopReason) -> Result<(), EngineError> {
    lookup(spider)?.stop(reason).await
}
