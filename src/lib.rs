//! # spider-engine
//!
//! Per-spider control plane for a staged web-crawling pipeline.
//!
//! Provides the main components: the engine actor and its handle, shared
//! tables with snapshot/restore, the stage runner contract, and the
//! spider/plugin/pipeline hook traits.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::{EngineBuilder, StopReason, TableRole};
//! use spider_engine::registry;
//! use serde_json::json;
//!
//! async fn run() -> Result<(), spider_engine::EngineError> {
//!     let engine = EngineBuilder::new("news-spider").start()?;
//!
//!     // Stages pick their tables up through the registry; callers can too.
//!     let spider_table = registry::lookup_table(engine.spider(), "spider_tid").unwrap();
//!     spider_table.insert("seed", json!({"url": "https://example.com"}));
//!
//!     engine.suspend(None).await?;
//!     let base = engine.dump2file(None, None).await?;
//!     println!("snapshot written under {}", base.display());
//!     engine.resume(None).await?;
//!
//!     engine.stop(StopReason::Normal).await
//! }
//! ```

pub mod builder;
pub mod engine;
pub mod error;
pub mod options;
pub mod pipeline;
pub mod plugin;
pub mod prelude;
pub mod registry;
pub mod spider;
pub mod stage;
pub mod table;

pub use builder::EngineBuilder;
pub use engine::{EngineHandle, EngineStatus, StopReason, SHUTDOWN_BUDGET};
pub use error::EngineError;
pub use options::{OptionValue, Options};
pub use plugin::{RequesterPlugin, StoragePlugin};
pub use spider::{EngineContext, SpiderHooks, SpiderId};
pub use stage::{Component, ControlAck, Stage, StageCommand, StageHandle, WorkerStage};
pub use table::{SharedTable, TableHandle, TableRole, TableSet};

pub use async_trait::async_trait;
pub use dashmap::DashMap;
pub use tokio;
