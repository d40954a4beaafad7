//! # Spider Module
//!
//! Defines the spider identity and the optional per-spider lifecycle hooks.
//!
//! ## Overview
//!
//! A spider is the user-defined description of a crawl job. The engine only
//! needs two things from it: a unique [`SpiderId`] naming the engine
//! instance, and an optional [`SpiderHooks`] implementation whose callbacks
//! run at well-defined points of setup and teardown.
//!
//! Every hook has a default implementation, so a spider that cares about
//! none of them implements the trait with an empty body and the engine
//! skips past each callback silently.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::{async_trait, EngineContext, SpiderHooks, TableRole};
//! use spider_engine::error::EngineError;
//! use serde_json::json;
//!
//! struct NewsSpider;
//!
//! #[async_trait]
//! impl SpiderHooks for NewsSpider {
//!     async fn prepare_for_start(&self, ctx: &EngineContext) -> Result<(), EngineError> {
//!         // Seed the first request once the pipeline is running.
//!         ctx.table(TableRole::Downloader)
//!             .insert("seed", json!({"url": "https://example.com/news"}));
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::options::Options;
use crate::stage::Component;
use crate::table::{TableHandle, TableRole, TableSet};

/// Opaque identifier naming a single engine instance.
///
/// Cheap to clone; two engines with the same id must not coexist, which the
/// engine directory enforces at start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiderId(Arc<str>);

impl SpiderId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        SpiderId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpiderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpiderId {
    fn from(id: &str) -> Self {
        SpiderId::new(id)
    }
}

impl From<String> for SpiderId {
    fn from(id: String) -> Self {
        SpiderId::new(id)
    }
}

/// The engine view handed to [`SpiderHooks::prepare_for_start`]: the spider
/// id and the seven live tables. This is where a spider seeds its initial
/// requests.
#[derive(Debug, Clone)]
pub struct EngineContext {
    spider: SpiderId,
    tables: TableSet,
}

impl EngineContext {
    pub(crate) fn new(spider: SpiderId, tables: TableSet) -> Self {
        EngineContext { spider, tables }
    }

    pub fn spider(&self) -> &SpiderId {
        &self.spider
    }

    pub fn table(&self, role: TableRole) -> &TableHandle {
        self.tables.get(role)
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }
}

/// Optional lifecycle callbacks of a spider.
///
/// Component hooks run once per stage; whole-engine hooks run once per
/// lifecycle edge. Setup-side errors abort engine setup; teardown-side
/// errors are logged and never block the shutdown sequence.
#[async_trait]
pub trait SpiderHooks: Send + Sync + 'static {
    /// Runs on each stage's finalized option bundle just before the stage
    /// starts. Returns the bundle the stage will actually receive.
    async fn prepare_for_start_component(
        &self,
        component: Component,
        options: Options,
    ) -> Result<Options, EngineError> {
        let _ = component;
        Ok(options)
    }

    /// Runs once after all three stages have started and the engine has
    /// transitioned to running.
    async fn prepare_for_start(&self, ctx: &EngineContext) -> Result<(), EngineError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs on teardown for each stage, with the exact bundle the stage was
    /// started with.
    async fn prepare_for_stop_component(
        &self,
        component: Component,
        options: &Options,
    ) -> Result<(), EngineError> {
        let _ = (component, options);
        Ok(())
    }

    /// Runs once at the end of the teardown hook sequence.
    async fn prepare_for_stop(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
