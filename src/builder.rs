//! # Builder Module
//!
//! Provides the `EngineBuilder`, a fluent API for constructing and starting
//! engine instances.
//!
//! ## Overview
//!
//! The builder collects everything the engine is constructed with: the
//! spider id (required), the three stage implementations (defaulting to the
//! built-in worker stage), optional spider hooks, per-stage user option
//! overrides, and an optional snapshot base path to restore from.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::{EngineBuilder, OptionValue, Options};
//!
//! let engine = EngineBuilder::new("news-spider")
//!     .downloader_options(Options::new().with("concurrency", OptionValue::Int(16)))
//!     .load_from_file("./data/news-spider_1700000000")
//!     .start()?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::{spawn_engine, EngineConfig, EngineHandle};
use crate::error::EngineError;
use crate::options::Options;
use crate::spider::{SpiderHooks, SpiderId};
use crate::stage::{Stage, WorkerStage};

pub struct EngineBuilder {
    spider: SpiderId,
    hooks: Option<Arc<dyn SpiderHooks>>,
    downloader_stage: Arc<dyn Stage>,
    spider_stage: Arc<dyn Stage>,
    item_processor_stage: Arc<dyn Stage>,
    downloader_options: Options,
    spider_options: Options,
    item_processor_options: Options,
    load_from_file: Option<PathBuf>,
}

impl EngineBuilder {
    /// Creates a builder for the given spider with the built-in worker
    /// stage in all three positions.
    pub fn new(spider: impl Into<SpiderId>) -> Self {
        EngineBuilder {
            spider: spider.into(),
            hooks: None,
            downloader_stage: Arc::new(WorkerStage::default()),
            spider_stage: Arc::new(WorkerStage::default()),
            item_processor_stage: Arc::new(WorkerStage::default()),
            downloader_options: Options::new(),
            spider_options: Options::new(),
            item_processor_options: Options::new(),
            load_from_file: None,
        }
    }

    /// Sets the spider's lifecycle hooks.
    pub fn hooks(mut self, hooks: Arc<dyn SpiderHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Sets the downloader stage implementation.
    pub fn downloader_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.downloader_stage = stage;
        self
    }

    /// Sets the spider stage implementation.
    pub fn spider_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.spider_stage = stage;
        self
    }

    /// Sets the item-processor stage implementation.
    pub fn item_processor_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.item_processor_stage = stage;
        self
    }

    /// User option overrides appended after the framework prefix on the
    /// downloader bundle.
    pub fn downloader_options(mut self, options: Options) -> Self {
        self.downloader_options = options;
        self
    }

    /// User option overrides for the spider bundle.
    pub fn spider_options(mut self, options: Options) -> Self {
        self.spider_options = options;
        self
    }

    /// User option overrides for the item-processor bundle.
    pub fn item_processor_options(mut self, options: Options) -> Self {
        self.item_processor_options = options;
        self
    }

    /// Restores the seven tables from snapshot files under `base` instead
    /// of creating fresh ones.
    pub fn load_from_file(mut self, base: impl Into<PathBuf>) -> Self {
        self.load_from_file = Some(base.into());
        self
    }

    /// Registers the engine name and spawns the actor. Returns once the
    /// actor is alive; setup completes asynchronously, and commands issued
    /// against the handle queue behind it.
    pub fn start(self) -> Result<EngineHandle, EngineError> {
        if self.spider.as_str().is_empty() {
            return Err(EngineError::Configuration(
                "spider id must not be empty".to_string(),
            ));
        }

        spawn_engine(EngineConfig {
            spider: self.spider,
            hooks: self.hooks,
            downloader_stage: self.downloader_stage,
            spider_stage: self.spider_stage,
            item_processor_stage: self.item_processor_stage,
            downloader_options: self.downloader_options,
            spider_options: self.spider_options,
            item_processor_options: self.item_processor_options,
            load_from_file: self.load_from_file,
        })
    }
}
