//! A "prelude" for users of the `spider-engine` crate.
//!
//! This prelude re-exports the most commonly used traits and structs so
//! that they can be easily imported.
//!
//! # Example
//!
//! ```
//! use spider_engine::prelude::*;
//! ```

pub use crate::{
    // Core structs
    EngineBuilder,
    EngineHandle,
    EngineStatus,
    Options,
    OptionValue,
    StopReason,
    // Core traits
    SpiderHooks,
    Stage,
    // Essential re-exports for trait implementation
    async_trait,
};

pub use crate::error::EngineError;
pub use crate::spider::{EngineContext, SpiderId};
pub use crate::stage::{Component, ControlAck, StageCommand, StageHandle};
pub use crate::table::{TableHandle, TableRole};
