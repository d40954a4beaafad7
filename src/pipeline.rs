//! Pipeline middleware stop hooks.
//!
//! A stage's bundle may carry a `pipelines` key: a JSON array of hook ids
//! naming the middleware configured for that stage. At teardown the engine
//! walks the list and gives every registered hook a chance to flush or
//! release whatever middleware state it keeps in the pipeline tables. Hook
//! failures are logged and never block the shutdown sequence.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::options::{self, OptionValue, Options};

/// Lifecycle hook of one pipeline middleware.
#[async_trait]
pub trait PipelineHook: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Runs at engine teardown with the owning stage's option bundle.
    async fn prepare_for_stop(&self, options: &Options) -> Result<(), EngineError> {
        let _ = options;
        Ok(())
    }
}

static HOOKS: Lazy<DashMap<String, Arc<dyn PipelineHook>>> = Lazy::new(DashMap::new);

pub fn register_hook(hook: Arc<dyn PipelineHook>) {
    HOOKS.insert(hook.id().to_string(), hook);
}

pub fn hook(id: &str) -> Option<Arc<dyn PipelineHook>> {
    HOOKS.get(id).map(|entry| entry.value().clone())
}

/// Ids configured under the bundle's `pipelines` key.
fn configured_ids(options: &Options) -> Vec<String> {
    match options.get(options::PIPELINES) {
        Some(OptionValue::Json(Value::Array(ids))) => ids
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Runs `prepare_for_stop` on every registered hook the bundle names.
pub(crate) async fn prepare_for_stop_all(options: &Options) {
    for id in configured_ids(options) {
        match hook(&id) {
            Some(hook) => {
                if let Err(error) = hook.prepare_for_stop(options).await {
                    warn!(pipeline = %id, %error, "pipeline stop hook failed");
                }
            }
            None => debug!(pipeline = %id, "no registered pipeline hook"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn stop_runs_registered_hooks_and_skips_unknown_ids() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct Flushing;

        #[async_trait]
        impl PipelineHook for Flushing {
            fn id(&self) -> &str {
                "pipeline.flushing"
            }

            async fn prepare_for_stop(&self, _options: &Options) -> Result<(), EngineError> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        register_hook(Arc::new(Flushing));

        let options = Options::new().with(
            options::PIPELINES,
            OptionValue::Json(json!(["pipeline.flushing", "pipeline.unknown"])),
        );
        prepare_for_stop_all(&options).await;

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bundles_without_pipelines_are_a_no_op() {
        prepare_for_stop_all(&Options::new()).await;
    }
}
