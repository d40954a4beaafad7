//! Requester and storage plugins.
//!
//! Plugins contribute to a stage's option bundle at setup time. The
//! downloader bundle names its requester under the `requester` key, the
//! item-processor bundle its storage under `storage`; both accept a bare
//! plugin id or an `(id, args)` pair and fall back to a framework default
//! when absent. Implementations register themselves in a process-wide
//! directory keyed by id; an id without a registered implementation is
//! still injected into the stage's context, it just contributes nothing to
//! the bundle.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;
use crate::options::{self, OptionValue, Options};

/// Id injected when the downloader bundle names no requester.
pub const DEFAULT_REQUESTER: &str = "requester.default";
/// Id injected when the item-processor bundle names no storage.
pub const DEFAULT_STORAGE: &str = "storage.default";

/// A requester implementation that may amend the downloader bundle before
/// the stage starts.
#[async_trait]
pub trait RequesterPlugin: Send + Sync + 'static {
    fn id(&self) -> &str;

    async fn prepare_for_start(
        &self,
        args: &Value,
        options: Options,
    ) -> Result<Options, EngineError> {
        let _ = args;
        Ok(options)
    }
}

/// A storage implementation that may amend the item-processor bundle before
/// the stage starts.
#[async_trait]
pub trait StoragePlugin: Send + Sync + 'static {
    fn id(&self) -> &str;

    async fn prepare_for_start(
        &self,
        args: &Value,
        options: Options,
    ) -> Result<Options, EngineError> {
        let _ = args;
        Ok(options)
    }
}

static REQUESTERS: Lazy<DashMap<String, Arc<dyn RequesterPlugin>>> = Lazy::new(DashMap::new);

static STORAGES: Lazy<DashMap<String, Arc<dyn StoragePlugin>>> = Lazy::new(DashMap::new);

pub fn register_requester(plugin: Arc<dyn RequesterPlugin>) {
    REQUESTERS.insert(plugin.id().to_string(), plugin);
}

pub fn requester(id: &str) -> Option<Arc<dyn RequesterPlugin>> {
    REQUESTERS.get(id).map(|entry| entry.value().clone())
}

pub fn register_storage(plugin: Arc<dyn StoragePlugin>) {
    STORAGES.insert(plugin.id().to_string(), plugin);
}

pub fn storage(id: &str) -> Option<Arc<dyn StoragePlugin>> {
    STORAGES.get(id).map(|entry| entry.value().clone())
}

/// Parses a plugin option value into `(id, args)`.
fn parse_spec(
    value: Option<&OptionValue>,
    default_id: &str,
    key: &str,
) -> Result<(String, Value), EngineError> {
    match value {
        None => Ok((default_id.to_string(), Value::Null)),
        Some(OptionValue::Text(id)) => Ok((id.clone(), Value::Null)),
        Some(OptionValue::Plugin { id, args }) => Ok((id.clone(), args.clone())),
        Some(other) => Err(EngineError::Configuration(format!(
            "malformed {key} specification: {other:?}"
        ))),
    }
}

/// Resolves the downloader bundle's requester: injects the id into the
/// context, then lets a registered plugin amend the bundle.
pub(crate) async fn resolve_requester(mut options: Options) -> Result<Options, EngineError> {
    let (id, args) = parse_spec(
        options.get(options::REQUESTER),
        DEFAULT_REQUESTER,
        options::REQUESTER,
    )?;
    options.update_context(options::REQUESTER, Value::String(id.clone()));

    if let Some(plugin) = requester(&id) {
        options = plugin.prepare_for_start(&args, options).await?;
    } else {
        debug!(requester = %id, "no registered requester plugin, bundle unchanged");
    }
    Ok(options)
}

/// Resolves the item-processor bundle's storage: lets a registered plugin
/// amend the bundle, then merges the id and its options into the context.
pub(crate) async fn resolve_storage(mut options: Options) -> Result<Options, EngineError> {
    let (id, args) = parse_spec(
        options.get(options::STORAGE),
        DEFAULT_STORAGE,
        options::STORAGE,
    )?;

    if let Some(plugin) = storage(&id) {
        options = plugin.prepare_for_start(&args, options).await?;
    } else {
        debug!(storage = %id, "no registered storage plugin, bundle unchanged");
    }

    options.update_context(options::STORAGE, Value::String(id));
    options.update_context("storage_options", args);
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn absent_requester_resolves_to_the_default() {
        let options = resolve_requester(Options::new()).await.unwrap();
        assert_eq!(
            options.context().get(options::REQUESTER),
            Some(&json!(DEFAULT_REQUESTER))
        );
    }

    #[tokio::test]
    async fn bare_id_resolves_with_empty_args() {
        let options = Options::new().with(
            options::REQUESTER,
            OptionValue::Text("requester.http".into()),
        );
        let options = resolve_requester(options).await.unwrap();
        assert_eq!(
            options.context().get(options::REQUESTER),
            Some(&json!("requester.http"))
        );
    }

    #[tokio::test]
    async fn malformed_spec_is_a_configuration_error() {
        let options = Options::new().with(options::REQUESTER, OptionValue::Int(7));
        assert!(matches!(
            resolve_requester(options).await,
            Err(EngineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn storage_resolution_merges_id_and_options() {
        let options = Options::new().with(
            options::STORAGE,
            OptionValue::Plugin {
                id: "storage.jsonl".into(),
                args: json!({"path": "/tmp/out.jsonl"}),
            },
        );
        let options = resolve_storage(options).await.unwrap();

        let context = options.context();
        assert_eq!(context.get(options::STORAGE), Some(&json!("storage.jsonl")));
        assert_eq!(
            context.get("storage_options"),
            Some(&json!({"path": "/tmp/out.jsonl"}))
        );
    }

    #[tokio::test]
    async fn registered_plugin_amends_the_bundle() {
        struct Recording;

        #[async_trait]
        impl RequesterPlugin for Recording {
            fn id(&self) -> &str {
                "requester.recording"
            }

            async fn prepare_for_start(
                &self,
                args: &Value,
                options: Options,
            ) -> Result<Options, EngineError> {
                Ok(options.with("seen_args", OptionValue::Json(args.clone())))
            }
        }

        register_requester(Arc::new(Recording));

        let options = Options::new().with(
            options::REQUESTER,
            OptionValue::Plugin {
                id: "requester.recording".into(),
                args: json!([1, 2]),
            },
        );
        let options = resolve_requester(options).await.unwrap();
        assert_eq!(options.get("seen_args"), Some(&OptionValue::Json(json!([1, 2]))));
    }
}
