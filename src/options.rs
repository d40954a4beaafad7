//! Option bundles handed to pipeline stages at construction.
//!
//! A bundle is an ordered list of `(key, value)` pairs. Lookup scans from the
//! front and the first occurrence of a key wins, so a framework-supplied
//! prefix concatenated ahead of user overrides takes precedence for the
//! reserved keys (`spider`, `tid`, `next_tid`, `common_pipeline_tid`,
//! `pipeline_tid`) without any merging logic. Everything else flows through
//! to the stage unchanged.

use serde_json::{Map, Value};

use crate::table::TableHandle;

/// Reserved key: the spider id owning the pipeline.
pub const SPIDER: &str = "spider";
/// Reserved key: the stage's own table handle.
pub const TID: &str = "tid";
/// Reserved key: the next stage's table handle (absent for the last stage).
pub const NEXT_TID: &str = "next_tid";
/// Reserved key: the pipeline table shared by all stages.
pub const COMMON_PIPELINE_TID: &str = "common_pipeline_tid";
/// Reserved key: the stage's own pipeline table.
pub const PIPELINE_TID: &str = "pipeline_tid";
/// Key holding the stage's context map.
pub const CONTEXT: &str = "context";
/// Key selecting the requester plugin on the downloader bundle.
pub const REQUESTER: &str = "requester";
/// Key selecting the storage plugin on the item-processor bundle.
pub const STORAGE: &str = "storage";
/// Key listing the pipeline hook ids configured for a stage.
pub const PIPELINES: &str = "pipelines";

/// A single option value.
///
/// Table handles are first-class so stages receive live references rather
/// than names they would have to resolve; everything else rides on JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Text(String),
    Int(i64),
    Flag(bool),
    Table(TableHandle),
    Json(Value),
    /// A plugin reference with its startup arguments.
    Plugin { id: String, args: Value },
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableHandle> {
        match self {
            OptionValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            OptionValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// An ordered option bundle with first-occurrence-wins lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    entries: Vec<(String, OptionValue)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a bundle from a framework prefix followed by user overrides.
    /// The prefix comes first, so its keys shadow user-supplied duplicates.
    pub fn prefixed(prefix: Vec<(String, OptionValue)>, user: &Options) -> Self {
        let mut entries = prefix;
        entries.extend(user.entries.iter().cloned());
        Options { entries }
    }

    /// Appends an entry. An existing entry with the same key keeps
    /// precedence; use [`Options::set`] to override.
    pub fn push(&mut self, key: impl Into<String>, value: OptionValue) {
        self.entries.push((key.into(), value));
    }

    /// Builder-style [`Options::push`].
    pub fn with(mut self, key: impl Into<String>, value: OptionValue) -> Self {
        self.push(key, value);
        self
    }

    /// Returns the first occurrence of `key`, if any.
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Replaces the first occurrence of `key`, or appends when absent.
    pub fn set(&mut self, key: &str, value: OptionValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// The stage's context map. Missing or non-object contexts read as empty.
    pub fn context(&self) -> Map<String, Value> {
        match self.get(CONTEXT) {
            Some(OptionValue::Json(Value::Object(map))) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Inserts `key` into the context map, creating the map when absent.
    pub fn update_context(&mut self, key: &str, value: Value) {
        let mut context = self.context();
        context.insert(key.to_string(), value);
        self.set(CONTEXT, OptionValue::Json(Value::Object(context)));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, OptionValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, OptionValue)> for Options {
    fn from_iter<I: IntoIterator<Item = (String, OptionValue)>>(iter: I) -> Self {
        Options {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_occurrence_wins() {
        let user = Options::new()
            .with(TID, OptionValue::Text("user-tid".into()))
            .with("retries", OptionValue::Int(3));
        let bundle = Options::prefixed(
            vec![(TID.to_string(), OptionValue::Text("framework-tid".into()))],
            &user,
        );

        assert_eq!(bundle.get(TID).and_then(|v| v.as_str()), Some("framework-tid"));
        assert_eq!(bundle.get("retries"), Some(&OptionValue::Int(3)));
        assert_eq!(bundle.len(), 3);
    }

    #[test]
    fn set_replaces_only_first_occurrence() {
        let mut bundle = Options::new()
            .with("k", OptionValue::Int(1))
            .with("k", OptionValue::Int(2));
        bundle.set("k", OptionValue::Int(9));

        assert_eq!(bundle.get("k"), Some(&OptionValue::Int(9)));
        assert_eq!(bundle.len(), 2);
    }

    #[test]
    fn update_context_creates_and_extends_the_map() {
        let mut bundle = Options::new();
        bundle.update_context("requester", json!("requester.default"));
        bundle.update_context("storage", json!("storage.noop"));

        let context = bundle.context();
        assert_eq!(context.get("requester"), Some(&json!("requester.default")));
        assert_eq!(context.get("storage"), Some(&json!("storage.noop")));
    }
}
