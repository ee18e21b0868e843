//! Loader configuration store
//!
//! A validated, mergeable configuration bag consumed by the engine and its
//! collaborators. Malformed fields are defaulted at merge time, never
//! rejected.

use crate::error::LoaderError;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::fmt;
use std::rc::Rc;
use tracing::warn;

/// Sink receiving errors that no module handled locally.
pub type ErrorSink = Rc<dyn Fn(&LoaderError)>;

/// Prefix of ids the engine generates for synthetic entry modules.
pub const ANONYMOUS_PREFIX: &str = "==anonymous";

/// Validated configuration for one loading session.
#[derive(Clone)]
pub struct Configuration {
    /// Location prefix joined onto ids that no `paths` rule rewrites.
    pub base_location: String,

    /// Id-prefix rewrite rules; each rule maps to one or more candidate
    /// locations, tried in order.
    pub paths: FxHashMap<String, Vec<String>>,

    /// Per-module configuration handed out through `module.config()`.
    pub module_config: FxHashMap<String, Value>,

    /// Module ids for which duplicate-definition warnings are suppressed.
    pub ignore_duplicate_modules: FxHashSet<String>,

    /// Build passes harvest the dependency graph without running the
    /// factories of named modules.
    pub is_build: bool,

    /// Capture factory errors instead of panicking. Disabling this is a
    /// debugging aid only.
    pub catch_errors: bool,

    /// Receives errors that found no local handler.
    pub on_error: ErrorSink,
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("base_location", &self.base_location)
            .field("paths", &self.paths)
            .field("module_config", &self.module_config)
            .field("ignore_duplicate_modules", &self.ignore_duplicate_modules)
            .field("is_build", &self.is_build)
            .field("catch_errors", &self.catch_errors)
            .finish()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            base_location: String::new(),
            paths: FxHashMap::default(),
            module_config: FxHashMap::default(),
            ignore_duplicate_modules: FxHashSet::default(),
            is_build: false,
            catch_errors: true,
            on_error: Rc::new(|error| tracing::error!("unhandled loader error: {error}")),
        }
    }
}

/// Partial configuration; only fields that are present take part in a merge.
#[derive(Clone, Default)]
pub struct ConfigurationOptions {
    /// See [`Configuration::base_location`]. Merge policy: replace.
    pub base_location: Option<String>,
    /// See [`Configuration::paths`]. Merge policy: replace per rule key.
    pub paths: Option<FxHashMap<String, Vec<String>>>,
    /// See [`Configuration::module_config`]. Merge policy: deep merge by key.
    pub module_config: Option<FxHashMap<String, Value>>,
    /// See [`Configuration::ignore_duplicate_modules`]. Merge policy: union.
    pub ignore_duplicate_modules: Option<Vec<String>>,
    /// See [`Configuration::is_build`]. Merge policy: replace.
    pub is_build: Option<bool>,
    /// See [`Configuration::catch_errors`]. Merge policy: replace.
    pub catch_errors: Option<bool>,
    /// See [`Configuration::on_error`]. Merge policy: replace.
    pub on_error: Option<ErrorSink>,
}

impl fmt::Debug for ConfigurationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationOptions")
            .field("base_location", &self.base_location)
            .field("paths", &self.paths)
            .field("module_config", &self.module_config)
            .field("ignore_duplicate_modules", &self.ignore_duplicate_modules)
            .field("is_build", &self.is_build)
            .field("catch_errors", &self.catch_errors)
            .finish()
    }
}

impl Configuration {
    /// Apply `options` on top of this configuration.
    ///
    /// With `overwrite` the store is reset to its defaults first, so fields
    /// absent from `options` fall back to their default values instead of
    /// keeping the current ones.
    pub fn merge(&mut self, options: ConfigurationOptions, overwrite: bool) {
        if overwrite {
            *self = Configuration::default();
        }
        let options = validate(options);
        if let Some(base_location) = options.base_location {
            self.base_location = base_location;
        }
        if let Some(rules) = options.paths {
            for (rule, candidates) in rules {
                self.paths.insert(rule, candidates);
            }
        }
        if let Some(configs) = options.module_config {
            for (id, incoming) in configs {
                match self.module_config.get_mut(&id) {
                    Some(existing) => deep_merge(existing, incoming),
                    None => {
                        self.module_config.insert(id, incoming);
                    }
                }
            }
        }
        if let Some(ids) = options.ignore_duplicate_modules {
            self.ignore_duplicate_modules.extend(ids);
        }
        if let Some(is_build) = options.is_build {
            self.is_build = is_build;
        }
        if let Some(catch_errors) = options.catch_errors {
            self.catch_errors = catch_errors;
        }
        if let Some(on_error) = options.on_error {
            self.on_error = on_error;
        }
    }

    /// Per-module configuration, `Null` when none was provided.
    pub fn config_for_module(&self, id: &str) -> Value {
        self.module_config.get(id).cloned().unwrap_or(Value::Null)
    }

    /// Whether duplicate-definition warnings are suppressed for `id`.
    pub fn is_duplicate_ignored_for(&self, id: &str) -> bool {
        self.ignore_duplicate_modules.contains(id)
    }

    /// Build passes skip the factories of named modules; synthetic entry
    /// modules still invoke theirs.
    pub fn should_invoke_factory(&self, id: &str) -> bool {
        !self.is_build || id.starts_with(ANONYMOUS_PREFIX)
    }
}

/// Default malformed fields instead of failing.
fn validate(mut options: ConfigurationOptions) -> ConfigurationOptions {
    if let Some(paths) = options.paths.as_mut() {
        paths.retain(|rule, candidates| {
            candidates.retain(|candidate| !candidate.is_empty());
            if rule.is_empty() || candidates.is_empty() {
                warn!("dropping invalid path rule '{rule}'");
                false
            } else {
                true
            }
        });
    }
    options
}

/// Member-wise merge for JSON objects; any other pairing replaces.
fn deep_merge(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(base), Value::Object(update)) => {
            for (key, value) in update {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(entries: &[(&str, &[&str])]) -> FxHashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(rule, candidates)| {
                (
                    rule.to_string(),
                    candidates.iter().map(|c| c.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_merge_replaces_per_path_rule() {
        let mut config = Configuration::default();
        config.merge(
            ConfigurationOptions {
                paths: Some(paths(&[("a", &["lib/a"]), ("b", &["lib/b"])])),
                ..Default::default()
            },
            false,
        );
        config.merge(
            ConfigurationOptions {
                paths: Some(paths(&[("a", &["mirror/a", "lib/a"])])),
                ..Default::default()
            },
            false,
        );
        assert_eq!(config.paths["a"], vec!["mirror/a", "lib/a"]);
        assert_eq!(config.paths["b"], vec!["lib/b"]);
    }

    #[test]
    fn test_merge_deep_merges_module_config() {
        let mut config = Configuration::default();
        let mut first = FxHashMap::default();
        first.insert("m".to_string(), json!({"a": 1, "nested": {"x": 1}}));
        config.merge(
            ConfigurationOptions {
                module_config: Some(first),
                ..Default::default()
            },
            false,
        );
        let mut second = FxHashMap::default();
        second.insert("m".to_string(), json!({"b": 2, "nested": {"y": 2}}));
        config.merge(
            ConfigurationOptions {
                module_config: Some(second),
                ..Default::default()
            },
            false,
        );
        assert_eq!(
            config.config_for_module("m"),
            json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 2}})
        );
        assert_eq!(config.config_for_module("other"), Value::Null);
    }

    #[test]
    fn test_merge_unions_duplicate_suppression() {
        let mut config = Configuration::default();
        config.merge(
            ConfigurationOptions {
                ignore_duplicate_modules: Some(vec!["a".to_string()]),
                ..Default::default()
            },
            false,
        );
        config.merge(
            ConfigurationOptions {
                ignore_duplicate_modules: Some(vec!["b".to_string(), "a".to_string()]),
                ..Default::default()
            },
            false,
        );
        assert!(config.is_duplicate_ignored_for("a"));
        assert!(config.is_duplicate_ignored_for("b"));
        assert!(!config.is_duplicate_ignored_for("c"));
    }

    #[test]
    fn test_overwrite_resets_absent_fields() {
        let mut config = Configuration::default();
        config.merge(
            ConfigurationOptions {
                base_location: Some("dist".to_string()),
                is_build: Some(true),
                ..Default::default()
            },
            false,
        );
        config.merge(
            ConfigurationOptions {
                base_location: Some("out".to_string()),
                ..Default::default()
            },
            true,
        );
        assert_eq!(config.base_location, "out");
        assert!(!config.is_build);
    }

    #[test]
    fn test_validation_defaults_invalid_rules() {
        let mut config = Configuration::default();
        let mut rules = paths(&[("ok", &["lib/ok"]), ("", &["x"])]);
        rules.insert("empties".to_string(), vec![String::new()]);
        config.merge(
            ConfigurationOptions {
                paths: Some(rules),
                ..Default::default()
            },
            false,
        );
        assert!(config.paths.contains_key("ok"));
        assert!(!config.paths.contains_key(""));
        assert!(!config.paths.contains_key("empties"));
    }

    #[test]
    fn test_factory_invocation_policy() {
        let mut config = Configuration::default();
        assert!(config.should_invoke_factory("app/main"));
        config.is_build = true;
        assert!(!config.should_invoke_factory("app/main"));
        assert!(config.should_invoke_factory("==anonymous1=="));
    }
}
