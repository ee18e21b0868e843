//! Loader plugin contract
//!
//! A plugin is a module whose exports mediate non-code resource
//! dependencies: a `"<plugin>!<param>"` dependency hands `param` to the
//! plugin, which produces the value that fills the dependency slot.

use crate::environment::Platform;
use crate::identity::ModuleId;
use crate::manager::{ModuleManager, ScopedRequire};
use serde_json::Value;

/// Options handed to a plugin's `load`.
#[derive(Debug, Clone)]
pub struct PluginLoadOptions {
    /// True while a build pass is harvesting the graph.
    pub is_build: bool,
    /// Platform the loader runs on.
    pub platform: Platform,
}

/// Consume-once channel a plugin uses to deliver the value it produced.
///
/// Completing defines the mediated result as a zero-dependency module;
/// failing propagates a loading error to everything waiting on the result.
pub struct PluginCompletion {
    manager: ModuleManager,
    result_id: ModuleId,
}

impl PluginCompletion {
    pub(crate) fn new(manager: ModuleManager, result_id: ModuleId) -> Self {
        Self { manager, result_id }
    }

    /// Deliver the produced value.
    pub fn complete(self, value: Value) {
        self.manager.define_plugin_result(self.result_id, Ok(value));
    }

    /// Report that the mediated resource could not be produced.
    pub fn fail(self, error: anyhow::Error) {
        self.manager.define_plugin_result(self.result_id, Err(error));
    }
}

/// Contract for modules that mediate non-code resource dependencies.
pub trait LoaderPlugin {
    /// Produce the value for `param`, reporting it through `completion`.
    ///
    /// `require` is scoped to the module that declared the dependency, so
    /// relative parameters resolve against the requester.
    fn load(
        &self,
        param: &str,
        require: ScopedRequire,
        completion: PluginCompletion,
        options: &PluginLoadOptions,
    );
}
