//! JSON file plugin

use anyhow::Context;
use gantry_modules::{LoaderPlugin, PluginCompletion, PluginLoadOptions, ScopedRequire};
use serde_json::Value;
use std::fs;
use tracing::trace;

/// `json!<path>`: completes with the parsed contents of the addressed file.
#[derive(Debug, Default)]
pub struct JsonFilePlugin;

impl LoaderPlugin for JsonFilePlugin {
    fn load(
        &self,
        param: &str,
        require: ScopedRequire,
        completion: PluginCompletion,
        _options: &PluginLoadOptions,
    ) {
        let url = require.to_url(param);
        trace!(%url, "loading json resource");
        let parsed = fs::read_to_string(&url)
            .with_context(|| format!("reading json resource '{url}'"))
            .and_then(|contents| {
                serde_json::from_str::<Value>(&contents)
                    .with_context(|| format!("parsing json resource '{url}'"))
            });
        match parsed {
            Ok(value) => completion.complete(value),
            Err(error) => completion.fail(error),
        }
    }
}
