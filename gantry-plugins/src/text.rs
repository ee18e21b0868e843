//! Text file plugin

use anyhow::Context;
use gantry_modules::{LoaderPlugin, PluginCompletion, PluginLoadOptions, ScopedRequire};
use serde_json::Value;
use std::fs;
use tracing::trace;

/// `text!<path>`: completes with the addressed file's contents as a string
/// value.
#[derive(Debug, Default)]
pub struct TextFilePlugin;

impl LoaderPlugin for TextFilePlugin {
    fn load(
        &self,
        param: &str,
        require: ScopedRequire,
        completion: PluginCompletion,
        _options: &PluginLoadOptions,
    ) {
        let url = require.to_url(param);
        trace!(%url, "loading text resource");
        match fs::read_to_string(&url).with_context(|| format!("reading text resource '{url}'")) {
            Ok(contents) => completion.complete(Value::String(contents)),
            Err(error) => completion.fail(error),
        }
    }
}
