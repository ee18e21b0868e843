//! Reference loader plugins for the Gantry module system
//!
//! Plugins mediate non-code resource dependencies: a `"<plugin>!<param>"`
//! dependency slot is filled with whatever value the plugin produces for
//! `param`. The plugins here read files addressed through the requester's
//! scoped require, so relative parameters resolve against the requesting
//! module.

pub mod json;
pub mod text;

pub use json::JsonFilePlugin;
pub use text::TextFilePlugin;
