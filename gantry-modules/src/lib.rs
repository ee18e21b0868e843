//! Gantry Module System
//!
//! This crate provides a dependency-driven module loader, including:
//! - Module definition, resolution and memoized completion
//! - Inverse-dependency propagation with cycle detection and breaking
//! - Plugin-mediated dependencies (`"<plugin>!<param>"` slots)
//! - Deduplicated resource loading with ordered candidate fallback
//!
//! The engine performs no I/O of its own: a [`ResourceLoader`] obtains and
//! evaluates resources, a [`ModuleLocator`] maps ids to candidate locations,
//! and [`LoaderPlugin`]s transform resources into values. Everything runs on
//! a single logical thread of control; definitions resolve synchronously in
//! the defining call, and suspension happens only at the loader boundary.

pub mod config;
pub mod coordinator;
pub mod dependency;
pub mod environment;
pub mod error;
pub mod events;
pub mod identity;
pub mod loaders;
pub mod locator;
pub mod manager;
pub mod module;
pub mod plugin;
pub mod resolver;

pub use config::{Configuration, ConfigurationOptions, ErrorSink, ANONYMOUS_PREFIX};
pub use coordinator::{LoadFailure, LoadOutcome, LoadSuccess, ResourceLoadCoordinator};
pub use dependency::DependencySpec;
pub use environment::{DetectedEnvironment, Environment, Platform, StaticEnvironment};
pub use error::{LoaderError, Result};
pub use events::{EventRecorder, InMemoryEventRecorder, LoaderEventKind, NullEventRecorder};
pub use identity::{ModuleId, ModuleIdentity};
pub use loaders::{DeferredResourceLoader, ResourceLoader, ScriptedDefinition, StaticResourceLoader};
pub use locator::{ConfiguredLocator, ModuleLocator, EMPTY_LOCATION};
pub use manager::{BuildModuleInfo, ModuleContext, ModuleManager, ScopedRequire};
pub use module::{
    DependencyValue, ErrorHandlerFn, Exports, FactoryFn, ModuleFactory, ModuleRecord,
};
pub use plugin::{LoaderPlugin, PluginCompletion, PluginLoadOptions};
