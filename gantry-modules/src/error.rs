//! Loader error types

use thiserror::Error;

/// Type alias for loader results
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors produced by the module loader, grouped by the phase that failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoaderError {
    /// Every candidate location for a module's resource failed to load
    #[error("failed to load module '{module}' (needed by: {needed_by:?}): {reason}")]
    LoadFailed {
        /// Id of the module whose resource could not be obtained
        module: String,
        /// Modules that were directly waiting on it when the load failed
        needed_by: Vec<String>,
        /// Description of the last underlying failure
        reason: String,
    },

    /// A module's factory reported an error while producing its exports
    #[error("factory of module '{module}' failed (needed by: {needed_by:?}): {reason}")]
    FactoryFailed {
        /// Id of the module whose factory failed
        module: String,
        /// Modules that were directly waiting on it at the moment of failure
        needed_by: Vec<String>,
        /// Description of the factory error
        reason: String,
    },

    /// A module declared the same normalized dependency target twice
    #[error("module '{module}' declares dependency '{dependency}' more than once")]
    DuplicateDependency {
        /// Id of the offending module
        module: String,
        /// The duplicated dependency target
        dependency: String,
    },

    /// A second anonymous definition arrived before the pending one was adopted
    #[error("an anonymous module definition is already pending adoption")]
    DuplicateAnonymousDefinition,

    /// Synchronous require of an id that was never defined or requested
    #[error("synchronous require cannot resolve '{module}': this is the first mention of the module")]
    UnknownModule {
        /// The requested module id
        module: String,
    },

    /// Synchronous require of a module that is still resolving
    #[error("synchronous require cannot resolve '{module}': the module has not completed yet")]
    NotYetComplete {
        /// The requested module id
        module: String,
    },
}

impl LoaderError {
    /// The module ids that were directly waiting on the failure, if any were
    /// recorded on the error.
    pub fn needed_by(&self) -> &[String] {
        match self {
            LoaderError::LoadFailed { needed_by, .. }
            | LoaderError::FactoryFailed { needed_by, .. } => needed_by,
            _ => &[],
        }
    }

    /// The id of the module the error is about.
    pub fn module(&self) -> Option<&str> {
        match self {
            LoaderError::LoadFailed { module, .. }
            | LoaderError::FactoryFailed { module, .. }
            | LoaderError::DuplicateDependency { module, .. }
            | LoaderError::UnknownModule { module }
            | LoaderError::NotYetComplete { module } => Some(module.as_str()),
            LoaderError::DuplicateAnonymousDefinition => None,
        }
    }
}
