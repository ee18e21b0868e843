//! Runtime environment capabilities

/// The kind of runtime hosting the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// A native process with direct filesystem access.
    Native,
    /// A browser main thread.
    Browser,
    /// A browser worker.
    Worker,
}

/// Capability query answered by the embedder. The engine forwards the answer
/// to loader plugins, which may produce different values per platform.
pub trait Environment {
    /// The platform the loader is running on.
    fn platform(&self) -> Platform;
}

/// Environment derived from compile-time target information.
#[derive(Debug, Default)]
pub struct DetectedEnvironment;

impl Environment for DetectedEnvironment {
    fn platform(&self) -> Platform {
        if cfg!(target_arch = "wasm32") {
            Platform::Browser
        } else {
            Platform::Native
        }
    }
}

/// Fixed platform answer, for embedders that know better.
#[derive(Debug)]
pub struct StaticEnvironment(pub Platform);

impl Environment for StaticEnvironment {
    fn platform(&self) -> Platform {
        self.0
    }
}
