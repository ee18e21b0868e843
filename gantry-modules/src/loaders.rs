//! Resource loader contract and in-memory loaders
//!
//! The engine never fetches anything itself; a [`ResourceLoader`]
//! collaborator obtains a resource, evaluates it (typically performing
//! definition calls against the manager), and signals the outcome. The two
//! loaders here keep everything in memory: one evaluates scripted
//! definitions synchronously, the other parks requests until a test releases
//! them, which is how asynchronous arrival is exercised.

use crate::coordinator::LoadOutcome;
use crate::manager::ModuleManager;
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Asynchronously obtains and evaluates one resource.
pub trait ResourceLoader {
    /// Load `location`, consuming `outcome` exactly once when done.
    fn load(&self, manager: &ModuleManager, location: &str, outcome: LoadOutcome);
}

/// One definition call a scripted resource performs when evaluated.
pub type ScriptedDefinition = Box<dyn Fn(&ModuleManager)>;

/// In-memory loader mapping locations to scripts of definition calls,
/// evaluated synchronously on load. Unknown locations fail.
#[derive(Default)]
pub struct StaticResourceLoader {
    scripts: RefCell<FxHashMap<String, Rc<Vec<ScriptedDefinition>>>>,
    loaded: RefCell<Vec<String>>,
}

impl StaticResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the definitions evaluated when `location` loads.
    pub fn add_script(&self, location: &str, definitions: Vec<ScriptedDefinition>) {
        self.scripts
            .borrow_mut()
            .insert(location.to_string(), Rc::new(definitions));
    }

    /// Locations requested so far, in request order.
    pub fn load_log(&self) -> Vec<String> {
        self.loaded.borrow().clone()
    }
}

impl ResourceLoader for StaticResourceLoader {
    fn load(&self, manager: &ModuleManager, location: &str, outcome: LoadOutcome) {
        self.loaded.borrow_mut().push(location.to_string());
        let script = self.scripts.borrow().get(location).cloned();
        match script {
            Some(definitions) => {
                for definition in definitions.iter() {
                    definition(manager);
                }
                outcome.succeed();
            }
            None => outcome.fail(anyhow!("no resource registered at '{location}'")),
        }
    }
}

/// Loader that parks every request until it is released by hand.
#[derive(Default)]
pub struct DeferredResourceLoader {
    parked: RefCell<Vec<(String, LoadOutcome)>>,
}

impl DeferredResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locations currently parked, in request order.
    pub fn parked_locations(&self) -> Vec<String> {
        self.parked
            .borrow()
            .iter()
            .map(|(location, _)| location.clone())
            .collect()
    }

    /// Take all parked requests, leaving none behind.
    pub fn take_parked(&self) -> Vec<(String, LoadOutcome)> {
        self.parked.borrow_mut().drain(..).collect()
    }

    /// Release the oldest parked request for `location` with the given
    /// outcome. Returns false when nothing was parked there.
    pub fn release(&self, location: &str, result: Result<(), anyhow::Error>) -> bool {
        let entry = {
            let mut parked = self.parked.borrow_mut();
            match parked.iter().position(|(parked_location, _)| parked_location == location) {
                Some(index) => Some(parked.remove(index)),
                None => None,
            }
        };
        match entry {
            Some((_, outcome)) => {
                match result {
                    Ok(()) => outcome.succeed(),
                    Err(error) => outcome.fail(error),
                }
                true
            }
            None => false,
        }
    }
}

impl ResourceLoader for DeferredResourceLoader {
    fn load(&self, _manager: &ModuleManager, location: &str, outcome: LoadOutcome) {
        self.parked
            .borrow_mut()
            .push((location.to_string(), outcome));
    }
}
