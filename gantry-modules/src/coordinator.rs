//! Deduplicated resource loading
//!
//! Ensures the underlying resource loader runs at most once per in-flight
//! location, fanning the single outcome out to every caller that asked for
//! that location in the meantime.

use crate::loaders::ResourceLoader;
use crate::manager::ModuleManager;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Callback invoked when a requested location finished loading.
pub type LoadSuccess = Box<dyn FnOnce()>;

/// Callback invoked when a requested location failed to load.
pub type LoadFailure = Box<dyn FnOnce(Rc<anyhow::Error>)>;

/// Cheap-to-clone handle over the coordinator state.
#[derive(Clone)]
pub struct ResourceLoadCoordinator {
    inner: Rc<CoordinatorInner>,
}

struct CoordinatorInner {
    loader: Rc<dyn ResourceLoader>,
    /// Waiters per still-pending location; the entry is removed when the
    /// outcome arrives, so the fan-out is one-shot.
    pending: RefCell<FxHashMap<String, Vec<(LoadSuccess, LoadFailure)>>>,
}

impl ResourceLoadCoordinator {
    /// Coordinator delegating actual loads to `loader`.
    pub fn new(loader: Rc<dyn ResourceLoader>) -> Self {
        Self {
            inner: Rc::new(CoordinatorInner {
                loader,
                pending: RefCell::new(FxHashMap::default()),
            }),
        }
    }

    /// Request `location`.
    ///
    /// The first request for a still-pending location triggers the real
    /// load; later requests only enqueue. Every enqueued caller observes the
    /// one outcome.
    pub fn load(
        &self,
        manager: &ModuleManager,
        location: &str,
        on_success: LoadSuccess,
        on_failure: LoadFailure,
    ) {
        {
            let mut pending = self.inner.pending.borrow_mut();
            if let Some(waiters) = pending.get_mut(location) {
                trace!(location, "joining in-flight load");
                waiters.push((on_success, on_failure));
                return;
            }
            pending.insert(location.to_string(), vec![(on_success, on_failure)]);
        }
        let outcome = LoadOutcome {
            coordinator: self.clone(),
            location: location.to_string(),
        };
        self.inner.loader.load(manager, location, outcome);
    }

    fn finish(&self, location: &str, result: Result<(), Rc<anyhow::Error>>) {
        let Some(waiters) = self.inner.pending.borrow_mut().remove(location) else {
            return;
        };
        trace!(location, waiters = waiters.len(), ok = result.is_ok(), "load finished");
        for (on_success, on_failure) in waiters {
            match &result {
                Ok(()) => on_success(),
                Err(error) => on_failure(Rc::clone(error)),
            }
        }
    }
}

/// Consume-once completion handle handed to a [`ResourceLoader`].
pub struct LoadOutcome {
    coordinator: ResourceLoadCoordinator,
    location: String,
}

impl LoadOutcome {
    /// The resource was obtained and evaluated.
    pub fn succeed(self) {
        self.coordinator.finish(&self.location, Ok(()));
    }

    /// The resource could not be obtained.
    pub fn fail(self, error: anyhow::Error) {
        self.coordinator.finish(&self.location, Err(Rc::new(error)));
    }
}
