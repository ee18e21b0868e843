//! Module records and factory invocation

use crate::dependency::DependencySpec;
use crate::error::LoaderError;
use crate::identity::ModuleId;
use crate::manager::{ModuleContext, ScopedRequire};
use crate::plugin::LoaderPlugin;
use crate::resolver::ModuleIdResolver;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A module's export value.
///
/// Cheap to clone; once the owning module completes, the value is shared
/// with every dependent and is read-only by convention. Nothing enforces
/// that at the type level, mirroring the documented contract of the system.
#[derive(Clone)]
pub enum Exports {
    /// Plain data exports.
    Data(Rc<RefCell<Value>>),
    /// Exports implementing the loader-plugin contract.
    Plugin(Rc<dyn LoaderPlugin>),
}

impl Exports {
    /// Data exports holding `value`.
    pub fn value(value: Value) -> Self {
        Exports::Data(Rc::new(RefCell::new(value)))
    }

    /// The initial exports of every module: an empty JSON object.
    pub fn empty_object() -> Self {
        Self::value(Value::Object(Map::new()))
    }

    /// Exports implementing the loader-plugin contract.
    pub fn plugin(plugin: Rc<dyn LoaderPlugin>) -> Self {
        Exports::Plugin(plugin)
    }

    /// Snapshot of the data value; `Null` for plugin exports.
    pub fn to_value(&self) -> Value {
        match self {
            Exports::Data(cell) => cell.borrow().clone(),
            Exports::Plugin(_) => Value::Null,
        }
    }

    /// The plugin capability, when these exports carry one.
    pub fn as_plugin(&self) -> Option<Rc<dyn LoaderPlugin>> {
        match self {
            Exports::Plugin(plugin) => Some(Rc::clone(plugin)),
            Exports::Data(_) => None,
        }
    }

    /// True while no factory has observably written to the exports object.
    pub(crate) fn is_observably_empty(&self) -> bool {
        match self {
            Exports::Data(cell) => matches!(&*cell.borrow(), Value::Object(map) if map.is_empty()),
            Exports::Plugin(_) => false,
        }
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exports::Data(cell) => f.debug_tuple("Data").field(&cell.borrow()).finish(),
            Exports::Plugin(_) => f.write_str("Plugin(..)"),
        }
    }
}

/// The value a resolved dependency slot contributes to a factory call, in
/// declaration order.
#[derive(Clone)]
pub enum DependencyValue {
    /// The module's own mutable exports object.
    Exports(Rc<RefCell<Value>>),
    /// Descriptor of the declaring module.
    Module(ModuleContext),
    /// Require function scoped to the declaring module.
    Require(ScopedRequire),
    /// A completed dependency's exports.
    Resolved(Exports),
    /// Placeholder for an edge that was broken to terminate a cycle, or for
    /// a slot that never resolved.
    Unresolved,
}

impl DependencyValue {
    /// Data snapshot of the slot; `Null` where no data applies.
    pub fn to_value(&self) -> Value {
        match self {
            DependencyValue::Exports(cell) => cell.borrow().clone(),
            DependencyValue::Resolved(exports) => exports.to_value(),
            DependencyValue::Module(context) => {
                Value::String(context.id().to_string())
            }
            DependencyValue::Require(_) | DependencyValue::Unresolved => Value::Null,
        }
    }

    /// The mutable exports object, for `exports` slots.
    pub fn exports_object(&self) -> Option<&Rc<RefCell<Value>>> {
        match self {
            DependencyValue::Exports(cell) => Some(cell),
            _ => None,
        }
    }

    /// The scoped require, for `require` slots.
    pub fn require(&self) -> Option<&ScopedRequire> {
        match self {
            DependencyValue::Require(require) => Some(require),
            _ => None,
        }
    }

    /// The module descriptor, for `module` slots.
    pub fn module_context(&self) -> Option<&ModuleContext> {
        match self {
            DependencyValue::Module(context) => Some(context),
            _ => None,
        }
    }

    /// The resolved dependency exports, for regular and plugin slots.
    pub fn resolved(&self) -> Option<&Exports> {
        match self {
            DependencyValue::Resolved(exports) => Some(exports),
            _ => None,
        }
    }
}

/// Callback producing a module's exports from its dependency values.
pub type FactoryFn = Box<dyn FnOnce(&[DependencyValue]) -> anyhow::Result<Option<Exports>>>;

/// Callback invoked when one of the module's dependencies fails.
pub type ErrorHandlerFn = Box<dyn FnOnce(&LoaderError)>;

/// How a module produces its exports.
pub enum ModuleFactory {
    /// Literal value used verbatim as the exports.
    Value(Value),
    /// Callback invoked once every dependency is available.
    Function(FactoryFn),
}

impl ModuleFactory {
    /// Factory from a closure.
    pub fn from_fn(
        factory: impl FnOnce(&[DependencyValue]) -> anyhow::Result<Option<Exports>> + 'static,
    ) -> Self {
        ModuleFactory::Function(Box::new(factory))
    }

    /// Factory that uses `value` verbatim as the exports.
    pub fn literal(value: Value) -> Self {
        ModuleFactory::Value(value)
    }

    pub(crate) fn is_function(&self) -> bool {
        matches!(self, ModuleFactory::Function(_))
    }
}

/// Result of running a module factory.
pub(crate) enum FactoryOutcome {
    /// Literal exports, applied unconditionally.
    Literal(Exports),
    /// The factory ran; `None` means it returned nothing.
    Produced(Option<Exports>),
    /// The factory reported an error.
    Failed(String),
}

/// Run a factory outside any engine borrow.
///
/// With `catch_errors` disabled a factory error panics, the closest
/// rendition of letting the exception escape for debugging.
pub(crate) fn run_factory(
    factory: ModuleFactory,
    values: &[DependencyValue],
    catch_errors: bool,
) -> FactoryOutcome {
    match factory {
        ModuleFactory::Value(value) => FactoryOutcome::Literal(Exports::value(value)),
        ModuleFactory::Function(callback) => match callback(values) {
            Ok(returned) => FactoryOutcome::Produced(returned),
            Err(error) if catch_errors => FactoryOutcome::Failed(format!("{error:#}")),
            Err(error) => panic!("module factory failed with catch_errors disabled: {error:#}"),
        },
    }
}

/// One module's lifecycle state.
///
/// Created when a definition is processed, completed exactly once, and kept
/// around afterwards so later synchronous lookups can be served from memory.
pub struct ModuleRecord {
    pub(crate) id: ModuleId,
    pub(crate) str_id: String,
    /// Dependency list; released once the module reaches a terminal state.
    pub(crate) dependencies: Option<Vec<DependencySpec>>,
    pub(crate) factory: Option<ModuleFactory>,
    pub(crate) error_handler: Option<ErrorHandlerFn>,
    pub(crate) exports: Exports,
    pub(crate) error: Option<LoaderError>,
    pub(crate) unresolved_count: usize,
    /// True when the module declared the `exports` pseudo dependency, which
    /// changes what the final exports value is allowed to be.
    pub(crate) exports_passed_in: bool,
    pub(crate) complete: bool,
    /// Guards the at-most-once error notification.
    pub(crate) error_notified: bool,
    pub(crate) resolver: Rc<ModuleIdResolver>,
}

impl ModuleRecord {
    pub(crate) fn new(
        id: ModuleId,
        str_id: String,
        dependencies: Vec<DependencySpec>,
        factory: ModuleFactory,
        error_handler: Option<ErrorHandlerFn>,
        resolver: Rc<ModuleIdResolver>,
    ) -> Self {
        let unresolved_count = dependencies.len();
        Self {
            id,
            str_id,
            dependencies: Some(dependencies),
            factory: Some(factory),
            error_handler,
            exports: Exports::empty_object(),
            error: None,
            unresolved_count,
            exports_passed_in: false,
            complete: false,
            error_notified: false,
            resolver,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    /// Apply a factory outcome, returning the produced error if there was
    /// one.
    ///
    /// A returned value replaces the exports only if the module did not take
    /// the `exports` object, or took it but never observably wrote to it; a
    /// mutated exports object always wins over a returned value.
    pub(crate) fn apply_factory_outcome(
        &mut self,
        outcome: FactoryOutcome,
        needed_by: Vec<String>,
    ) -> Option<LoaderError> {
        match outcome {
            FactoryOutcome::Literal(exports) => {
                self.exports = exports;
                None
            }
            FactoryOutcome::Produced(Some(returned))
                if !self.exports_passed_in || self.exports.is_observably_empty() =>
            {
                self.exports = returned;
                None
            }
            FactoryOutcome::Produced(_) => None,
            FactoryOutcome::Failed(reason) => {
                let error = LoaderError::FactoryFailed {
                    module: self.str_id.clone(),
                    needed_by,
                    reason,
                };
                self.error = Some(error.clone());
                Some(error)
            }
        }
    }

    /// Notify the record that a dependency (or its own factory) failed.
    ///
    /// At most one notification takes effect. The record becomes terminally
    /// errored, which also forecloses a pending completion. Returns the
    /// local error handler so the caller can invoke it outside any borrow;
    /// `None` means the record had none or was already notified.
    pub(crate) fn notify_error(&mut self, error: &LoaderError) -> Option<ErrorHandlerFn> {
        if self.error_notified || (self.complete && self.error.is_none()) {
            return None;
        }
        self.error_notified = true;
        self.complete = true;
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        let handler = self.error_handler.take();
        self.release();
        handler
    }

    /// Drop the dependency list and callbacks so resolved values and
    /// closures are not retained past the terminal state.
    pub(crate) fn release(&mut self) {
        self.dependencies = None;
        self.factory = None;
        self.error_handler = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(str_id: &str) -> ModuleRecord {
        ModuleRecord::new(
            ModuleId::EXPORTS,
            str_id.to_string(),
            Vec::new(),
            ModuleFactory::from_fn(|_| Ok(None)),
            None,
            Rc::new(ModuleIdResolver::new(str_id)),
        )
    }

    #[test]
    fn test_returned_value_replaces_untouched_exports() {
        let mut m = record("m");
        m.exports_passed_in = true;
        let outcome = FactoryOutcome::Produced(Some(Exports::value(json!(7))));
        assert!(m.apply_factory_outcome(outcome, Vec::new()).is_none());
        assert_eq!(m.exports.to_value(), json!(7));
    }

    #[test]
    fn test_mutated_exports_win_over_returned_value() {
        let mut m = record("m");
        m.exports_passed_in = true;
        if let Exports::Data(cell) = &m.exports {
            cell.borrow_mut()
                .as_object_mut()
                .unwrap()
                .insert("a".to_string(), json!(1));
        }
        let outcome = FactoryOutcome::Produced(Some(Exports::value(json!(7))));
        m.apply_factory_outcome(outcome, Vec::new());
        assert_eq!(m.exports.to_value(), json!({"a": 1}));
    }

    #[test]
    fn test_returned_value_wins_without_exports_slot() {
        let mut m = record("m");
        let outcome = FactoryOutcome::Produced(Some(Exports::value(json!([1, 2]))));
        m.apply_factory_outcome(outcome, Vec::new());
        assert_eq!(m.exports.to_value(), json!([1, 2]));
    }

    #[test]
    fn test_factory_failure_is_recorded() {
        let mut m = record("m");
        let produced = m.apply_factory_outcome(
            FactoryOutcome::Failed("boom".to_string()),
            vec!["dep".to_string()],
        );
        let error = produced.expect("factory error");
        assert_eq!(error.module(), Some("m"));
        assert_eq!(error.needed_by(), ["dep".to_string()].as_slice());
        assert_eq!(m.error, Some(error));
    }

    #[test]
    fn test_error_notification_is_one_shot() {
        let mut m = record("m");
        let mut handled = false;
        m.error_handler = Some(Box::new(|_| {}));
        let error = LoaderError::LoadFailed {
            module: "dep".to_string(),
            needed_by: vec!["m".to_string()],
            reason: "gone".to_string(),
        };
        if let Some(handler) = m.notify_error(&error) {
            handler(&error);
            handled = true;
        }
        assert!(handled);
        assert!(m.is_complete());
        assert!(m.notify_error(&error).is_none());
        assert_eq!(m.error, Some(error));
    }

    #[test]
    fn test_completed_module_ignores_later_errors() {
        let mut m = record("m");
        m.complete = true;
        let error = LoaderError::LoadFailed {
            module: "dep".to_string(),
            needed_by: Vec::new(),
            reason: "gone".to_string(),
        };
        assert!(m.notify_error(&error).is_none());
        assert!(m.error.is_none());
    }
}
