//! The dependency-graph engine
//!
//! Owns every module record, the forward dependency lists, the
//! inverse-dependency index and the inverse-plugin-dependency index, and
//! drives resolution to completion. Single-threaded and callback-driven:
//! definition synchronously attempts resolution in the same call, suspension
//! happens only at the resource-loader boundary, and completion fan-out
//! preserves the registration order of waiters.

use crate::config::{Configuration, ConfigurationOptions, ANONYMOUS_PREFIX};
use crate::coordinator::{LoadFailure, LoadSuccess, ResourceLoadCoordinator};
use crate::dependency::DependencySpec;
use crate::environment::Environment;
use crate::error::{LoaderError, Result};
use crate::events::{EventRecorder, LoaderEventKind};
use crate::identity::{ModuleId, ModuleIdentity};
use crate::loaders::ResourceLoader;
use crate::locator::{ConfiguredLocator, ModuleLocator, EMPTY_LOCATION};
use crate::module::{
    run_factory, DependencyValue, ErrorHandlerFn, Exports, ModuleFactory, ModuleRecord,
};
use crate::plugin::{LoaderPlugin, PluginCompletion, PluginLoadOptions};
use crate::resolver::ModuleIdResolver;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Depth ceiling when reconstructing a cycle path for diagnostics. Purely a
/// safety bound for the printed path, not part of cycle breaking.
const CYCLE_PATH_DEPTH_LIMIT: u32 = 50;

/// A pending plugin-mediated dependency, parked until the plugin module
/// completes.
struct PluginDependency {
    result_id: ModuleId,
    plugin_id: ModuleId,
    plugin_param: String,
    resolver: Rc<ModuleIdResolver>,
}

/// An anonymous definition waiting to be adopted by the resource load that
/// produced it.
struct PendingDefinition {
    dependencies: Vec<String>,
    factory: ModuleFactory,
}

struct GraphState {
    identity: ModuleIdentity,
    modules: FxHashMap<ModuleId, ModuleRecord>,
    /// Ids a load has been issued for (or that were defined directly);
    /// distinct from "defined" so the same target is never requested twice.
    known: FxHashSet<ModuleId>,
    /// Modules waiting on a target, in registration order. Consumed once
    /// the target completes.
    inverse_dependencies: FxHashMap<ModuleId, Vec<ModuleId>>,
    /// Plugin-mediated slots waiting on a plugin module. Consumed once the
    /// plugin completes.
    inverse_plugin_dependencies: FxHashMap<ModuleId, Vec<PluginDependency>>,
    pending_anonymous: Option<PendingDefinition>,
    build_locations: FxHashMap<ModuleId, String>,
    build_dependencies: FxHashMap<ModuleId, Vec<String>>,
    anonymous_counter: u32,
}

impl GraphState {
    fn new() -> Self {
        Self {
            identity: ModuleIdentity::new(),
            modules: FxHashMap::default(),
            known: FxHashSet::default(),
            inverse_dependencies: FxHashMap::default(),
            inverse_plugin_dependencies: FxHashMap::default(),
            pending_anonymous: None,
            build_locations: FxHashMap::default(),
            build_dependencies: FxHashMap::default(),
            anonymous_counter: 0,
        }
    }

    /// Normalize one raw dependency string against the declaring module.
    fn normalize_dependency(&mut self, raw: &str, resolver: &ModuleIdResolver) -> DependencySpec {
        match raw {
            "exports" => DependencySpec::Exports,
            "module" => DependencySpec::Module,
            "require" => DependencySpec::Require,
            _ => {
                if let Some(bang) = raw.find('!') {
                    let plugin_str = resolver.resolve(&raw[..bang]);
                    let plugin_param = raw[bang + 1..].to_string();
                    let result_str = format!("{plugin_str}!{plugin_param}");
                    let id = self.identity.intern(&result_str);
                    let plugin_id = self.identity.intern(&plugin_str);
                    DependencySpec::Plugin {
                        id,
                        plugin_id,
                        plugin_param,
                    }
                } else {
                    DependencySpec::Regular {
                        id: self.identity.intern(&resolver.resolve(raw)),
                    }
                }
            }
        }
    }

    /// Breadth-first search over the forward dependency graph, looking for a
    /// path from `from` to `to`. Runs before a new inverse edge is
    /// registered, because the edge itself would otherwise never be
    /// discoverable as part of a still-forming cycle.
    fn has_dependency_path(&self, from: ModuleId, to: ModuleId) -> bool {
        if from == to {
            return true;
        }
        let mut enqueued = FxHashSet::default();
        let mut queue = VecDeque::new();
        enqueued.insert(from);
        queue.push_back(from);
        while let Some(id) = queue.pop_front() {
            let Some(record) = self.modules.get(&id) else {
                continue;
            };
            let Some(dependencies) = record.dependencies.as_ref() else {
                continue;
            };
            for spec in dependencies {
                if let Some(target) = spec.target() {
                    if target == to {
                        return true;
                    }
                    if enqueued.insert(target) {
                        queue.push_back(target);
                    }
                }
            }
        }
        false
    }

    /// Depth-first reconstruction of one forward path from `from` to `to`,
    /// bounded by [`CYCLE_PATH_DEPTH_LIMIT`].
    fn find_cycle_path(&self, from: ModuleId, to: ModuleId, depth: u32) -> Option<Vec<ModuleId>> {
        if from == to || depth == CYCLE_PATH_DEPTH_LIMIT {
            return Some(vec![from]);
        }
        let record = self.modules.get(&from)?;
        let dependencies = record.dependencies.as_ref()?;
        for spec in dependencies {
            if let Some(target) = spec.target() {
                if let Some(mut path) = self.find_cycle_path(target, to, depth + 1) {
                    path.push(from);
                    return Some(path);
                }
            }
        }
        None
    }

    fn render_cycle(&self, from: ModuleId, to: ModuleId) -> String {
        let mut path = self.find_cycle_path(from, to, 0).unwrap_or_default();
        path.reverse();
        path.push(from);
        path.iter()
            .map(|id| self.identity.str_of(*id))
            .collect::<Vec<_>>()
            .join(" => ")
    }

    /// String ids of the modules directly waiting on `module_id` right now.
    fn direct_dependents_str(&self, module_id: ModuleId) -> Vec<String> {
        self.inverse_dependencies
            .get(&module_id)
            .map(|waiters| {
                waiters
                    .iter()
                    .map(|id| self.identity.str_of(*id).to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One module's build-time record, emitted for bundlers.
#[derive(Debug, Clone, Serialize)]
pub struct BuildModuleInfo {
    /// Module id.
    pub id: String,
    /// The location the module's resource was actually obtained from.
    pub resolved_location: Option<String>,
    /// Normalized dependency ids, in declaration order.
    pub dependencies: Vec<String>,
    /// Snapshot of the exports value.
    pub exports: Value,
}

/// Descriptor a module receives for its `module` pseudo dependency.
#[derive(Clone)]
pub struct ModuleContext {
    id: String,
    config: Rc<RefCell<Configuration>>,
}

impl ModuleContext {
    /// The declaring module's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Per-module configuration at the time of the call.
    pub fn config(&self) -> Value {
        self.config.borrow().config_for_module(&self.id)
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext").field("id", &self.id).finish()
    }
}

/// Require function scoped to one module's location.
///
/// For already-complete modules this is a pure, side-effect-free lookup, so
/// re-entrant calls from inside factories and plugins are safe.
#[derive(Clone)]
pub struct ScopedRequire {
    manager: ModuleManager,
    resolver: Rc<ModuleIdResolver>,
}

impl ScopedRequire {
    /// Synchronously fetch the exports of an already-complete module,
    /// resolving relative ids against the owning module.
    pub fn require(&self, id: &str) -> Result<Exports> {
        self.manager.synchronous_require_scoped(id, &self.resolver)
    }

    /// Resolve an id to a directly usable resource URL, for asset
    /// references that are not module loads.
    pub fn to_url(&self, id: &str) -> String {
        self.manager.url_for(&self.resolver.resolve(id))
    }
}

struct ManagerInner {
    environment: Rc<dyn Environment>,
    loader: Rc<dyn ResourceLoader>,
    recorder: Rc<dyn EventRecorder>,
    locator: Rc<dyn ModuleLocator>,
    coordinator: ResourceLoadCoordinator,
    config: Rc<RefCell<Configuration>>,
    state: RefCell<GraphState>,
}

/// Cheap-to-clone handle over one loading session's engine.
///
/// There is no global instance: whoever drives module loading holds a
/// handle, and [`ModuleManager::reset`] is just "construct a sibling with
/// the same collaborators".
#[derive(Clone)]
pub struct ModuleManager {
    inner: Rc<ManagerInner>,
}

/// What the per-slot resolution step decided to do once the graph borrow is
/// released.
enum SlotAction {
    Continue,
    /// An already-errored dependency aborts the entire remaining resolution
    /// of the dependent.
    AbortErrored(LoaderError),
    Load(ModuleId),
    RunPlugin {
        plugin: Rc<dyn LoaderPlugin>,
        dependency: PluginDependency,
    },
    PluginContract {
        result_id: ModuleId,
        plugin_id: ModuleId,
    },
}

enum TargetCheck {
    Errored(LoaderError),
    /// Completed or cycle-broken; the slot counter was already decremented.
    Settled,
    Waiting,
}

/// Completion propagation work items. An explicit stack reproduces the
/// depth-first, registration-order traversal of recursive propagation
/// without unbounded call-stack growth.
enum CompletionTask {
    Complete(ModuleId),
    /// Plugin fan-out and bookkeeping cleanup, after the module's dependent
    /// subtree has been processed.
    Finalize(ModuleId),
}

struct PreparedCompletion {
    str_id: String,
    factory: Option<ModuleFactory>,
    values: Vec<DependencyValue>,
    catch_errors: bool,
}

impl ModuleManager {
    /// Engine with the default configuration-driven locator.
    pub fn new(
        environment: Rc<dyn Environment>,
        loader: Rc<dyn ResourceLoader>,
        recorder: Rc<dyn EventRecorder>,
    ) -> Self {
        let config = Rc::new(RefCell::new(Configuration::default()));
        let locator: Rc<dyn ModuleLocator> = Rc::new(ConfiguredLocator::new(Rc::clone(&config)));
        Self::assemble(environment, loader, locator, recorder, config)
    }

    /// Engine with a caller-provided locator.
    pub fn with_locator(
        environment: Rc<dyn Environment>,
        loader: Rc<dyn ResourceLoader>,
        locator: Rc<dyn ModuleLocator>,
        recorder: Rc<dyn EventRecorder>,
    ) -> Self {
        let config = Rc::new(RefCell::new(Configuration::default()));
        Self::assemble(environment, loader, locator, recorder, config)
    }

    fn assemble(
        environment: Rc<dyn Environment>,
        loader: Rc<dyn ResourceLoader>,
        locator: Rc<dyn ModuleLocator>,
        recorder: Rc<dyn EventRecorder>,
        config: Rc<RefCell<Configuration>>,
    ) -> Self {
        ModuleManager {
            inner: Rc::new(ManagerInner {
                environment,
                coordinator: ResourceLoadCoordinator::new(Rc::clone(&loader)),
                loader,
                recorder,
                locator,
                config,
                state: RefCell::new(GraphState::new()),
            }),
        }
    }

    /// Discard all graph state, keeping collaborators and configuration.
    pub fn reset(&self) -> ModuleManager {
        Self::assemble(
            Rc::clone(&self.inner.environment),
            Rc::clone(&self.inner.loader),
            Rc::clone(&self.inner.locator),
            Rc::clone(&self.inner.recorder),
            Rc::clone(&self.inner.config),
        )
    }

    /// Merge `options` into the configuration store.
    pub fn configure(&self, options: ConfigurationOptions, overwrite: bool) {
        self.inner.config.borrow_mut().merge(options, overwrite);
    }

    /// A directly usable URL for `module_id`, from the locator.
    pub fn url_for(&self, module_id: &str) -> String {
        self.inner.locator.url_for(module_id)
    }

    /// Define a module and synchronously attempt its resolution.
    ///
    /// The first definition for an id wins; a later one is discarded with a
    /// warning (suppressible per id through the configuration). Declaring
    /// the same normalized dependency target twice is a programmer error and
    /// fails immediately.
    pub fn define_module(
        &self,
        str_id: &str,
        dependencies: &[&str],
        factory: ModuleFactory,
        error_handler: Option<ErrorHandlerFn>,
    ) -> Result<()> {
        let resolver = Rc::new(ModuleIdResolver::new(str_id));
        let is_build = self.inner.config.borrow().is_build;
        let module_id = {
            let mut state = self.inner.state.borrow_mut();
            let module_id = state.identity.intern(str_id);
            if state.modules.contains_key(&module_id) {
                if !self.inner.config.borrow().is_duplicate_ignored_for(str_id) {
                    warn!("duplicate definition of module '{str_id}'; keeping the first");
                }
                return Ok(());
            }
            let mut specs = Vec::with_capacity(dependencies.len());
            for raw in dependencies {
                specs.push(state.normalize_dependency(raw, &resolver));
            }
            let mut seen = FxHashSet::default();
            for spec in &specs {
                if !seen.insert(spec.key()) {
                    return Err(LoaderError::DuplicateDependency {
                        module: str_id.to_string(),
                        dependency: state.identity.str_of(spec.key()).to_string(),
                    });
                }
            }
            if is_build {
                let names = specs
                    .iter()
                    .map(|spec| state.identity.str_of(spec.key()).to_string())
                    .collect();
                state.build_dependencies.insert(module_id, names);
            }
            state.known.insert(module_id);
            let record = ModuleRecord::new(
                module_id,
                str_id.to_string(),
                specs,
                factory,
                error_handler,
                resolver,
            );
            state.modules.insert(module_id, record);
            module_id
        };
        debug!(module = str_id, "defined module");
        self.resolve_module(module_id);
        Ok(())
    }

    /// Enqueue an anonymous definition; the next successful resource load
    /// adopts it under the loaded module's id.
    pub fn define_anonymous_module(
        &self,
        dependencies: &[&str],
        factory: ModuleFactory,
    ) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.pending_anonymous.is_some() {
            return Err(LoaderError::DuplicateAnonymousDefinition);
        }
        state.pending_anonymous = Some(PendingDefinition {
            dependencies: dependencies.iter().map(|raw| raw.to_string()).collect(),
            factory,
        });
        Ok(())
    }

    /// Top-level asynchronous request: load `dependencies` and hand their
    /// values to `on_ready`, or the failure to `on_error`.
    ///
    /// Internally a synthetic anonymous module, so the callback runs even in
    /// build passes.
    pub fn require_modules(
        &self,
        dependencies: &[&str],
        on_ready: impl FnOnce(&[DependencyValue]) + 'static,
        on_error: impl FnOnce(&LoaderError) + 'static,
    ) -> Result<()> {
        let str_id = {
            let mut state = self.inner.state.borrow_mut();
            state.anonymous_counter += 1;
            format!("{}{}==", ANONYMOUS_PREFIX, state.anonymous_counter)
        };
        let factory = ModuleFactory::from_fn(move |values| {
            on_ready(values);
            Ok(None)
        });
        self.define_module(&str_id, dependencies, factory, Some(Box::new(on_error)))
    }

    /// Memoized synchronous lookup of a completed module's exports.
    ///
    /// Fails when the module is unknown or still resolving; replays the
    /// stored error when the module errored.
    pub fn synchronous_require(&self, str_id: &str) -> Result<Exports> {
        self.synchronous_require_scoped(str_id, &ModuleIdResolver::root())
    }

    fn synchronous_require_scoped(
        &self,
        raw: &str,
        resolver: &ModuleIdResolver,
    ) -> Result<Exports> {
        let mut state = self.inner.state.borrow_mut();
        let spec = state.normalize_dependency(raw, resolver);
        let Some(record) = state.modules.get(&spec.key()) else {
            return Err(LoaderError::UnknownModule {
                module: raw.to_string(),
            });
        };
        if !record.is_complete() {
            return Err(LoaderError::NotYetComplete {
                module: raw.to_string(),
            });
        }
        if let Some(error) = &record.error {
            return Err(error.clone());
        }
        Ok(record.exports.clone())
    }

    /// The build manifest, only while the build flag is set.
    pub fn get_build_info(&self) -> Option<Vec<BuildModuleInfo>> {
        if !self.inner.config.borrow().is_build {
            return None;
        }
        let state = self.inner.state.borrow();
        let mut entries: Vec<BuildModuleInfo> = state
            .modules
            .values()
            .filter(|record| !record.str_id.starts_with(ANONYMOUS_PREFIX))
            .map(|record| BuildModuleInfo {
                id: record.str_id.clone(),
                resolved_location: state.build_locations.get(&record.id).cloned(),
                dependencies: state
                    .build_dependencies
                    .get(&record.id)
                    .cloned()
                    .unwrap_or_default(),
                exports: record.exports.to_value(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Some(entries)
    }

    /// Attempt resolution of every dependency slot of a not-yet-complete
    /// record, in declaration order.
    fn resolve_module(&self, module_id: ModuleId) {
        let dep_count = {
            let state = self.inner.state.borrow();
            match state
                .modules
                .get(&module_id)
                .and_then(|record| record.dependencies.as_ref())
            {
                Some(dependencies) => dependencies.len(),
                None => 0,
            }
        };

        for index in 0..dep_count {
            let action = {
                let mut state = self.inner.state.borrow_mut();
                let Some(record) = state.modules.get(&module_id) else {
                    return;
                };
                // loads triggered by earlier slots may have settled this
                // record re-entrantly
                if record.is_complete() {
                    return;
                }
                let Some(dependencies) = record.dependencies.as_ref() else {
                    return;
                };
                let spec = dependencies[index].clone();
                let resolver = Rc::clone(&record.resolver);
                self.resolve_slot(&mut state, module_id, spec, resolver)
            };
            match action {
                SlotAction::Continue => {}
                SlotAction::AbortErrored(error) => {
                    self.notify_module_error(module_id, &error);
                    return;
                }
                SlotAction::Load(target) => self.load_module_resource(target),
                SlotAction::RunPlugin { plugin, dependency } => {
                    self.run_plugin_dependency(plugin, dependency)
                }
                SlotAction::PluginContract {
                    result_id,
                    plugin_id,
                } => {
                    let error = self.plugin_contract_error(result_id, plugin_id);
                    self.propagate_error(result_id, error);
                }
            }
        }

        let ready = {
            let state = self.inner.state.borrow();
            matches!(
                state.modules.get(&module_id),
                Some(record) if !record.is_complete() && record.unresolved_count == 0
            )
        };
        if ready {
            self.complete_module(module_id);
        }
    }

    fn resolve_slot(
        &self,
        state: &mut GraphState,
        module_id: ModuleId,
        spec: DependencySpec,
        resolver: Rc<ModuleIdResolver>,
    ) -> SlotAction {
        match spec {
            DependencySpec::Exports => {
                if let Some(record) = state.modules.get_mut(&module_id) {
                    record.exports_passed_in = true;
                    record.unresolved_count -= 1;
                }
                SlotAction::Continue
            }
            DependencySpec::Module | DependencySpec::Require => {
                if let Some(record) = state.modules.get_mut(&module_id) {
                    record.unresolved_count -= 1;
                }
                SlotAction::Continue
            }
            DependencySpec::Regular { id: target_id } => {
                match self.check_target(state, module_id, target_id) {
                    TargetCheck::Errored(error) => SlotAction::AbortErrored(error),
                    TargetCheck::Settled => SlotAction::Continue,
                    TargetCheck::Waiting => {
                        state
                            .inverse_dependencies
                            .entry(target_id)
                            .or_default()
                            .push(module_id);
                        if state.known.insert(target_id) {
                            SlotAction::Load(target_id)
                        } else {
                            SlotAction::Continue
                        }
                    }
                }
            }
            DependencySpec::Plugin {
                id: result_id,
                plugin_id,
                plugin_param,
            } => match self.check_target(state, module_id, result_id) {
                TargetCheck::Errored(error) => SlotAction::AbortErrored(error),
                TargetCheck::Settled => SlotAction::Continue,
                TargetCheck::Waiting => {
                    state
                        .inverse_dependencies
                        .entry(result_id)
                        .or_default()
                        .push(module_id);
                    let dependency = PluginDependency {
                        result_id,
                        plugin_id,
                        plugin_param,
                        resolver,
                    };
                    let plugin_status = state.modules.get(&plugin_id).map(|plugin| {
                        (
                            plugin.is_complete(),
                            plugin.error.clone(),
                            plugin.exports.as_plugin(),
                        )
                    });
                    match plugin_status {
                        Some((true, Some(error), _)) => SlotAction::AbortErrored(error),
                        Some((true, None, Some(plugin))) => {
                            SlotAction::RunPlugin { plugin, dependency }
                        }
                        Some((true, None, None)) => SlotAction::PluginContract {
                            result_id,
                            plugin_id,
                        },
                        _ => {
                            state
                                .inverse_plugin_dependencies
                                .entry(plugin_id)
                                .or_default()
                                .push(dependency);
                            if state.known.insert(plugin_id) {
                                SlotAction::Load(plugin_id)
                            } else {
                                SlotAction::Continue
                            }
                        }
                    }
                }
            },
        }
    }

    /// Shared per-slot target inspection: completed targets settle the slot
    /// (or abort on error), still-forming cycles are broken here.
    fn check_target(
        &self,
        state: &mut GraphState,
        module_id: ModuleId,
        target_id: ModuleId,
    ) -> TargetCheck {
        let target_status = state
            .modules
            .get(&target_id)
            .map(|target| (target.is_complete(), target.error.clone()));
        if let Some((true, error)) = target_status {
            return match error {
                Some(error) => TargetCheck::Errored(error),
                None => {
                    if let Some(record) = state.modules.get_mut(&module_id) {
                        record.unresolved_count -= 1;
                    }
                    TargetCheck::Settled
                }
            };
        }
        if state.has_dependency_path(target_id, module_id) {
            warn!(
                "dependency cycle between '{}' and '{}', breaking the edge; cycle: {}",
                state.identity.str_of(target_id),
                state.identity.str_of(module_id),
                state.render_cycle(target_id, module_id)
            );
            if let Some(record) = state.modules.get_mut(&module_id) {
                record.unresolved_count -= 1;
            }
            return TargetCheck::Settled;
        }
        TargetCheck::Waiting
    }

    /// Drive completion propagation from `module_id` with an explicit work
    /// stack.
    fn complete_module(&self, module_id: ModuleId) {
        let mut stack = vec![CompletionTask::Complete(module_id)];
        while let Some(task) = stack.pop() {
            match task {
                CompletionTask::Complete(id) => self.run_completion(id, &mut stack),
                CompletionTask::Finalize(id) => self.run_finalization(id),
            }
        }
    }

    fn run_completion(&self, id: ModuleId, stack: &mut Vec<CompletionTask>) {
        let prepared = {
            let mut state = self.inner.state.borrow_mut();
            let config = self.inner.config.borrow();
            let catch_errors = config.catch_errors;
            let Some(record) = state.modules.get_mut(&id) else {
                return;
            };
            // idempotent entry point; completion may be reached through
            // several propagation paths
            if record.is_complete() {
                return;
            }
            record.complete = true;
            let str_id = record.str_id.clone();
            let resolver = Rc::clone(&record.resolver);
            let own_exports = record.exports.clone();
            let dependencies = record.dependencies.take().unwrap_or_default();
            let mut factory = record.factory.take();
            if matches!(factory, Some(ModuleFactory::Function(_)))
                && !config.should_invoke_factory(&str_id)
            {
                factory = None;
            }
            drop(config);
            let values = dependencies
                .iter()
                .map(|spec| self.dependency_value(&state, spec, &str_id, &resolver, &own_exports))
                .collect();
            PreparedCompletion {
                str_id,
                factory,
                values,
                catch_errors,
            }
        };

        let PreparedCompletion {
            str_id,
            factory,
            values,
            catch_errors,
        } = prepared;
        let outcome = factory.map(|factory| {
            let invoked = factory.is_function();
            if invoked {
                self.inner
                    .recorder
                    .record(LoaderEventKind::BeginInvokeFactory, &str_id);
            }
            let outcome = run_factory(factory, &values, catch_errors);
            if invoked {
                self.inner
                    .recorder
                    .record(LoaderEventKind::EndInvokeFactory, &str_id);
            }
            outcome
        });

        let produced_error = {
            let mut state = self.inner.state.borrow_mut();
            let needed_by = state.direct_dependents_str(id);
            let Some(record) = state.modules.get_mut(&id) else {
                return;
            };
            let error = outcome.and_then(|outcome| record.apply_factory_outcome(outcome, needed_by));
            if error.is_none() {
                record.release();
            }
            error
        };
        if let Some(error) = produced_error {
            self.propagate_error(id, error);
            return;
        }
        debug!(module = %str_id, "module complete");

        let ready = {
            let mut state = self.inner.state.borrow_mut();
            let waiters = state.inverse_dependencies.remove(&id).unwrap_or_default();
            let mut ready = Vec::new();
            for waiter in waiters {
                if let Some(dependent) = state.modules.get_mut(&waiter) {
                    if dependent.is_complete() {
                        continue;
                    }
                    dependent.unresolved_count -= 1;
                    if dependent.unresolved_count == 0 {
                        ready.push(waiter);
                    }
                }
            }
            ready
        };
        stack.push(CompletionTask::Finalize(id));
        // reversed so the stack pops waiters in registration order, each
        // fully completed before the next
        for waiter in ready.into_iter().rev() {
            stack.push(CompletionTask::Complete(waiter));
        }
    }

    fn run_finalization(&self, id: ModuleId) {
        let (parked, plugin) = {
            let mut state = self.inner.state.borrow_mut();
            let parked = state
                .inverse_plugin_dependencies
                .remove(&id)
                .unwrap_or_default();
            let plugin = state
                .modules
                .get(&id)
                .and_then(|record| record.exports.as_plugin());
            (parked, plugin)
        };
        if !parked.is_empty() {
            match plugin {
                Some(plugin) => {
                    for dependency in parked {
                        self.run_plugin_dependency(Rc::clone(&plugin), dependency);
                    }
                }
                None => {
                    for dependency in parked {
                        let error =
                            self.plugin_contract_error(dependency.result_id, dependency.plugin_id);
                        self.propagate_error(dependency.result_id, error);
                    }
                }
            }
        }
        let mut state = self.inner.state.borrow_mut();
        let drop_record = matches!(
            state.modules.get(&id),
            Some(record) if record.str_id.starts_with(ANONYMOUS_PREFIX) && record.error.is_none()
        );
        if drop_record {
            state.modules.remove(&id);
        }
    }

    /// Final dependency values in declaration order. Slots that never
    /// resolved (a broken cycle edge whose target did not take `exports`)
    /// yield [`DependencyValue::Unresolved`].
    fn dependency_value(
        &self,
        state: &GraphState,
        spec: &DependencySpec,
        str_id: &str,
        resolver: &Rc<ModuleIdResolver>,
        own_exports: &Exports,
    ) -> DependencyValue {
        match spec {
            DependencySpec::Exports => match own_exports {
                Exports::Data(cell) => DependencyValue::Exports(Rc::clone(cell)),
                Exports::Plugin(_) => DependencyValue::Unresolved,
            },
            DependencySpec::Module => DependencyValue::Module(ModuleContext {
                id: str_id.to_string(),
                config: Rc::clone(&self.inner.config),
            }),
            DependencySpec::Require => DependencyValue::Require(ScopedRequire {
                manager: self.clone(),
                resolver: Rc::clone(resolver),
            }),
            DependencySpec::Regular { id } | DependencySpec::Plugin { id, .. } => {
                match state.modules.get(id) {
                    // a completed target's exports, or the possibly-partial
                    // exports object of a cycle-broken target that declared
                    // `exports`
                    Some(target) if target.is_complete() || target.exports_passed_in => {
                        DependencyValue::Resolved(target.exports.clone())
                    }
                    _ => DependencyValue::Unresolved,
                }
            }
        }
    }

    fn load_module_resource(&self, module_id: ModuleId) {
        let str_id = {
            self.inner
                .state
                .borrow()
                .identity
                .str_of(module_id)
                .to_string()
        };
        let candidates = Rc::new(self.inner.locator.candidate_locations(&str_id));
        trace!(module = %str_id, ?candidates, "requesting module resource");
        self.try_candidate(module_id, candidates, 0, None);
    }

    /// Candidate fallback: strictly sequential, never speculative. Only
    /// after every candidate failed does the failure propagate.
    fn try_candidate(
        &self,
        module_id: ModuleId,
        candidates: Rc<Vec<String>>,
        index: usize,
        last_error: Option<Rc<anyhow::Error>>,
    ) {
        if index >= candidates.len() {
            let reason = match last_error {
                Some(error) => format!("{error:#}"),
                None => "no candidate locations".to_string(),
            };
            self.handle_load_failure(module_id, reason);
            return;
        }
        let location = candidates[index].clone();
        if location == EMPTY_LOCATION {
            self.define_empty_module(module_id, &location);
            return;
        }
        self.inner
            .recorder
            .record(LoaderEventKind::BeginLoadingResource, &location);
        let on_success: LoadSuccess = {
            let manager = self.clone();
            let location = location.clone();
            Box::new(move || {
                manager
                    .inner
                    .recorder
                    .record(LoaderEventKind::EndLoadingResourceOk, &location);
                if manager.inner.config.borrow().is_build {
                    manager
                        .inner
                        .state
                        .borrow_mut()
                        .build_locations
                        .insert(module_id, location.clone());
                }
                manager.on_resource_loaded(module_id);
            })
        };
        let on_failure: LoadFailure = {
            let manager = self.clone();
            let location = location.clone();
            let candidates = Rc::clone(&candidates);
            Box::new(move |error| {
                manager
                    .inner
                    .recorder
                    .record(LoaderEventKind::EndLoadingResourceError, &location);
                manager.try_candidate(module_id, candidates, index + 1, Some(error));
            })
        };
        self.inner
            .coordinator
            .load(self, &location, on_success, on_failure);
    }

    /// The `empty:` sentinel short-circuits to a module with empty exports
    /// without consulting the resource loader.
    fn define_empty_module(&self, module_id: ModuleId, location: &str) {
        let str_id = {
            self.inner
                .state
                .borrow()
                .identity
                .str_of(module_id)
                .to_string()
        };
        if self.inner.config.borrow().is_build {
            self.inner
                .state
                .borrow_mut()
                .build_locations
                .insert(module_id, location.to_string());
        }
        debug!(module = %str_id, "excluded through empty location sentinel");
        if let Err(error) = self.define_module(&str_id, &[], ModuleFactory::from_fn(|_| Ok(None)), None)
        {
            let sink = self.inner.config.borrow().on_error.clone();
            sink(&error);
        }
    }

    /// A resource finished loading: adopt the pending anonymous definition,
    /// if its evaluation produced one.
    fn on_resource_loaded(&self, module_id: ModuleId) {
        let pending = { self.inner.state.borrow_mut().pending_anonymous.take() };
        if let Some(definition) = pending {
            let str_id = {
                self.inner
                    .state
                    .borrow()
                    .identity
                    .str_of(module_id)
                    .to_string()
            };
            let dependencies: Vec<&str> =
                definition.dependencies.iter().map(String::as_str).collect();
            if let Err(error) =
                self.define_module(&str_id, &dependencies, definition.factory, None)
            {
                let sink = self.inner.config.borrow().on_error.clone();
                sink(&error);
            }
        }
    }

    fn handle_load_failure(&self, module_id: ModuleId, reason: String) {
        let error = {
            let state = self.inner.state.borrow();
            LoaderError::LoadFailed {
                module: state.identity.str_of(module_id).to_string(),
                needed_by: state.direct_dependents_str(module_id),
                reason,
            }
        };
        warn!("{error}");
        self.propagate_error(module_id, error);
    }

    /// Breadth-first walk over the inverse-dependency graph, offering the
    /// error to every module waiting directly or transitively on `origin`.
    /// Escalates to the configured sink exactly once if no visited module
    /// had a local handler.
    fn propagate_error(&self, origin: ModuleId, error: LoaderError) {
        // make sure an errored record exists at the origin, so the failure
        // is memoized for later lookups and later dependents abort instead
        // of waiting forever
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.modules.contains_key(&origin) {
                let str_id = state.identity.str_of(origin).to_string();
                let resolver = Rc::new(ModuleIdResolver::new(&str_id));
                let mut record = ModuleRecord::new(
                    origin,
                    str_id,
                    Vec::new(),
                    ModuleFactory::from_fn(|_| Ok(None)),
                    None,
                    resolver,
                );
                record.complete = true;
                record.error = Some(error.clone());
                state.modules.insert(origin, record);
            }
        }
        let mut handled = false;
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::new();
        visited.insert(origin);
        queue.push_back(origin);
        while let Some(id) = queue.pop_front() {
            let handler = {
                let mut state = self.inner.state.borrow_mut();
                if let Some(waiters) = state.inverse_dependencies.get(&id) {
                    for &waiter in waiters {
                        if visited.insert(waiter) {
                            queue.push_back(waiter);
                        }
                    }
                }
                // consumers parked on a failed plugin module wait through
                // their result ids
                if let Some(parked) = state.inverse_plugin_dependencies.get(&id) {
                    for dependency in parked {
                        if visited.insert(dependency.result_id) {
                            queue.push_back(dependency.result_id);
                        }
                    }
                }
                state
                    .modules
                    .get_mut(&id)
                    .and_then(|record| record.notify_error(&error))
            };
            if let Some(handler) = handler {
                handled = true;
                handler(&error);
            }
        }
        if !handled {
            let sink = self.inner.config.borrow().on_error.clone();
            sink(&error);
        }
    }

    /// Mark one record errored and run its local handler, without walking
    /// the inverse graph (used when a dependency was already known to have
    /// failed).
    fn notify_module_error(&self, module_id: ModuleId, error: &LoaderError) {
        let handler = {
            let mut state = self.inner.state.borrow_mut();
            state
                .modules
                .get_mut(&module_id)
                .and_then(|record| record.notify_error(error))
        };
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Delegate a mediated dependency to a completed plugin module. The
    /// result id is marked known so the plugin runs at most once per result.
    fn run_plugin_dependency(&self, plugin: Rc<dyn LoaderPlugin>, dependency: PluginDependency) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.modules.contains_key(&dependency.result_id)
                || !state.known.insert(dependency.result_id)
            {
                return;
            }
        }
        let require = ScopedRequire {
            manager: self.clone(),
            resolver: Rc::clone(&dependency.resolver),
        };
        let completion = PluginCompletion::new(self.clone(), dependency.result_id);
        let options = PluginLoadOptions {
            is_build: self.inner.config.borrow().is_build,
            platform: self.inner.environment.platform(),
        };
        trace!(param = %dependency.plugin_param, "delegating to loader plugin");
        plugin.load(&dependency.plugin_param, require, completion, &options);
    }

    /// A plugin delivered its result (or failure) for the mediated value.
    pub(crate) fn define_plugin_result(&self, result_id: ModuleId, outcome: anyhow::Result<Value>) {
        let str_id = {
            self.inner
                .state
                .borrow()
                .identity
                .str_of(result_id)
                .to_string()
        };
        match outcome {
            Ok(value) => {
                if let Err(error) =
                    self.define_module(&str_id, &[], ModuleFactory::literal(value), None)
                {
                    let sink = self.inner.config.borrow().on_error.clone();
                    sink(&error);
                }
            }
            Err(error) => {
                let loader_error = {
                    let state = self.inner.state.borrow();
                    LoaderError::LoadFailed {
                        module: str_id,
                        needed_by: state.direct_dependents_str(result_id),
                        reason: format!("{error:#}"),
                    }
                };
                self.propagate_error(result_id, loader_error);
            }
        }
    }

    fn plugin_contract_error(&self, result_id: ModuleId, plugin_id: ModuleId) -> LoaderError {
        let state = self.inner.state.borrow();
        LoaderError::LoadFailed {
            module: state.identity.str_of(result_id).to_string(),
            needed_by: state.direct_dependents_str(result_id),
            reason: format!(
                "module '{}' completed but its exports do not implement the loader plugin contract",
                state.identity.str_of(plugin_id)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::DetectedEnvironment;
    use crate::events::NullEventRecorder;
    use crate::loaders::StaticResourceLoader;
    use serde_json::json;

    fn manager() -> ModuleManager {
        ModuleManager::new(
            Rc::new(DetectedEnvironment),
            Rc::new(StaticResourceLoader::new()),
            Rc::new(NullEventRecorder),
        )
    }

    #[test]
    fn test_define_and_require() {
        let manager = manager();
        manager
            .define_module(
                "answer",
                &[],
                ModuleFactory::from_fn(|_| Ok(Some(Exports::value(json!(42))))),
                None,
            )
            .unwrap();
        assert_eq!(manager.synchronous_require("answer").unwrap().to_value(), json!(42));
    }

    #[test]
    fn test_literal_factory_becomes_exports() {
        let manager = manager();
        manager
            .define_module("config", &[], ModuleFactory::literal(json!({"a": 1})), None)
            .unwrap();
        assert_eq!(
            manager.synchronous_require("config").unwrap().to_value(),
            json!({"a": 1})
        );
    }

    #[test]
    fn test_duplicate_dependency_is_rejected() {
        let manager = manager();
        let result = manager.define_module(
            "m",
            &["a", "./a"],
            ModuleFactory::from_fn(|_| Ok(None)),
            None,
        );
        assert_eq!(
            result,
            Err(LoaderError::DuplicateDependency {
                module: "m".to_string(),
                dependency: "a".to_string(),
            })
        );
    }

    #[test]
    fn test_synchronous_require_failures() {
        let manager = ModuleManager::new(
            Rc::new(DetectedEnvironment),
            Rc::new(crate::loaders::DeferredResourceLoader::new()),
            Rc::new(NullEventRecorder),
        );
        assert!(matches!(
            manager.synchronous_require("missing"),
            Err(LoaderError::UnknownModule { .. })
        ));
        manager
            .define_module("waiting", &["other"], ModuleFactory::from_fn(|_| Ok(None)), None)
            .unwrap();
        assert!(matches!(
            manager.synchronous_require("waiting"),
            Err(LoaderError::NotYetComplete { .. })
        ));
    }

    #[test]
    fn test_reset_discards_graph_state() {
        let manager = manager();
        manager
            .define_module("m", &[], ModuleFactory::literal(json!(1)), None)
            .unwrap();
        let fresh = manager.reset();
        assert!(manager.synchronous_require("m").is_ok());
        assert!(matches!(
            fresh.synchronous_require("m"),
            Err(LoaderError::UnknownModule { .. })
        ));
    }
}
