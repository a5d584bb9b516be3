//! Scripted realm factory
//!
//! Stands in for a script engine: each "source text" is a key into a table
//! of Rust module bodies. A body runs at evaluation time against a
//! [`ModuleScope`] that can read the host bindings and populate the export
//! table. Exports stop working once their realm is destroyed, like calls
//! into a nuked sandbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::runtime::error::{SandboxError, SandboxResult};
use crate::runtime::page::{DocumentHandle, WindowHandle};
use crate::runtime::realm::{
    Binding, Export, ModuleExports, Realm, RealmFactory, RealmFn, RealmOptions,
};

type ModuleBody = Arc<dyn Fn(&mut ModuleScope) -> SandboxResult<()> + Send + Sync>;

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    live: AtomicUsize,
}

struct RealmState {
    options: RealmOptions,
    bindings: HashMap<String, Binding>,
    destroyed: bool,
}

/// Read access to one realm's bindings, usable after evaluation
#[derive(Clone)]
pub struct RealmHandle {
    state: Arc<Mutex<RealmState>>,
}

impl RealmHandle {
    /// Options the realm was created with
    pub fn options(&self) -> RealmOptions {
        self.state.lock().options.clone()
    }

    /// Whether the realm has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Whether anything is bound at `path`
    pub fn has_binding(&self, path: &str) -> bool {
        self.state.lock().bindings.contains_key(path)
    }

    /// Data bound at `path`
    pub fn value(&self, path: &str) -> Option<Value> {
        match self.state.lock().bindings.get(path) {
            Some(Binding::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Host function bound at `path`
    pub fn function(&self, path: &str) -> Option<RealmFn> {
        match self.state.lock().bindings.get(path) {
            Some(Binding::Function(function)) => Some(function.clone()),
            _ => None,
        }
    }

    /// Window bound at `path`
    pub fn window(&self, path: &str) -> Option<WindowHandle> {
        match self.state.lock().bindings.get(path) {
            Some(Binding::Window(window)) => Some(window.clone()),
            _ => None,
        }
    }

    /// Document bound at `path`
    pub fn document(&self, path: &str) -> Option<DocumentHandle> {
        match self.state.lock().bindings.get(path) {
            Some(Binding::Document(document)) => Some(document.clone()),
            _ => None,
        }
    }

    /// Call the host function bound at `path`
    pub fn call(&self, path: &str, args: Vec<Value>) -> SandboxResult<Value> {
        let function = self.function(path).ok_or_else(|| {
            SandboxError::Thrown(format!("TypeError: {path} is not a function"))
        })?;
        function(args)
    }
}

/// Evaluation-time view handed to a module body
pub struct ModuleScope {
    handle: RealmHandle,
    exports: ModuleExports,
}

impl ModuleScope {
    /// Handle to this realm that closures can keep
    pub fn realm(&self) -> RealmHandle {
        self.handle.clone()
    }

    /// Data bound at `path`
    pub fn value(&self, path: &str) -> Option<Value> {
        self.handle.value(path)
    }

    /// Host function bound at `path`
    pub fn function(&self, path: &str) -> Option<RealmFn> {
        self.handle.function(path)
    }

    /// Call the host function bound at `path`
    pub fn call(&self, path: &str, args: Vec<Value>) -> SandboxResult<Value> {
        self.handle.call(path, args)
    }

    /// `module.exports[name] = function`
    pub fn export_fn<F>(&mut self, name: &str, function: F)
    where
        F: Fn(Vec<Value>) -> SandboxResult<Value> + Send + Sync + 'static,
    {
        let state = self.handle.state.clone();
        let guarded: RealmFn = Arc::new(move |args| {
            if state.lock().destroyed {
                return Err(SandboxError::RealmDestroyed);
            }
            function(args)
        });
        self.exports.insert(name.to_string(), Export::Function(guarded));
    }

    /// `module.exports[name] = value`
    pub fn export_value(&mut self, name: &str, value: Value) {
        self.exports.insert(name.to_string(), Export::Value(value));
    }
}

/// Realm created by [`ScriptedRealmFactory`]
pub struct ScriptedRealm {
    handle: RealmHandle,
    modules: Arc<Mutex<HashMap<String, ModuleBody>>>,
    counters: Arc<Counters>,
}

impl Realm for ScriptedRealm {
    fn bind_value(&mut self, path: &str, binding: Binding) -> SandboxResult<()> {
        let mut state = self.handle.state.lock();
        if state.destroyed {
            return Err(SandboxError::RealmDestroyed);
        }
        state.bindings.insert(path.to_string(), binding);
        Ok(())
    }

    fn unbind_value(&mut self, path: &str) -> SandboxResult<()> {
        let mut state = self.handle.state.lock();
        if state.destroyed {
            return Err(SandboxError::RealmDestroyed);
        }
        state.bindings.remove(path);
        Ok(())
    }

    fn evaluate(&mut self, source: &str) -> SandboxResult<ModuleExports> {
        if self.handle.is_destroyed() {
            return Err(SandboxError::RealmDestroyed);
        }
        let body = self.modules.lock().get(source).cloned().ok_or_else(|| {
            SandboxError::Evaluation(format!("ReferenceError: unknown module source {source:?}"))
        })?;

        let mut scope = ModuleScope {
            handle: self.handle.clone(),
            exports: ModuleExports::new(),
        };
        body(&mut scope)?;
        Ok(scope.exports)
    }

    fn destroy(&mut self) {
        let mut state = self.handle.state.lock();
        if !state.destroyed {
            state.destroyed = true;
            state.bindings.clear();
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Realm factory backed by a table of Rust module bodies
#[derive(Default)]
pub struct ScriptedRealmFactory {
    modules: Arc<Mutex<HashMap<String, ModuleBody>>>,
    counters: Arc<Counters>,
    realms: Mutex<Vec<RealmHandle>>,
}

impl ScriptedRealmFactory {
    /// Factory with no modules
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the module body evaluated for `source`
    pub fn define<F>(&self, source: &str, body: F)
    where
        F: Fn(&mut ModuleScope) -> SandboxResult<()> + Send + Sync + 'static,
    {
        self.modules.lock().insert(source.to_string(), Arc::new(body));
    }

    /// Realms created so far
    pub fn created_realms(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    /// Realms created and not yet destroyed
    pub fn live_realms(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Most recently created realm
    pub fn last_realm(&self) -> Option<RealmHandle> {
        self.realms.lock().last().cloned()
    }

    /// Every realm created so far, oldest first
    pub fn realms(&self) -> Vec<RealmHandle> {
        self.realms.lock().clone()
    }
}

impl RealmFactory for ScriptedRealmFactory {
    fn create_isolated_realm(&self, options: &RealmOptions) -> SandboxResult<Box<dyn Realm>> {
        let handle = RealmHandle {
            state: Arc::new(Mutex::new(RealmState {
                options: options.clone(),
                bindings: HashMap::new(),
                destroyed: false,
            })),
        };
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        self.realms.lock().push(handle.clone());

        Ok(Box::new(ScriptedRealm {
            handle,
            modules: self.modules.clone(),
            counters: self.counters.clone(),
        }))
    }
}
