//! Sandbox realm capability
//!
//! A realm evaluates foreign source text in isolation. Nothing crosses the
//! boundary except through explicit bindings (host -> realm) and the module
//! export table returned by evaluation (realm -> host). Values cross as
//! owned JSON, so every crossing is a deep copy.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SandboxResult;
use super::ids::ContextId;
use super::page::{DocumentHandle, WindowHandle};

/// Callable crossing the realm boundary, in either direction
pub type RealmFn = Arc<dyn Fn(Vec<Value>) -> SandboxResult<Value> + Send + Sync>;

/// Something the host installs into a realm
#[derive(Clone)]
pub enum Binding {
    /// Plain data, copied into the realm
    Value(Value),
    /// Host function callable from sandboxed code
    Function(RealmFn),
    /// Live page window
    Window(WindowHandle),
    /// Live page document
    Document(DocumentHandle),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Binding::Function(_) => f.write_str("Function(..)"),
            Binding::Window(window) => f.debug_tuple("Window").field(window).finish(),
            Binding::Document(document) => f.debug_tuple("Document").field(document).finish(),
        }
    }
}

/// One entry of a module's export table
#[derive(Clone)]
pub enum Export {
    /// Exported function
    Function(RealmFn),
    /// Exported data
    Value(Value),
}

impl Export {
    /// The callable, if this export is one
    pub fn as_function(&self) -> Option<&RealmFn> {
        match self {
            Export::Function(function) => Some(function),
            Export::Value(_) => None,
        }
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Export::Function(_) => f.write_str("Function(..)"),
            Export::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Export table produced by evaluating a module
pub type ModuleExports = BTreeMap<String, Export>;

/// Metadata attached to a sandbox for page tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmMetadata {
    /// Marks the sandbox as running an instrumenter script
    pub instrumenter_script: bool,

    /// Inner-window id of the page context the realm is bound to
    pub inner_window_id: Option<ContextId>,

    /// Principal owning the sandbox
    pub principal: String,
}

/// Parameters for creating a realm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmOptions {
    /// Sandbox name, shown by page tooling
    pub name: String,

    /// Window whose globals the realm inherits and whose zone it shares
    pub target: WindowHandle,

    /// Expose page objects through x-ray wrappers
    pub xrays: bool,

    /// Install export helper functions
    pub export_helpers: bool,

    /// Expose privileged component objects
    pub components: bool,

    /// Sandbox metadata
    pub metadata: RealmMetadata,
}

/// An isolated evaluation environment
pub trait Realm: Send {
    /// Install `binding` at a dotted `path` (e.g. `instrumenter.target.window`)
    fn bind_value(&mut self, path: &str, binding: Binding) -> SandboxResult<()>;

    /// Remove the binding at `path` without touching the rest of the realm
    fn unbind_value(&mut self, path: &str) -> SandboxResult<()>;

    /// Evaluate `source` and return what it assigned to `module.exports`
    fn evaluate(&mut self, source: &str) -> SandboxResult<ModuleExports>;

    /// Release the realm; every export and binding becomes unusable
    fn destroy(&mut self);
}

/// Creates realms
pub trait RealmFactory: Send + Sync {
    /// Create a new, empty realm
    fn create_isolated_realm(&self, options: &RealmOptions) -> SandboxResult<Box<dyn Realm>>;
}
