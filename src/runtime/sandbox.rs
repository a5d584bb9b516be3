//! Isolated execution context
//!
//! Wraps one realm bound to one page context. Creation seeds the realm with
//! the host capabilities (options, emit, target, console), evaluates the
//! instrumenter source and introspects the resulting exports once into an
//! [`ExportSurface`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};

use super::RealmSettings;
use super::error::{SandboxError, SandboxResult};
use super::ids::ContextId;
use super::page::{EvaluationRequest, PageContext, WindowHandle};
use super::realm::{
    Binding, Export, ModuleExports, Realm, RealmFactory, RealmFn, RealmMetadata, RealmOptions,
};

/// Binding paths seeded into every realm
pub mod paths {
    /// Export namespace assigned by the module
    pub const MODULE_EXPORTS: &str = "module.exports";
    /// Options snapshot
    pub const OPTIONS: &str = "instrumenter.options";
    /// Outbound event function
    pub const EMIT: &str = "instrumenter.emit";
    /// Live page window
    pub const TARGET_WINDOW: &str = "instrumenter.target.window";
    /// Live page document
    pub const TARGET_DOCUMENT: &str = "instrumenter.target.document";
    /// Page-context evaluation function
    pub const TARGET_EVALUATE: &str = "instrumenter.target.evaluate";
    /// Logging function
    pub const CONSOLE_LOG: &str = "console.log";
}

/// Export names the host treats as lifecycle hooks
pub mod hooks {
    /// `(name, data)` one-way event from the client
    pub const ON_EVENT: &str = "onEvent";
    /// Sandbox is about to be released
    pub const ON_UNLOAD: &str = "onUnload";
    /// Watched page context was created and the sandbox activated
    pub const ON_GLOBAL_CREATED: &str = "onGlobalCreated";
    /// Watched page context was destroyed
    pub const ON_GLOBAL_DESTROYED: &str = "onGlobalDestroyed";
}

/// Host callback receiving `(name, data)` from `instrumenter.emit`
pub type EventSink = Arc<dyn Fn(String, Value) + Send + Sync>;

/// Export table introspected once after evaluation
#[derive(Clone, Default)]
pub struct ExportSurface {
    on_event: Option<RealmFn>,
    on_unload: Option<RealmFn>,
    on_global_created: Option<RealmFn>,
    on_global_destroyed: Option<RealmFn>,
    table: ModuleExports,
}

impl ExportSurface {
    /// Resolve hook slots from a module's exports
    pub fn from_exports(table: ModuleExports) -> Self {
        let slot = |name: &str| table.get(name).and_then(Export::as_function).cloned();
        Self {
            on_event: slot(hooks::ON_EVENT),
            on_unload: slot(hooks::ON_UNLOAD),
            on_global_created: slot(hooks::ON_GLOBAL_CREATED),
            on_global_destroyed: slot(hooks::ON_GLOBAL_DESTROYED),
            table,
        }
    }

    /// `onEvent` hook
    pub fn on_event(&self) -> Option<RealmFn> {
        self.on_event.clone()
    }

    /// `onUnload` hook
    pub fn on_unload(&self) -> Option<RealmFn> {
        self.on_unload.clone()
    }

    /// `onGlobalCreated` hook
    pub fn on_global_created(&self) -> Option<RealmFn> {
        self.on_global_created.clone()
    }

    /// `onGlobalDestroyed` hook
    pub fn on_global_destroyed(&self) -> Option<RealmFn> {
        self.on_global_destroyed.clone()
    }

    /// Any export by name, hooks included
    pub fn get(&self, name: &str) -> Option<&Export> {
        self.table.get(name)
    }

    /// Names of all exports
    pub fn names(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }
}

impl fmt::Debug for ExportSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportSurface")
            .field("names", &self.names())
            .finish()
    }
}

/// Everything needed to build a context besides the realm factory and window
pub struct ContextSpec<'a> {
    /// Sandbox name
    pub name: &'a str,

    /// Instrumenter source text
    pub source: &'a str,

    /// Options mapping, copied into the realm
    pub options: &'a Value,

    /// Realm creation flags
    pub settings: &'a RealmSettings,

    /// Receiver for `instrumenter.emit`
    pub emit: EventSink,

    /// Page used by `instrumenter.target.evaluate`
    pub page: Arc<dyn PageContext>,

    /// URL tag for page evaluations
    pub evaluation_url: String,
}

/// One sandbox realm bound to one page context
pub struct IsolatedExecutionContext {
    realm: Box<dyn Realm>,
    window: Option<WindowHandle>,
    exports: ExportSurface,
    live: Arc<AtomicBool>,
}

impl IsolatedExecutionContext {
    /// Create a realm for `window`, seed it and evaluate the source
    ///
    /// On any failure the partially built realm is destroyed before the
    /// error is returned.
    pub fn create(
        factory: &dyn RealmFactory,
        window: WindowHandle,
        spec: ContextSpec<'_>,
    ) -> SandboxResult<Self> {
        let options = RealmOptions {
            name: spec.name.to_string(),
            target: window.clone(),
            xrays: spec.settings.xrays,
            export_helpers: spec.settings.export_helpers,
            components: spec.settings.components,
            metadata: RealmMetadata {
                instrumenter_script: true,
                inner_window_id: Some(window.context()),
                principal: spec.settings.principal.clone(),
            },
        };

        let mut realm = factory.create_isolated_realm(&options)?;
        let live = Arc::new(AtomicBool::new(true));

        match seed_and_evaluate(realm.as_mut(), &window, &spec, &live) {
            Ok(exports) => Ok(Self {
                realm,
                window: Some(window),
                exports: ExportSurface::from_exports(exports),
                live,
            }),
            Err(err) => {
                live.store(false, Ordering::SeqCst);
                realm.destroy();
                Err(err)
            }
        }
    }

    /// Introspected exports
    pub fn exports(&self) -> &ExportSurface {
        &self.exports
    }

    /// Bound window, until the target is detached
    pub fn window(&self) -> Option<&WindowHandle> {
        self.window.as_ref()
    }

    /// Identity of the bound page context, until the target is detached
    pub fn context(&self) -> Option<ContextId> {
        self.window.as_ref().map(WindowHandle::context)
    }

    /// Remove `target.window`/`target.document` while keeping the realm
    pub fn detach_target(&mut self) -> SandboxResult<()> {
        if self.window.take().is_none() {
            return Ok(());
        }
        self.realm.unbind_value(paths::TARGET_WINDOW)?;
        self.realm.unbind_value(paths::TARGET_DOCUMENT)?;
        Ok(())
    }

    /// Release the realm and disable every capability bound into it
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.window = None;
            self.realm.destroy();
        }
    }
}

impl Drop for IsolatedExecutionContext {
    fn drop(&mut self) {
        self.release();
    }
}

fn seed_and_evaluate(
    realm: &mut dyn Realm,
    window: &WindowHandle,
    spec: &ContextSpec<'_>,
    live: &Arc<AtomicBool>,
) -> SandboxResult<ModuleExports> {
    realm.bind_value(paths::MODULE_EXPORTS, Binding::Value(json!({})))?;
    realm.bind_value(paths::OPTIONS, Binding::Value(spec.options.clone()))?;

    let sink = spec.emit.clone();
    realm.bind_value(
        paths::EMIT,
        Binding::Function(guarded(live, move |args| {
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                Some(other) => other.to_string(),
                None => return Err(SandboxError::Thrown("emit requires an event name".into())),
            };
            sink(name, args.next().unwrap_or(Value::Null));
            Ok(Value::Null)
        })),
    )?;

    realm.bind_value(paths::TARGET_WINDOW, Binding::Window(window.clone()))?;
    realm.bind_value(paths::TARGET_DOCUMENT, Binding::Document(window.document()))?;

    let page = spec.page.clone();
    let url = spec.evaluation_url.clone();
    realm.bind_value(
        paths::TARGET_EVALUATE,
        Binding::Function(guarded(live, move |args| {
            let text = match args.first() {
                Some(Value::String(text)) if !text.is_empty() => text.clone(),
                None | Some(Value::Null) | Some(Value::String(_)) => {
                    return Err(SandboxError::EmptySource);
                }
                Some(other) => {
                    return Err(SandboxError::Thrown(format!(
                        "TypeError: evaluate expects source text, got {other}"
                    )));
                }
            };
            page.evaluate(EvaluationRequest {
                url: url.clone(),
                text,
            })
            .map_err(|err| SandboxError::Thrown(err.to_string()))
        })),
    )?;

    let sandbox = spec.name.to_string();
    realm.bind_value(
        paths::CONSOLE_LOG,
        Binding::Function(guarded(live, move |args| {
            let line = args
                .iter()
                .map(|arg| match arg {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(target: "director::sandbox", sandbox = %sandbox, "{}", line);
            Ok(Value::Null)
        })),
    )?;

    realm.evaluate(spec.source)
}

/// Wrap a host function so it fails once the owning context is released
fn guarded<F>(live: &Arc<AtomicBool>, function: F) -> RealmFn
where
    F: Fn(Vec<Value>) -> SandboxResult<Value> + Send + Sync + 'static,
{
    let live = live.clone();
    Arc::new(move |args| {
        if !live.load(Ordering::SeqCst) {
            return Err(SandboxError::RealmDestroyed);
        }
        function(args)
    })
}
