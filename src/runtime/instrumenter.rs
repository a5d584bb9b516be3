//! Instrumenter actor
//!
//! One actor per installed instrumenter. It owns at most one
//! [`IsolatedExecutionContext`] and drives it through the activation state
//! machine:
//!
//! ```text
//!   Inactive --activate / watched context created--> Active
//!   Active --deactivate / watched context destroyed--> Inactive
//!   any --finalize--> destroyed (terminal)
//! ```
//!
//! No lock is held while sandboxed code, the page or the navigation source
//! runs: hooks are cloned out of the state first, so a hook that calls back
//! into the actor (or its director) observes a consistent state.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::director::Attachment;
use super::error::{InstrumenterError, InstrumenterResult, PageError, SandboxError};
use super::ids::{ActorId, ContextId};
use super::navigation::{NavigationObserver, NavigationWatcher, Subscription};
use super::page::WindowHandle;
use super::realm::{Export, RealmFn};
use super::sandbox::{ContextSpec, EventSink, IsolatedExecutionContext, hooks};
use super::transport::ActorEvent;
use super::{DirectorConfig, MissingMethodPolicy};

/// Actor type name on the connection
pub const INSTRUMENTER_TYPE: &str = "instrumenter";

/// Wire type of events relayed from the sandbox
pub const INSTRUMENTER_EVENT: &str = "instrumenterEvent";

/// Activation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    /// No sandbox
    Inactive,
    /// Sandbox alive and bound to a page context
    Active,
}

/// Marshalled reference to an instrumenter actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumenterForm {
    /// Actor address
    pub actor: ActorId,

    /// Instrumenter id within its director
    pub id: String,

    /// Whether a sandbox is currently alive
    pub active: bool,
}

struct InstrumenterState {
    context: Option<IsolatedExecutionContext>,
    subscription: Option<Subscription>,
    destroyed: bool,
}

/// One installed instrumenter
pub struct InstrumenterActor {
    actor_id: ActorId,
    id: String,
    source: String,
    options: Value,
    attachment: Attachment,
    config: Arc<DirectorConfig>,
    watcher: NavigationWatcher,
    state: Mutex<InstrumenterState>,
    self_ref: Weak<InstrumenterActor>,
}

impl InstrumenterActor {
    /// Create the actor and make it addressable; no sandbox is built yet
    pub(crate) fn new(
        id: String,
        source: String,
        options: Value,
        attachment: Attachment,
        config: Arc<DirectorConfig>,
    ) -> Arc<Self> {
        let actor_id = ActorId::new();
        attachment
            .connection
            .register_actor(&actor_id, INSTRUMENTER_TYPE);

        let watcher = NavigationWatcher::new(attachment.navigation.clone(), attachment.page.clone());

        Arc::new_cyclic(|self_ref| Self {
            actor_id,
            id,
            source,
            options,
            attachment,
            config,
            watcher,
            state: Mutex::new(InstrumenterState {
                context: None,
                subscription: None,
                destroyed: false,
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Actor address
    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Instrumenter id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Instrumenter source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Options mapping handed to every sandbox
    pub fn options(&self) -> &Value {
        &self.options
    }

    /// Current activation state
    pub fn state(&self) -> ActivationState {
        if self.state.lock().context.is_some() {
            ActivationState::Active
        } else {
            ActivationState::Inactive
        }
    }

    /// Whether a sandbox is alive
    pub fn is_active(&self) -> bool {
        self.state() == ActivationState::Active
    }

    /// Whether navigation signals are being observed
    pub fn is_watching(&self) -> bool {
        self.state.lock().subscription.is_some()
    }

    /// Whether `finalize` has run
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Page context whose destruction will deactivate the sandbox
    pub fn watched_context(&self) -> Option<ContextId> {
        self.watcher.watched()
    }

    /// Names exported by the live sandbox
    pub fn exported_names(&self) -> Option<Vec<String>> {
        let state = self.state.lock();
        state.context.as_ref().map(|context| context.exports().names())
    }

    /// Marshalled reference
    pub fn form(&self) -> InstrumenterForm {
        InstrumenterForm {
            actor: self.actor_id.clone(),
            id: self.id.clone(),
            active: self.is_active(),
        }
    }

    /// Build the sandbox for the page's current window and start observing
    /// navigation; optionally reload the page afterwards
    pub fn activate(&self, reload: bool) -> InstrumenterResult<()> {
        self.ensure_alive()?;
        self.start_watching();
        self.build_context()?;
        if reload {
            self.attachment.page.reload()?;
        }
        Ok(())
    }

    /// Stop observing navigation and release the sandbox, if any; optionally
    /// reload the page afterwards
    pub fn deactivate(&self, reload: bool) -> InstrumenterResult<()> {
        self.ensure_alive()?;
        self.stop_watching();
        if self.teardown() {
            tracing::debug!(instrumenter = %self.id, "deactivated");
        }
        if reload {
            self.attachment.page.reload()?;
        }
        Ok(())
    }

    /// Stop observing, run `onUnload`, release the sandbox; idempotent
    pub fn finalize(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        self.stop_watching();
        self.teardown();
        self.attachment
            .connection
            .unregister_actor(&self.actor_id);
        tracing::debug!(instrumenter = %self.id, actor = %self.actor_id, "finalized");
    }

    /// One-way event into the sandbox's `onEvent` hook
    ///
    /// The handler receives its own copy of `data`. Errors thrown by the
    /// handler are logged and never reach the caller.
    pub fn send_event(&self, name: &str, data: &Value) -> InstrumenterResult<()> {
        let hook = {
            let state = self.state.lock();
            self.check_usable(&state)?;
            state
                .context
                .as_ref()
                .and_then(|context| context.exports().on_event())
        };

        if let Some(on_event) = hook {
            self.run_hook(
                hooks::ON_EVENT,
                &on_event,
                vec![Value::String(name.to_string()), data.clone()],
            );
        }
        Ok(())
    }

    /// Invoke an exported method with a copy of `args`
    pub fn call_method(&self, name: &str, args: &[Value]) -> InstrumenterResult<Value> {
        let export = {
            let state = self.state.lock();
            self.check_usable(&state)?;
            state
                .context
                .as_ref()
                .and_then(|context| context.exports().get(name).cloned())
        };

        let function = match export {
            Some(Export::Function(function)) => function,
            Some(Export::Value(_)) => {
                return Err(InstrumenterError::SandboxInvocation {
                    id: self.id.clone(),
                    method: name.to_string(),
                    detail: SandboxError::NotCallable(name.to_string()).to_string(),
                });
            }
            None => {
                return match self.config.missing_method {
                    MissingMethodPolicy::ReturnNull => Ok(Value::Null),
                    MissingMethodPolicy::Error => Err(InstrumenterError::MethodNotFound {
                        id: self.id.clone(),
                        method: name.to_string(),
                    }),
                };
            }
        };

        function(args.to_vec()).map_err(|err| InstrumenterError::SandboxInvocation {
            id: self.id.clone(),
            method: name.to_string(),
            detail: err.to_string(),
        })
    }

    pub(crate) fn start_watching(&self) {
        if self.state.lock().subscription.is_some() {
            return;
        }

        let observer: Weak<dyn NavigationObserver> = self.self_ref.clone();
        let subscription = self.watcher.start(observer);

        let surplus = {
            let mut state = self.state.lock();
            if state.destroyed || state.subscription.is_some() {
                Some(subscription)
            } else {
                state.subscription = Some(subscription);
                None
            }
        };
        if let Some(surplus) = surplus {
            surplus.release();
        }
    }

    fn stop_watching(&self) {
        let subscription = self.state.lock().subscription.take();
        if let Some(subscription) = subscription {
            subscription.release();
        }
        self.watcher.forget();
    }

    fn build_context(&self) -> InstrumenterResult<WindowHandle> {
        {
            let state = self.state.lock();
            if state.destroyed {
                return Err(InstrumenterError::Destroyed(self.id.clone()));
            }
            if state.context.is_some() {
                return Err(InstrumenterError::AlreadyActive(self.id.clone()));
            }
        }

        let window = self.attachment.page.window().ok_or(PageError::NoWindow)?;
        let context = IsolatedExecutionContext::create(
            self.attachment.realms.as_ref(),
            window.clone(),
            ContextSpec {
                name: &self.id,
                source: &self.source,
                options: &self.options,
                settings: &self.config.realm,
                emit: self.event_sink(),
                page: self.attachment.page.clone(),
                evaluation_url: format!("{}{}", self.config.evaluation_url_prefix, self.actor_id),
            },
        )?;

        // module evaluation runs sandboxed code, which may have re-entered us
        let mut state = self.state.lock();
        if state.destroyed || state.context.is_some() {
            let err = if state.destroyed {
                InstrumenterError::Destroyed(self.id.clone())
            } else {
                InstrumenterError::AlreadyActive(self.id.clone())
            };
            drop(state);
            context.destroy();
            return Err(err);
        }
        state.context = Some(context);
        drop(state);

        self.watcher.watch(window.context());
        tracing::debug!(
            instrumenter = %self.id,
            context = %window.context(),
            "activated"
        );
        Ok(window)
    }

    /// Take the sandbox out of the state, run `onUnload`, destroy it
    fn teardown(&self) -> bool {
        let context = self.state.lock().context.take();
        let Some(context) = context else {
            return false;
        };

        if let Some(on_unload) = context.exports().on_unload() {
            self.run_hook(hooks::ON_UNLOAD, &on_unload, Vec::new());
        }
        context.destroy();
        true
    }

    fn event_sink(&self) -> EventSink {
        let connection = self.attachment.connection.clone();
        let actor = self.actor_id.clone();
        Arc::new(move |name, data| {
            connection.emit(ActorEvent {
                from: actor.clone(),
                kind: INSTRUMENTER_EVENT.to_string(),
                data: json!({ "name": name, "data": data }),
            });
        })
    }

    fn run_hook(&self, hook: &str, function: &RealmFn, args: Vec<Value>) {
        if let Err(err) = function(args) {
            tracing::warn!(
                instrumenter = %self.id,
                hook,
                error = %err,
                "sandboxed handler failed"
            );
        }
    }

    fn ensure_alive(&self) -> InstrumenterResult<()> {
        if self.state.lock().destroyed {
            return Err(InstrumenterError::Destroyed(self.id.clone()));
        }
        Ok(())
    }

    fn check_usable(&self, state: &InstrumenterState) -> InstrumenterResult<()> {
        if state.destroyed {
            return Err(InstrumenterError::Destroyed(self.id.clone()));
        }
        if state.context.is_none() {
            return Err(InstrumenterError::NotActive(self.id.clone()));
        }
        Ok(())
    }
}

impl NavigationObserver for InstrumenterActor {
    fn on_context_created(&self, window: WindowHandle) {
        let bound = {
            let state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.context.as_ref().map(IsolatedExecutionContext::context)
        };

        match bound {
            Some(Some(context)) if context == window.context() => return,
            // the sandbox still belongs to the previous document
            Some(_) => {
                self.teardown();
            }
            None => {}
        }

        if let Err(err) = self.build_context() {
            tracing::warn!(
                instrumenter = %self.id,
                context = %window.context(),
                error = %err,
                "activation on navigation failed"
            );
            return;
        }

        let hook = {
            let state = self.state.lock();
            state
                .context
                .as_ref()
                .and_then(|context| context.exports().on_global_created())
        };
        if let Some(on_global_created) = hook {
            self.run_hook(hooks::ON_GLOBAL_CREATED, &on_global_created, Vec::new());
        }
    }

    fn on_context_destroyed(&self, context: ContextId) {
        let hook = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            match state.context.as_mut() {
                Some(sandbox) => {
                    if let Err(err) = sandbox.detach_target() {
                        tracing::warn!(instrumenter = %self.id, error = %err, "detaching target failed");
                    }
                    sandbox.exports().on_global_destroyed()
                }
                None => None,
            }
        };

        if let Some(on_global_destroyed) = hook {
            self.run_hook(hooks::ON_GLOBAL_DESTROYED, &on_global_destroyed, Vec::new());
        }

        if self.teardown() {
            tracing::debug!(instrumenter = %self.id, context = %context, "deactivated by navigation");
        }
    }
}

impl fmt::Debug for InstrumenterActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumenterActor")
            .field("actor_id", &self.actor_id)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Drop for InstrumenterActor {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::BufferedConnection;
    use crate::testing::{InMemoryPage, ScriptedRealmFactory};

    struct Fixture {
        page: Arc<InMemoryPage>,
        realms: Arc<ScriptedRealmFactory>,
        connection: Arc<BufferedConnection>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                page: InMemoryPage::with_document("https://example.test/"),
                realms: Arc::new(ScriptedRealmFactory::new()),
                connection: Arc::new(BufferedConnection::new()),
            }
        }

        fn instrumenter(&self, source: &str, config: DirectorConfig) -> Arc<InstrumenterActor> {
            let attachment = Attachment {
                page: self.page.clone(),
                navigation: self.page.clone(),
                realms: self.realms.clone(),
                connection: self.connection.clone(),
            };
            InstrumenterActor::new(
                "tracer".into(),
                source.into(),
                json!({ "level": 1 }),
                attachment,
                Arc::new(config),
            )
        }
    }

    #[test]
    fn test_second_activation_rejected_without_leak() {
        let fixture = Fixture::new();
        fixture.realms.define("noop", |_scope| Ok(()));
        let actor = fixture.instrumenter("noop", DirectorConfig::default());

        actor.activate(false).unwrap();
        let err = actor.activate(false).unwrap_err();
        assert!(matches!(err, InstrumenterError::AlreadyActive(_)));
        assert_eq!(fixture.realms.live_realms(), 1);
        assert_eq!(fixture.realms.created_realms(), 1);
    }

    #[test]
    fn test_deactivate_runs_unload_then_releases() {
        let fixture = Fixture::new();
        fixture.realms.define("unload", |scope| {
            let emit = scope.function("instrumenter.emit").unwrap();
            scope.export_fn("onUnload", move |_| emit(vec![json!("bye")]));
            Ok(())
        });
        let actor = fixture.instrumenter("unload", DirectorConfig::default());

        actor.activate(false).unwrap();
        actor.deactivate(false).unwrap();
        assert!(!actor.is_active());
        assert!(!actor.is_watching());
        assert_eq!(fixture.realms.live_realms(), 0);

        let events = fixture.connection.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!({ "name": "bye", "data": null }));

        // already inactive: not an error
        actor.deactivate(false).unwrap();
    }

    #[test]
    fn test_calls_on_inactive_actor_fail_not_active() {
        let fixture = Fixture::new();
        fixture.realms.define("noop", |_scope| Ok(()));
        let actor = fixture.instrumenter("noop", DirectorConfig::default());

        assert!(matches!(
            actor.call_method("anything", &[]),
            Err(InstrumenterError::NotActive(_))
        ));
        assert!(matches!(
            actor.send_event("ping", &Value::Null),
            Err(InstrumenterError::NotActive(_))
        ));
    }

    #[test]
    fn test_missing_method_policy() {
        let fixture = Fixture::new();
        fixture.realms.define("noop", |_scope| Ok(()));

        let lenient = fixture.instrumenter("noop", DirectorConfig::default());
        lenient.activate(false).unwrap();
        assert_eq!(lenient.call_method("missing-fn", &[]).unwrap(), Value::Null);

        let strict = fixture.instrumenter(
            "noop",
            DirectorConfig {
                missing_method: MissingMethodPolicy::Error,
                ..DirectorConfig::default()
            },
        );
        strict.activate(false).unwrap();
        assert!(matches!(
            strict.call_method("missing-fn", &[]),
            Err(InstrumenterError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_call_method_surfaces_sandbox_errors() {
        let fixture = Fixture::new();
        fixture.realms.define("methods", |scope| {
            scope.export_fn("sum", |args| {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            });
            scope.export_fn("boom", |_| Err(SandboxError::Thrown("TypeError: x is undefined".into())));
            scope.export_value("answer", json!(42));
            Ok(())
        });
        let actor = fixture.instrumenter("methods", DirectorConfig::default());
        actor.activate(false).unwrap();

        assert_eq!(actor.call_method("sum", &[json!(2), json!(3)]).unwrap(), json!(5));

        match actor.call_method("boom", &[]) {
            Err(InstrumenterError::SandboxInvocation { method, detail, .. }) => {
                assert_eq!(method, "boom");
                assert!(detail.contains("TypeError"));
            }
            other => panic!("expected SandboxInvocation, got {other:?}"),
        }

        assert!(matches!(
            actor.call_method("answer", &[]),
            Err(InstrumenterError::SandboxInvocation { .. })
        ));
    }

    #[test]
    fn test_send_event_swallows_handler_errors() {
        let fixture = Fixture::new();
        fixture.realms.define("throws", |scope| {
            scope.export_fn("onEvent", |_| Err(SandboxError::Thrown("handler exploded".into())));
            Ok(())
        });
        let actor = fixture.instrumenter("throws", DirectorConfig::default());
        actor.activate(false).unwrap();

        assert!(actor.send_event("ping", &json!({ "x": 1 })).is_ok());
        assert!(actor.is_active());
    }

    #[test]
    fn test_finalize_is_idempotent_and_terminal() {
        let fixture = Fixture::new();
        fixture.realms.define("noop", |_scope| Ok(()));
        let actor = fixture.instrumenter("noop", DirectorConfig::default());
        assert_eq!(fixture.connection.registered_actors(), 1);

        actor.start_watching();
        actor.activate(false).unwrap();
        actor.finalize();
        actor.finalize();

        assert!(actor.is_destroyed());
        assert!(!actor.is_watching());
        assert_eq!(fixture.realms.live_realms(), 0);
        assert_eq!(fixture.page.listener_count(), 0);
        assert_eq!(fixture.connection.registered_actors(), 0);
        assert!(matches!(
            actor.activate(false),
            Err(InstrumenterError::Destroyed(_))
        ));
        assert!(matches!(
            actor.call_method("x", &[]),
            Err(InstrumenterError::Destroyed(_))
        ));
    }

    #[test]
    fn test_accessors_and_debug() {
        let fixture = Fixture::new();
        fixture.realms.define("methods", |scope| {
            scope.export_fn("sum", |_| Ok(json!(0)));
            scope.export_value("answer", json!(42));
            Ok(())
        });
        let actor = fixture.instrumenter("methods", DirectorConfig::default());

        assert_eq!(actor.source(), "methods");
        assert_eq!(actor.options(), &json!({ "level": 1 }));
        assert_eq!(actor.exported_names(), None);

        actor.activate(false).unwrap();
        assert_eq!(
            actor.exported_names(),
            Some(vec!["answer".to_string(), "sum".to_string()])
        );

        let debug = format!("{actor:?}");
        assert!(debug.contains("InstrumenterActor"));
        assert!(debug.contains("\"tracer\""));
        assert!(debug.contains("Active"));
    }

    #[test]
    fn test_activate_without_document_fails() {
        let fixture = Fixture {
            page: InMemoryPage::new(),
            realms: Arc::new(ScriptedRealmFactory::new()),
            connection: Arc::new(BufferedConnection::new()),
        };
        fixture.realms.define("noop", |_scope| Ok(()));
        let actor = fixture.instrumenter("noop", DirectorConfig::default());

        assert!(matches!(
            actor.activate(false),
            Err(InstrumenterError::Page(PageError::NoWindow))
        ));
        assert_eq!(fixture.realms.created_realms(), 0);
    }
}
