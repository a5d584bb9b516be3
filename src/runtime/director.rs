//! Director actor
//!
//! One director per attached page. It is the registry and factory for
//! instrumenters, keyed by the client-supplied id, and owns their lifetime:
//! finalizing the director finalizes every instrumenter first.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{DirectorError, DirectorResult};
use super::ids::ActorId;
use super::instrumenter::{InstrumenterActor, InstrumenterForm};
use super::page::{NavigationSource, PageContext};
use super::realm::RealmFactory;
use super::transport::Connection;
use super::{DirectorConfig, DuplicateIdPolicy};

/// Actor type name on the connection
pub const DIRECTOR_TYPE: &str = "director";

/// Capabilities of the page attachment a director is bound to
#[derive(Clone)]
pub struct Attachment {
    /// The page (tab)
    pub page: Arc<dyn PageContext>,

    /// Page-context created/destroyed signals
    pub navigation: Arc<dyn NavigationSource>,

    /// Sandbox realm factory
    pub realms: Arc<dyn RealmFactory>,

    /// Connection to the remote client
    pub connection: Arc<dyn Connection>,
}

/// Marshalled reference to a director
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorForm {
    /// Actor address
    pub actor: ActorId,

    /// Number of installed instrumenters
    pub instrumenters: usize,
}

struct DirectorState {
    instrumenters: HashMap<String, Arc<InstrumenterActor>>,
    detached: bool,
}

impl DirectorState {
    /// Drop entries whose instrumenter was finalized behind the registry's back
    fn live(&mut self) -> &mut HashMap<String, Arc<InstrumenterActor>> {
        self.instrumenters
            .retain(|_, instrumenter| !instrumenter.is_destroyed());
        &mut self.instrumenters
    }
}

/// Registry and factory of instrumenters for one page
pub struct DirectorActor {
    actor_id: ActorId,
    attachment: Attachment,
    config: Arc<DirectorConfig>,
    state: Mutex<DirectorState>,
}

impl DirectorActor {
    /// Attach a director to a page and make it addressable
    pub fn new(attachment: Attachment, config: DirectorConfig) -> Self {
        let actor_id = ActorId::new();
        attachment
            .connection
            .register_actor(&actor_id, DIRECTOR_TYPE);
        tracing::info!(actor = %actor_id, "director attached");

        Self {
            actor_id,
            attachment,
            config: Arc::new(config),
            state: Mutex::new(DirectorState {
                instrumenters: HashMap::new(),
                detached: false,
            }),
        }
    }

    /// Actor address
    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Active configuration
    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    /// Whether `finalize` has run
    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Marshalled reference
    pub fn form(&self) -> DirectorForm {
        DirectorForm {
            actor: self.actor_id.clone(),
            instrumenters: self.state.lock().live().len(),
        }
    }

    /// Create and register an instrumenter
    ///
    /// A missing id is replaced by a generated one. The new instrumenter
    /// observes navigation immediately but builds no sandbox until it is
    /// activated.
    pub fn install(
        &self,
        id: Option<String>,
        source: String,
        options: Option<Value>,
    ) -> DirectorResult<Arc<InstrumenterActor>> {
        let id = id.unwrap_or_else(|| format!("instrumenter-{}", uuid::Uuid::new_v4()));

        let (instrumenter, replaced) = {
            let mut state = self.state.lock();
            if state.detached {
                return Err(DirectorError::Detached);
            }

            let exists = state.live().contains_key(&id);
            if exists && self.config.duplicate_ids == DuplicateIdPolicy::Reject {
                return Err(DirectorError::DuplicateId(id));
            }
            if let Some(limit) = self.config.max_instrumenters {
                if !exists && state.instrumenters.len() >= limit {
                    return Err(DirectorError::LimitReached(limit));
                }
            }

            let instrumenter = InstrumenterActor::new(
                id.clone(),
                source,
                options.unwrap_or(Value::Null),
                self.attachment.clone(),
                self.config.clone(),
            );
            let replaced = state.instrumenters.insert(id.clone(), instrumenter.clone());
            (instrumenter, replaced)
        };

        if let Some(previous) = replaced {
            previous.finalize();
            tracing::info!(instrumenter = %id, actor = %previous.actor_id(), "replaced");
        }

        instrumenter.start_watching();
        tracing::info!(instrumenter = %id, actor = %instrumenter.actor_id(), "installed");
        Ok(instrumenter)
    }

    /// Remove and finalize an instrumenter
    pub fn uninstall(&self, id: &str) -> DirectorResult<()> {
        let instrumenter = self
            .state
            .lock()
            .live()
            .remove(id)
            .ok_or_else(|| DirectorError::NotFound(id.to_string()))?;

        instrumenter.finalize();
        tracing::info!(instrumenter = %id, "uninstalled");
        Ok(())
    }

    /// Snapshot of the installed instrumenters, in no particular order
    pub fn list(&self) -> Vec<Arc<InstrumenterActor>> {
        self.state.lock().live().values().cloned().collect()
    }

    /// Marshalled snapshot of the installed instrumenters
    pub fn list_forms(&self) -> Vec<InstrumenterForm> {
        self.list().iter().map(|instrumenter| instrumenter.form()).collect()
    }

    /// Look up an instrumenter by id
    pub fn instrumenter(&self, id: &str) -> DirectorResult<Arc<InstrumenterActor>> {
        self.state
            .lock()
            .live()
            .get(id)
            .cloned()
            .ok_or_else(|| DirectorError::NotFound(id.to_string()))
    }

    /// Look up an instrumenter by actor address
    pub fn instrumenter_by_actor(&self, actor: &ActorId) -> Option<Arc<InstrumenterActor>> {
        self.state
            .lock()
            .live()
            .values()
            .find(|instrumenter| instrumenter.actor_id() == actor)
            .cloned()
    }

    /// `sendEvent` routed by instrumenter id
    pub fn send_event(&self, id: &str, name: &str, data: &Value) -> DirectorResult<()> {
        self.instrumenter(id)?.send_event(name, data)?;
        Ok(())
    }

    /// `callMethod` routed by instrumenter id
    pub fn call_method(&self, id: &str, name: &str, args: &[Value]) -> DirectorResult<Value> {
        Ok(self.instrumenter(id)?.call_method(name, args)?)
    }

    /// Finalize every instrumenter and stop accepting installs; idempotent
    ///
    /// The registry is emptied before any instrumenter is finalized, so
    /// teardown hooks that call back into the director see a consistent
    /// registry.
    pub fn finalize(&self) {
        let drained: Vec<Arc<InstrumenterActor>> = {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            state.detached = true;
            state.instrumenters.drain().map(|(_, instrumenter)| instrumenter).collect()
        };

        let count = drained.len();
        for instrumenter in drained {
            instrumenter.finalize();
        }
        tracing::info!(actor = %self.actor_id, instrumenters = count, "director finalized");
    }

    /// End of the page attachment: finalize and become unaddressable
    pub fn destroy(&self) {
        self.finalize();
        self.attachment
            .connection
            .unregister_actor(&self.actor_id);
    }
}

impl Drop for DirectorActor {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::BufferedConnection;
    use crate::testing::{InMemoryPage, ScriptedRealmFactory};
    use serde_json::json;

    fn director(config: DirectorConfig) -> (DirectorActor, Arc<ScriptedRealmFactory>, Arc<BufferedConnection>) {
        let page = InMemoryPage::with_document("https://example.test/");
        let realms = Arc::new(ScriptedRealmFactory::new());
        realms.define("noop", |_scope| Ok(()));
        let connection = Arc::new(BufferedConnection::new());
        let attachment = Attachment {
            page: page.clone(),
            navigation: page,
            realms: realms.clone(),
            connection: connection.clone(),
        };
        (DirectorActor::new(attachment, config), realms, connection)
    }

    #[test]
    fn test_duplicate_id_rejected_by_default() {
        let (director, _realms, _conn) = director(DirectorConfig::default());
        let first = director.install(Some("a".into()), "noop".into(), None).unwrap();

        let err = director
            .install(Some("a".into()), "noop".into(), None)
            .unwrap_err();
        assert!(matches!(err, DirectorError::DuplicateId(id) if id == "a"));
        assert!(!first.is_destroyed());
        assert_eq!(director.list().len(), 1);
    }

    #[test]
    fn test_duplicate_id_replace_finalizes_previous() {
        let (director, realms, _conn) = director(DirectorConfig {
            duplicate_ids: DuplicateIdPolicy::Replace,
            ..DirectorConfig::default()
        });
        let first = director.install(Some("a".into()), "noop".into(), None).unwrap();
        first.activate(false).unwrap();

        let second = director.install(Some("a".into()), "noop".into(), None).unwrap();
        assert!(first.is_destroyed());
        assert_eq!(realms.live_realms(), 0);
        assert_eq!(director.instrumenter("a").unwrap().actor_id(), second.actor_id());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let (director, _realms, _conn) = director(DirectorConfig::default());
        let a = director.install(None, "noop".into(), None).unwrap();
        let b = director.install(None, "noop".into(), None).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("instrumenter-"));
    }

    #[test]
    fn test_limit_reached() {
        let (director, _realms, _conn) = director(DirectorConfig {
            max_instrumenters: Some(1),
            ..DirectorConfig::default()
        });
        director.install(Some("a".into()), "noop".into(), None).unwrap();
        assert!(matches!(
            director.install(Some("b".into()), "noop".into(), None),
            Err(DirectorError::LimitReached(1))
        ));
    }

    #[test]
    fn test_uninstall_unknown_is_not_found() {
        let (director, _realms, _conn) = director(DirectorConfig::default());
        assert!(matches!(
            director.uninstall("ghost"),
            Err(DirectorError::NotFound(id)) if id == "ghost"
        ));
    }

    #[test]
    fn test_finalize_cascades_and_detaches() {
        let (director, realms, conn) = director(DirectorConfig::default());
        let a = director.install(Some("a".into()), "noop".into(), Some(json!({}))).unwrap();
        let b = director.install(Some("b".into()), "noop".into(), None).unwrap();
        a.activate(false).unwrap();
        assert_eq!(conn.registered_actors(), 3);

        director.finalize();
        assert!(a.is_destroyed() && b.is_destroyed());
        assert_eq!(realms.live_realms(), 0);
        assert!(director.list().is_empty());
        assert!(matches!(
            director.install(None, "noop".into(), None),
            Err(DirectorError::Detached)
        ));

        director.destroy();
        assert_eq!(conn.registered_actors(), 0);
    }

    #[test]
    fn test_directly_finalized_instrumenter_leaves_registry() {
        let (director, _realms, _conn) = director(DirectorConfig::default());
        let a = director.install(Some("a".into()), "noop".into(), None).unwrap();
        a.finalize();

        assert!(director.list().is_empty());
        assert!(matches!(director.instrumenter("a"), Err(DirectorError::NotFound(_))));
        // the id is free again
        director.install(Some("a".into()), "noop".into(), None).unwrap();
    }

    #[test]
    fn test_form_counts_instrumenters() {
        let (director, _realms, _conn) = director(DirectorConfig::default());
        director.install(Some("a".into()), "noop".into(), None).unwrap();
        let form = director.form();
        assert_eq!(form.instrumenters, 1);
        assert_eq!(&form.actor, director.actor_id());
        assert_eq!(director.config(), &DirectorConfig::default());
    }
}
