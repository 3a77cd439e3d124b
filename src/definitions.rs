use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};

use crate::error::{DefinitionError, PluginError, StorageError};
use crate::plugin::Listener;
use crate::resolver::PluginResolver;
use crate::storage::DefinitionStore;
use crate::types::{
    AppOption, EventDefinition, EventDefinitionId, EventListenerBinding, ListenerDefinition,
    ListenerDefinitionId, ListenerType, ListenerTypeId,
};

/// A listener definition together with its type and wired plugin.
pub struct BoundListener {
    pub definition: ListenerDefinition,

    /// `None` when the referenced type was not loaded.
    pub listener_type: Option<ListenerType>,

    /// `None` when the type is missing or the plugin failed to build.
    pub plugin: Option<Arc<dyn Listener>>,
}

impl BoundListener {
    /// Environment key holding this listener's plugin options.
    pub fn type_options_key(&self) -> &str {
        self.listener_type
            .as_ref()
            .map(|t| t.type_options.as_str())
            .unwrap_or_default()
    }
}

impl fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundListener")
            .field("definition", &self.definition.id)
            .field("listener_type", &self.listener_type.as_ref().map(|t| t.id))
            .field("plugin", &self.plugin.is_some())
            .finish()
    }
}

/// In-memory copy of the configuration entities.
#[derive(Debug, Default)]
pub struct Definitions {
    pub app_options: Vec<AppOption>,
    pub event_definitions: Vec<EventDefinition>,
    pub listener_types: Vec<ListenerType>,
    pub listener_definitions: Vec<ListenerDefinition>,
    pub bindings: Vec<EventListenerBinding>,

    bound: HashMap<ListenerDefinitionId, Arc<BoundListener>>,
    wiring_errors: Vec<DefinitionError>,
}

impl Definitions {
    pub fn app_option(&self, category: &str, name: &str) -> Option<&str> {
        self.app_options
            .iter()
            .find(|o| o.audit.active && o.category == category && o.name == name)
            .map(|o| o.value.as_str())
    }

    pub fn event_definition(&self, id: EventDefinitionId) -> Option<&EventDefinition> {
        self.event_definitions.iter().find(|d| d.id == id)
    }

    pub fn listener_type(&self, id: ListenerTypeId) -> Option<&ListenerType> {
        self.listener_types.iter().find(|t| t.id == id)
    }

    pub fn bound_listener(&self, id: ListenerDefinitionId) -> Option<Arc<BoundListener>> {
        self.bound.get(&id).cloned()
    }

    /// Active bindings of `event_definition_id`, in load order.
    pub fn active_bindings(
        &self,
        event_definition_id: EventDefinitionId,
    ) -> impl Iterator<Item = &EventListenerBinding> {
        self.bindings
            .iter()
            .filter(move |b| b.audit.active && b.event_definition_id == event_definition_id)
    }

    /// Problems found during the last plugin wiring.
    pub fn wiring_errors(&self) -> &[DefinitionError] {
        &self.wiring_errors
    }

    fn wire(&mut self, resolver: &PluginResolver) {
        let mut bound = HashMap::with_capacity(self.listener_definitions.len());
        let mut errors = Vec::new();

        for definition in &self.listener_definitions {
            let listener_type = self.listener_type(definition.listener_type_id).cloned();

            let plugin = match &listener_type {
                None => {
                    errors.push(DefinitionError::ListenerTypeNotFound {
                        listener_definition_id: definition.id,
                        listener_type_id: definition.listener_type_id,
                    });
                    None
                }
                Some(listener_type) => match instantiate(resolver, listener_type, definition) {
                    Ok(plugin) => Some(plugin),
                    Err(source) => {
                        errors.push(DefinitionError::Plugin {
                            listener_definition_id: definition.id,
                            source,
                        });
                        None
                    }
                },
            };

            bound.insert(
                definition.id,
                Arc::new(BoundListener {
                    definition: definition.clone(),
                    listener_type,
                    plugin,
                }),
            );
        }

        for err in &errors {
            tracing::warn!(error = %err, "listener definition skipped");
        }
        self.bound = bound;
        self.wiring_errors = errors;
    }
}

fn instantiate(
    resolver: &PluginResolver,
    listener_type: &ListenerType,
    definition: &ListenerDefinition,
) -> Result<Arc<dyn Listener>, PluginError> {
    let built = catch_unwind(AssertUnwindSafe(|| {
        resolver.create_instance(
            &listener_type.location,
            &definition.url,
            definition.timeout_minutes,
            &definition.headers,
        )
    }));

    match built {
        Ok(result) => result.map(Arc::from),
        Err(_) => Err(PluginError::Instantiation {
            location: listener_type.location.clone(),
            reason: "constructor panicked".to_string(),
        }),
    }
}

type LoadedHook = Box<dyn Fn(&Definitions) + Send + Sync>;

/// Holds the configuration entities in memory and wires plugins onto
/// listener definitions.
pub struct DefinitionRegistry {
    store: Arc<dyn DefinitionStore>,
    resolver: Arc<PluginResolver>,
    state: RwLock<Definitions>,
    hooks: Vec<LoadedHook>,
}

impl DefinitionRegistry {
    pub fn new(store: Arc<dyn DefinitionStore>, resolver: Arc<PluginResolver>) -> Self {
        Self {
            store,
            resolver,
            state: RwLock::new(Definitions::default()),
            hooks: Vec::new(),
        }
    }

    /// Run `hook` after every successful load.
    pub fn on_loaded<F>(&mut self, hook: F)
    where
        F: Fn(&Definitions) + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Reload every entity set from the store.
    ///
    /// Each set is replaced as soon as it is read, listener types before
    /// listener definitions. On error the sets read so far stay replaced,
    /// the rest keep their previous contents and no wiring happens: treat
    /// the registry as stale and load again.
    pub async fn load_definitions(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().await;

        state.app_options = self.store.read_app_options().await?;
        state.event_definitions = self.store.read_event_definitions().await?;
        state.listener_types = self.store.read_listener_types().await?;
        state.listener_definitions = self.store.read_listener_definitions().await?;
        state.bindings = self.store.read_bindings().await?;

        state.wire(&self.resolver);

        tracing::info!(
            app_options = state.app_options.len(),
            event_definitions = state.event_definitions.len(),
            listener_types = state.listener_types.len(),
            listener_definitions = state.listener_definitions.len(),
            bindings = state.bindings.len(),
            wiring_errors = state.wiring_errors.len(),
            "definitions loaded"
        );

        let state = state.downgrade();
        for hook in &self.hooks {
            hook(&state);
        }
        Ok(())
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Definitions> {
        self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::plugins::testing::ScriptedHttp;
    use crate::storage::InMemoryStorage;
    use crate::types::Audit;

    fn listener_type(id: i64, location: &str) -> ListenerType {
        ListenerType {
            id: ListenerTypeId(id),
            name: format!("type-{}", id),
            location: location.to_string(),
            type_options: String::new(),
            audit: Audit::default(),
        }
    }

    fn listener_definition(id: i64, type_id: i64) -> ListenerDefinition {
        ListenerDefinition {
            id: ListenerDefinitionId(id),
            name: format!("listener-{}", id),
            url: format!("https://hooks.example.com/{}", id),
            headers: vec![],
            timeout_minutes: 1,
            trial_count: 3,
            retrial_delay_minutes: 1,
            listener_type_id: ListenerTypeId(type_id),
            audit: Audit::default(),
        }
    }

    async fn registry(store: InMemoryStorage) -> DefinitionRegistry {
        let resolver = PluginResolver::with_builtins(Arc::new(ScriptedHttp::new(vec![])));
        DefinitionRegistry::new(Arc::new(store), Arc::new(resolver))
    }

    #[tokio::test]
    async fn unknown_type_and_bad_location_are_skipped() {
        let store = InMemoryStorage::new();
        store.seed_listener_type(listener_type(1, "plugins/anonymous")).await;
        store.seed_listener_type(listener_type(2, "plugins/nowhere")).await;
        store.seed_listener_definition(listener_definition(10, 1)).await;
        store.seed_listener_definition(listener_definition(11, 99)).await;
        store.seed_listener_definition(listener_definition(12, 2)).await;

        let registry = registry(store).await;
        registry.load_definitions().await.unwrap();

        let defs = registry.read().await;
        assert!(defs.bound_listener(ListenerDefinitionId(10)).unwrap().plugin.is_some());

        let orphan = defs.bound_listener(ListenerDefinitionId(11)).unwrap();
        assert!(orphan.listener_type.is_none());
        assert!(orphan.plugin.is_none());

        let unresolved = defs.bound_listener(ListenerDefinitionId(12)).unwrap();
        assert!(unresolved.listener_type.is_some());
        assert!(unresolved.plugin.is_none());

        assert_eq!(defs.wiring_errors().len(), 2);
        assert!(matches!(
            defs.wiring_errors()[0],
            DefinitionError::ListenerTypeNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn hooks_run_after_each_load() {
        let store = InMemoryStorage::new();
        let mut registry = registry(store).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        registry.on_loaded(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        registry.load_definitions().await.unwrap();
        registry.load_definitions().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
