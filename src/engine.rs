use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::RwLockReadGuard;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::definitions::{BoundListener, DefinitionRegistry, Definitions};
use crate::env::{EnvLookup, ProcessEnv};
use crate::error::{EngineError, StorageError};
use crate::log;
use crate::plugin::ListenerResult;
use crate::resolver::PluginResolver;
use crate::shard::ShardAssigner;
use crate::storage::{
    DefinitionStore, EventInstanceFilter, InstanceStore, InstanceTransaction,
    ListenerInstanceFilter,
};
use crate::types::{
    Audit, DueEvent, DueListener, EventDefinition, EventInstance, EventInstanceStatus,
    EventInstanceStatusBrief, ListenerInstance, ListenerInstanceId, ListenerInstanceStatus,
    USER_EVENT_MANAGER, USER_PROCESSOR,
};

/// Key under which event metadata is merged into the outbound payload.
pub const METADATA_KEY: &str = "simpleHooksMetadata";

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventMetadata<'a> {
    event_definition_id: i64,
    event_definition_name: &'a str,
    event_business_id: Uuid,
    event_create_date: DateTime<Utc>,
    event_reference_name: &'a str,
    event_reference_value: &'a str,
}

/// Counts from one [`DispatchEngine::process`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
}

/// Creates event instances, fans them out to listeners and drives every
/// listener instance through its retry state machine.
///
/// Work inside one call runs sequentially. Run several engines, each
/// polling its own shard, to scale out.
pub struct DispatchEngine {
    correlation: Uuid,
    config: EngineConfig,
    definitions: DefinitionRegistry,
    instances: Arc<dyn InstanceStore>,
    env: Arc<dyn EnvLookup>,
    shards: Arc<ShardAssigner>,
}

impl DispatchEngine {
    /// Build an engine and load definitions.
    ///
    /// Fails when the initial load fails; nothing can be dispatched
    /// without configuration.
    pub async fn new(
        config: EngineConfig,
        definition_store: Arc<dyn DefinitionStore>,
        instance_store: Arc<dyn InstanceStore>,
        resolver: Arc<PluginResolver>,
    ) -> Result<Self, EngineError> {
        let correlation = Uuid::new_v4();
        let shards = Arc::new(ShardAssigner::default());

        let mut definitions = DefinitionRegistry::new(definition_store, resolver);
        let hook_shards = shards.clone();
        let category = config.max_groups_category.clone();
        let name = config.max_groups_name.clone();
        definitions.on_loaded(move |defs| {
            let raw = defs.app_option(&category, &name);
            let max = ShardAssigner::parse_max(raw).unwrap_or_else(|| {
                tracing::warn!(
                    correlation = %correlation,
                    category = %category,
                    name = %name,
                    value = raw.unwrap_or_default(),
                    "invalid shard count option, using one shard"
                );
                1
            });
            hook_shards.set_max(max);
            tracing::debug!(correlation = %correlation, max_groups = max, "shard count updated");
        });

        definitions.load_definitions().await.map_err(|err| {
            tracing::error!(correlation = %correlation, error = %err, "initial definitions load failed");
            EngineError::DefinitionsLoad(err)
        })?;

        Ok(Self {
            correlation,
            config,
            definitions,
            instances: instance_store,
            env: Arc::new(ProcessEnv),
            shards,
        })
    }

    /// Resolve plugin options through `env` instead of the process
    /// environment.
    pub fn with_env(mut self, env: Arc<dyn EnvLookup>) -> Self {
        self.env = env;
        self
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shards(&self) -> &ShardAssigner {
        &self.shards
    }

    pub async fn definitions(&self) -> RwLockReadGuard<'_, Definitions> {
        self.definitions.read().await
    }

    /// Reload definitions; `false` leaves the registry partially stale.
    pub async fn load_definitions(&self) -> bool {
        match self.definitions.load_definitions().await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(correlation = %self.correlation, error = %err, "definitions load failed");
                false
            }
        }
    }

    /// Persist a new event instance with one listener instance per active
    /// binding of its definition.
    ///
    /// Returns `None` when nothing was stored.
    pub async fn add(&self, mut instance: EventInstance) -> Option<EventInstance> {
        instance.group_id = self.shards.next();
        instance.listener_instances.clear();
        let listeners = self.fan_out(&instance).await;

        match self.create(&instance, listeners).await {
            Ok(created) => {
                metric_inc("hooks.event.added");
                tracing::info!(
                    correlation = %self.correlation,
                    event_instance = %created.id,
                    business_id = %created.business_id,
                    group_id = created.group_id,
                    listeners = created.listener_instances.len(),
                    "event instance added"
                );
                Some(created)
            }
            Err(err) => {
                metric_inc("hooks.event.add_failed");
                tracing::error!(
                    correlation = %self.correlation,
                    business_id = %instance.business_id,
                    error = %err,
                    "failed to add event instance"
                );
                None
            }
        }
    }

    async fn fan_out(&self, instance: &EventInstance) -> Vec<ListenerInstance> {
        let defs = self.definitions.read().await;
        let now = Utc::now();

        defs.active_bindings(instance.event_definition_id)
            .filter_map(|binding| {
                let Some(bound) = defs.bound_listener(binding.listener_definition_id) else {
                    tracing::warn!(
                        correlation = %self.correlation,
                        binding = binding.id,
                        listener_definition = binding.listener_definition_id.0,
                        "binding references an unknown listener definition"
                    );
                    return None;
                };
                Some(ListenerInstance {
                    id: ListenerInstanceId::default(),
                    event_instance_id: instance.id,
                    listener_definition_id: bound.definition.id,
                    status: ListenerInstanceStatus::InQueue,
                    remaining_trial_count: bound.definition.trial_count,
                    next_run: now,
                    audit: Audit::new(USER_EVENT_MANAGER),
                })
            })
            .collect()
    }

    async fn create(
        &self,
        instance: &EventInstance,
        listeners: Vec<ListenerInstance>,
    ) -> Result<EventInstance, StorageError> {
        let mut tx = self.instances.begin().await?;
        match create_rows(tx.as_mut(), instance, listeners).await {
            Ok(created) => {
                tx.commit().await?;
                Ok(created)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(correlation = %self.correlation, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Event instances of `group_id` with work due at `run_date`, paired
    /// with their definitions from memory. Empty on read failure.
    pub async fn get_due(&self, run_date: DateTime<Utc>, group_id: u32) -> Vec<DueEvent> {
        let filter = EventInstanceFilter::NotProcessed { run_date, group_id };
        let rows = match self.instances.read_event_instances(&filter).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(
                    correlation = %self.correlation,
                    group_id,
                    error = %err,
                    "failed to read due event instances"
                );
                return Vec::new();
            }
        };

        let defs = self.definitions.read().await;
        rows.into_iter()
            .map(|mut instance| {
                let listeners = std::mem::take(&mut instance.listener_instances)
                    .into_iter()
                    .map(|listener| DueListener {
                        bound: defs.bound_listener(listener.listener_definition_id),
                        instance: listener,
                    })
                    .collect();
                DueEvent {
                    definition: defs.event_definition(instance.event_definition_id).cloned(),
                    instance,
                    listeners,
                }
            })
            .collect()
    }

    /// Process every event; a failure in one does not stop the others.
    pub async fn process(&self, events: Vec<DueEvent>) -> BatchReport {
        let mut report = BatchReport::default();

        for event in events {
            let id = event.instance.id;
            let outcome = AssertUnwindSafe(self.process_one(event)).catch_unwind().await;

            let failure = match outcome {
                Ok(Ok(_)) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(format!("panicked: {}", panic_message(&*panic))),
            };

            match failure {
                None => report.processed += 1,
                Some(reason) => {
                    metric_inc("hooks.process.error");
                    report.failed += 1;
                    tracing::error!(
                        correlation = %self.correlation,
                        event_instance = %id,
                        error = %reason,
                        "event instance processing failed"
                    );
                }
            }
        }

        report
    }

    /// Execute every attached listener instance, then recompute and store
    /// the event's aggregate status.
    ///
    /// Status writes are independent and best effort. The error case is a
    /// failed re-read of the listener instances, which leaves the aggregate
    /// status unknown.
    pub async fn process_one(&self, event: DueEvent) -> Result<EventInstance, EngineError> {
        let DueEvent {
            mut instance,
            definition,
            listeners,
        } = event;

        instance.status = EventInstanceStatus::Processing;
        instance.audit.touch(USER_PROCESSOR);
        if let Err(err) = self.instances.edit_event_instance(&instance).await {
            tracing::warn!(
                correlation = %self.correlation,
                event_instance = %instance.id,
                error = %err,
                "failed to mark event instance processing"
            );
        }

        let payload = self.payload(&instance, definition.as_ref());

        for listener in listeners {
            self.execute_listener(listener, &payload).await;
        }

        instance.listener_instances = self
            .instances
            .read_listener_instances(&ListenerInstanceFilter::ByEventInstance(instance.id))
            .await?;

        instance.status = aggregate_status(&instance.listener_instances);
        instance.audit.touch(USER_PROCESSOR);
        if let Err(err) = self.instances.edit_event_instance(&instance).await {
            tracing::error!(
                correlation = %self.correlation,
                event_instance = %instance.id,
                status = ?instance.status,
                error = %err,
                "failed to store aggregate status"
            );
        } else {
            tracing::info!(
                correlation = %self.correlation,
                event_instance = %instance.id,
                status = ?instance.status,
                "event instance processed"
            );
        }

        Ok(instance)
    }

    fn payload(&self, instance: &EventInstance, definition: Option<&EventDefinition>) -> String {
        match with_metadata(instance, definition) {
            Ok(payload) => payload,
            Err(reason) => {
                tracing::error!(
                    correlation = %self.correlation,
                    event_instance = %instance.id,
                    error = %reason,
                    "event data is not a JSON object, sending it unchanged"
                );
                instance.event_data.clone()
            }
        }
    }

    /// Run one delivery attempt and store the resulting listener state.
    ///
    /// The attempt is consumed before the call. If that write fails the
    /// call is skipped and the instance is returned as last read.
    pub async fn execute_listener(&self, listener: DueListener, payload: &str) -> ListenerInstance {
        let DueListener {
            mut instance,
            bound,
        } = listener;

        let before = instance.clone();
        instance.remaining_trial_count -= 1;
        instance.status = ListenerInstanceStatus::Processing;
        instance.audit.touch(USER_PROCESSOR);
        if let Err(err) = self.instances.edit_listener_instance(&instance).await {
            tracing::error!(
                correlation = %self.correlation,
                listener_instance = %instance.id,
                error = %err,
                "failed to start listener execution, skipping"
            );
            return before;
        }

        let result = self.invoke(bound.as_deref(), &instance, payload).await;
        log::forward(&result.logs, self.correlation);

        instance.audit.touch(USER_PROCESSOR);
        if result.succeeded {
            metric_inc("hooks.listener.succeeded");
            instance.status = ListenerInstanceStatus::Succeeded;
        } else if instance.remaining_trial_count <= 0 {
            metric_inc("hooks.listener.failed");
            instance.status = ListenerInstanceStatus::Failed;
        } else {
            metric_inc("hooks.listener.retry_scheduled");
            let delay = bound
                .as_ref()
                .map(|b| b.definition.retrial_delay_minutes)
                .unwrap_or(0);
            instance.status = ListenerInstanceStatus::WaitingForRetrial;
            instance.next_run = instance.audit.modify_date + Duration::minutes(i64::from(delay));
        }

        tracing::info!(
            correlation = %self.correlation,
            listener_instance = %instance.id,
            status = ?instance.status,
            remaining_trials = instance.remaining_trial_count,
            message = %result.message,
            "listener executed"
        );

        if let Err(err) = self.instances.edit_listener_instance(&instance).await {
            tracing::error!(
                correlation = %self.correlation,
                listener_instance = %instance.id,
                status = ?instance.status,
                error = %err,
                "failed to store listener outcome"
            );
        }

        instance
    }

    async fn invoke(
        &self,
        bound: Option<&BoundListener>,
        instance: &ListenerInstance,
        payload: &str,
    ) -> ListenerResult {
        let Some(bound) = bound else {
            return ListenerResult::failure(
                format!(
                    "listener definition {} is not loaded",
                    instance.listener_definition_id.0
                ),
                Vec::new(),
            );
        };
        let Some(plugin) = bound.plugin.clone() else {
            return ListenerResult::failure(
                format!(
                    "no plugin available for listener definition {}",
                    bound.definition.id.0
                ),
                Vec::new(),
            );
        };

        let key = bound.type_options_key();
        let options = if key.is_empty() {
            String::new()
        } else {
            self.env.get(key).unwrap_or_default()
        };

        match AssertUnwindSafe(plugin.execute(instance.id, payload, &options))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => ListenerResult::failure(
                format!("listener panicked: {}", panic_message(&*panic)),
                Vec::new(),
            ),
        }
    }

    /// Brief status of the event with `business_id`, or `None` if absent
    /// or unreadable.
    pub async fn read_status_by_business_id(
        &self,
        business_id: Uuid,
    ) -> Option<EventInstanceStatusBrief> {
        match self.instances.read_status_by_business_id(business_id).await {
            Ok(brief) => brief,
            Err(err) => {
                tracing::error!(
                    correlation = %self.correlation,
                    business_id = %business_id,
                    error = %err,
                    "failed to read event status"
                );
                None
            }
        }
    }
}

async fn create_rows(
    tx: &mut dyn InstanceTransaction,
    instance: &EventInstance,
    listeners: Vec<ListenerInstance>,
) -> Result<EventInstance, StorageError> {
    let mut created = tx.create_event_instance(instance).await?;
    for mut listener in listeners {
        listener.event_instance_id = created.id;
        let listener = tx.create_listener_instance(&listener).await?;
        created.listener_instances.push(listener);
    }
    Ok(created)
}

/// Aggregate status of an event from its listener instances.
///
/// First match wins: no listeners is Succeeded; any active listener is
/// Processing; then Failed, Aborted, Hold; otherwise Succeeded.
pub fn aggregate_status(listeners: &[ListenerInstance]) -> EventInstanceStatus {
    if listeners.is_empty() {
        return EventInstanceStatus::Succeeded;
    }
    let any = |status: ListenerInstanceStatus| listeners.iter().any(|l| l.status == status);

    if listeners.iter().any(|l| l.status.is_active()) {
        EventInstanceStatus::Processing
    } else if any(ListenerInstanceStatus::Failed) {
        EventInstanceStatus::Failed
    } else if any(ListenerInstanceStatus::Aborted) {
        EventInstanceStatus::Aborted
    } else if any(ListenerInstanceStatus::Hold) {
        EventInstanceStatus::Hold
    } else {
        EventInstanceStatus::Succeeded
    }
}

/// Merge event metadata into the payload object under [`METADATA_KEY`].
fn with_metadata(
    instance: &EventInstance,
    definition: Option<&EventDefinition>,
) -> Result<String, String> {
    let mut body = match serde_json::from_str::<serde_json::Value>(&instance.event_data) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => return Err("payload is not an object".to_string()),
        Err(err) => return Err(err.to_string()),
    };

    let metadata = EventMetadata {
        event_definition_id: instance.event_definition_id.0,
        event_definition_name: definition.map(|d| d.name.as_str()).unwrap_or_default(),
        event_business_id: instance.business_id,
        event_create_date: instance.audit.create_date,
        event_reference_name: &instance.reference_name,
        event_reference_value: &instance.reference_value,
    };
    let metadata = serde_json::to_value(metadata).map_err(|err| err.to_string())?;
    body.insert(METADATA_KEY.to_string(), metadata);

    serde_json::to_string(&body).map_err(|err| err.to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
