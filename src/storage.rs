use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StorageError;
use crate::types::{
    AppOption, EventDefinition, EventInstance, EventInstanceId, EventInstanceStatus,
    EventInstanceStatusBrief, EventListenerBinding, ListenerDefinition, ListenerInstance, ListenerInstanceId, ListenerType,
};

/// Read access to the configuration entities.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn read_app_options(&self) -> Result<Vec<AppOption>, StorageError>;
    async fn read_event_definitions(&self) -> Result<Vec<EventDefinition>, StorageError>;
    async fn read_listener_types(&self) -> Result<Vec<ListenerType>, StorageError>;
    async fn read_listener_definitions(&self) -> Result<Vec<ListenerDefinition>, StorageError>;
    async fn read_bindings(&self) -> Result<Vec<EventListenerBinding>, StorageError>;
}

/// Which event instances to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventInstanceFilter {
    /// Non-terminal instances of `group_id` that have work due at
    /// `run_date`: at least one active listener instance with
    /// `next_run <= run_date`, or no active listener instance at all (the
    /// aggregate still has to be stored) unless the event is on `Hold`.
    /// Only the due listener instances are attached.
    NotProcessed {
        run_date: DateTime<Utc>,
        group_id: u32,
    },
}

/// Which listener instances to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerInstanceFilter {
    /// Every listener instance of the event, in creation order.
    ByEventInstance(EventInstanceId),
}

/// Unit of work covering the creation of one event instance and its
/// listener instances. Dropping without `commit` discards everything.
#[async_trait]
pub trait InstanceTransaction: Send {
    /// Stage `instance`; the returned copy carries the assigned id.
    async fn create_event_instance(
        &mut self,
        instance: &EventInstance,
    ) -> Result<EventInstance, StorageError>;

    async fn create_listener_instance(
        &mut self,
        instance: &ListenerInstance,
    ) -> Result<ListenerInstance, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Persistence of event and listener instances.
///
/// Edits outside a transaction are independent writes.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn InstanceTransaction>, StorageError>;

    /// Persist status, group and audit fields. Listener instances attached
    /// to `instance` are ignored.
    async fn edit_event_instance(&self, instance: &EventInstance) -> Result<(), StorageError>;

    async fn edit_listener_instance(&self, instance: &ListenerInstance) -> Result<(), StorageError>;

    /// Delete an event instance and its listener instances.
    async fn remove_event_instance(&self, id: EventInstanceId) -> Result<(), StorageError>;

    async fn remove_listener_instance(&self, id: ListenerInstanceId) -> Result<(), StorageError>;

    async fn read_event_instances(
        &self,
        filter: &EventInstanceFilter,
    ) -> Result<Vec<EventInstance>, StorageError>;

    async fn read_listener_instances(
        &self,
        filter: &ListenerInstanceFilter,
    ) -> Result<Vec<ListenerInstance>, StorageError>;

    async fn read_status_by_business_id(
        &self,
        business_id: Uuid,
    ) -> Result<Option<EventInstanceStatusBrief>, StorageError>;
}

#[derive(Default)]
struct Tables {
    app_options: Vec<AppOption>,
    event_definitions: Vec<EventDefinition>,
    listener_types: Vec<ListenerType>,
    listener_definitions: Vec<ListenerDefinition>,
    bindings: Vec<EventListenerBinding>,
    event_instances: Vec<EventInstance>,
    listener_instances: Vec<ListenerInstance>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    next_event_id: AtomicI64,
    next_listener_id: AtomicI64,
}

/// In-memory backend for tests and embedded use.
///
/// Configuration entities are added with the `seed_*` methods.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    shared: Arc<Shared>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_app_option(&self, option: AppOption) {
        self.shared.tables.lock().await.app_options.push(option);
    }

    pub async fn seed_event_definition(&self, definition: EventDefinition) {
        self.shared.tables.lock().await.event_definitions.push(definition);
    }

    pub async fn seed_listener_type(&self, listener_type: ListenerType) {
        self.shared.tables.lock().await.listener_types.push(listener_type);
    }

    pub async fn seed_listener_definition(&self, definition: ListenerDefinition) {
        self.shared.tables.lock().await.listener_definitions.push(definition);
    }

    /// Insert a binding, replacing any stored binding with the same id.
    pub async fn seed_binding(&self, binding: EventListenerBinding) {
        let mut tables = self.shared.tables.lock().await;
        match tables.bindings.iter_mut().find(|b| b.id == binding.id) {
            Some(existing) => *existing = binding,
            None => tables.bindings.push(binding),
        }
    }

    /// Stored event instances, without their listener instances.
    pub async fn event_instances(&self) -> Vec<EventInstance> {
        self.shared.tables.lock().await.event_instances.clone()
    }

    pub async fn listener_instances(&self) -> Vec<ListenerInstance> {
        self.shared.tables.lock().await.listener_instances.clone()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStorage {
    async fn read_app_options(&self) -> Result<Vec<AppOption>, StorageError> {
        Ok(self.shared.tables.lock().await.app_options.clone())
    }

    async fn read_event_definitions(&self) -> Result<Vec<EventDefinition>, StorageError> {
        Ok(self.shared.tables.lock().await.event_definitions.clone())
    }

    async fn read_listener_types(&self) -> Result<Vec<ListenerType>, StorageError> {
        Ok(self.shared.tables.lock().await.listener_types.clone())
    }

    async fn read_listener_definitions(&self) -> Result<Vec<ListenerDefinition>, StorageError> {
        Ok(self.shared.tables.lock().await.listener_definitions.clone())
    }

    async fn read_bindings(&self) -> Result<Vec<EventListenerBinding>, StorageError> {
        Ok(self.shared.tables.lock().await.bindings.clone())
    }
}

struct InMemoryTransaction {
    shared: Arc<Shared>,
    events: Vec<EventInstance>,
    listeners: Vec<ListenerInstance>,
}

#[async_trait]
impl InstanceTransaction for InMemoryTransaction {
    async fn create_event_instance(
        &mut self,
        instance: &EventInstance,
    ) -> Result<EventInstance, StorageError> {
        let mut row = instance.clone();
        row.id = EventInstanceId(self.shared.next_event_id.fetch_add(1, Ordering::SeqCst) + 1);
        row.listener_instances.clear();
        self.events.push(row.clone());
        Ok(row)
    }

    async fn create_listener_instance(
        &mut self,
        instance: &ListenerInstance,
    ) -> Result<ListenerInstance, StorageError> {
        if !self.events.iter().any(|e| e.id == instance.event_instance_id) {
            return Err(StorageError::Conflict(format!(
                "event instance {} not created in this transaction",
                instance.event_instance_id
            )));
        }
        let mut row = instance.clone();
        row.id = ListenerInstanceId(self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.listeners.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut tables = self.shared.tables.lock().await;
        tables.event_instances.extend(self.events);
        tables.listener_instances.extend(self.listeners);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for InMemoryStorage {
    async fn begin(&self) -> Result<Box<dyn InstanceTransaction>, StorageError> {
        Ok(Box::new(InMemoryTransaction {
            shared: self.shared.clone(),
            events: Vec::new(),
            listeners: Vec::new(),
        }))
    }

    async fn edit_event_instance(&self, instance: &EventInstance) -> Result<(), StorageError> {
        let mut tables = self.shared.tables.lock().await;
        let row = tables
            .event_instances
            .iter_mut()
            .find(|e| e.id == instance.id)
            .ok_or_else(|| StorageError::NotFound(format!("event instance {}", instance.id)))?;
        row.status = instance.status;
        row.group_id = instance.group_id;
        row.audit = instance.audit.clone();
        Ok(())
    }

    async fn edit_listener_instance(&self, instance: &ListenerInstance) -> Result<(), StorageError> {
        let mut tables = self.shared.tables.lock().await;
        let row = tables
            .listener_instances
            .iter_mut()
            .find(|l| l.id == instance.id)
            .ok_or_else(|| StorageError::NotFound(format!("listener instance {}", instance.id)))?;
        *row = instance.clone();
        Ok(())
    }

    async fn remove_event_instance(&self, id: EventInstanceId) -> Result<(), StorageError> {
        let mut tables = self.shared.tables.lock().await;
        let before = tables.event_instances.len();
        tables.event_instances.retain(|e| e.id != id);
        if tables.event_instances.len() == before {
            return Err(StorageError::NotFound(format!("event instance {}", id)));
        }
        tables.listener_instances.retain(|l| l.event_instance_id != id);
        Ok(())
    }

    async fn remove_listener_instance(&self, id: ListenerInstanceId) -> Result<(), StorageError> {
        let mut tables = self.shared.tables.lock().await;
        let before = tables.listener_instances.len();
        tables.listener_instances.retain(|l| l.id != id);
        if tables.listener_instances.len() == before {
            return Err(StorageError::NotFound(format!("listener instance {}", id)));
        }
        Ok(())
    }

    async fn read_event_instances(
        &self,
        filter: &EventInstanceFilter,
    ) -> Result<Vec<EventInstance>, StorageError> {
        let guard = self.shared.tables.lock().await;
        let tables: &Tables = &guard;
        let listeners_of = |id: EventInstanceId| {
            tables
                .listener_instances
                .iter()
                .filter(move |l| l.event_instance_id == id)
        };

        let rows: Vec<EventInstance> = match filter {
            EventInstanceFilter::NotProcessed { run_date, group_id } => tables
                .event_instances
                .iter()
                .filter(|e| e.group_id == *group_id && !e.status.is_end_state())
                .filter_map(|e| {
                    let active: Vec<&ListenerInstance> =
                        listeners_of(e.id).filter(|l| l.status.is_active()).collect();
                    let due: Vec<ListenerInstance> = active
                        .iter()
                        .filter(|l| l.next_run <= *run_date)
                        .map(|l| (*l).clone())
                        .collect();
                    let settled = active.is_empty() && e.status != EventInstanceStatus::Hold;
                    if due.is_empty() && !settled {
                        return None;
                    }
                    let mut event = e.clone();
                    event.listener_instances = due;
                    Some(event)
                })
                .collect(),
        };
        Ok(rows)
    }

    async fn read_listener_instances(
        &self,
        filter: &ListenerInstanceFilter,
    ) -> Result<Vec<ListenerInstance>, StorageError> {
        let tables = self.shared.tables.lock().await;
        match filter {
            ListenerInstanceFilter::ByEventInstance(id) => Ok(tables
                .listener_instances
                .iter()
                .filter(|l| l.event_instance_id == *id)
                .cloned()
                .collect()),
        }
    }

    async fn read_status_by_business_id(
        &self,
        business_id: Uuid,
    ) -> Result<Option<EventInstanceStatusBrief>, StorageError> {
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .event_instances
            .iter()
            .find(|e| e.business_id == business_id)
            .map(|e| EventInstanceStatusBrief {
                id: e.id,
                business_id: e.business_id,
                status: e.status,
            }))
    }
}
