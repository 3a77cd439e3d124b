#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use hook_engine::{
    AppOption, Audit, DefinitionStore, EventDefinition, EventDefinitionId, EventInstance,
    EventInstanceFilter, EventInstanceId, EventInstanceStatus, EventInstanceStatusBrief, EventListenerBinding,
    HttpClient, HttpResponse, InMemoryStorage, InstanceStore, InstanceTransaction,
    ListenerDefinition, ListenerDefinitionId, ListenerInstance, ListenerInstanceFilter,
    ListenerInstanceId, ListenerType, ListenerTypeId, StorageError, TransportError,
};

#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub headers: Vec<String>,
    pub body: String,
}

/// Answers from a queue, then with `fallback` once the queue is empty.
pub struct MockHttp {
    queue: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    fallback: u16,
    calls: Mutex<Vec<Call>>,
}

impl MockHttp {
    pub fn always(status: u16) -> Arc<Self> {
        Self::scripted(Vec::new(), status)
    }

    pub fn scripted(responses: Vec<Result<HttpResponse, TransportError>>, fallback: u16) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(responses.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttp {
    async fn post(
        &self,
        url: &str,
        headers: &[String],
        body: &str,
        _timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push(Call {
            url: url.to_string(),
            headers: headers.to_vec(),
            body: body.to_string(),
        });
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(self.fallback, "")))
    }
}

/// In-memory store with switchable failures.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: InMemoryStorage,
    pub fail_definitions: Arc<AtomicBool>,
    pub fail_listener_create: Arc<AtomicBool>,
    pub fail_listener_edit: Arc<AtomicBool>,
    pub fail_listener_reads: Arc<Mutex<HashSet<EventInstanceId>>>,
    /// Event edits that would store one of these statuses fail.
    pub fail_event_edits_to: Arc<Mutex<HashSet<EventInstanceStatus>>>,
}

impl FlakyStore {
    pub fn new(inner: InMemoryStorage) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Query(format!("injected failure: {}", what)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DefinitionStore for FlakyStore {
    async fn read_app_options(&self) -> Result<Vec<AppOption>, StorageError> {
        Self::check(&self.fail_definitions, "app options")?;
        self.inner.read_app_options().await
    }

    async fn read_event_definitions(&self) -> Result<Vec<EventDefinition>, StorageError> {
        self.inner.read_event_definitions().await
    }

    async fn read_listener_types(&self) -> Result<Vec<ListenerType>, StorageError> {
        self.inner.read_listener_types().await
    }

    async fn read_listener_definitions(&self) -> Result<Vec<ListenerDefinition>, StorageError> {
        self.inner.read_listener_definitions().await
    }

    async fn read_bindings(&self) -> Result<Vec<EventListenerBinding>, StorageError> {
        self.inner.read_bindings().await
    }
}

struct FlakyTransaction {
    inner: Box<dyn InstanceTransaction>,
    fail_listener_create: bool,
}

#[async_trait]
impl InstanceTransaction for FlakyTransaction {
    async fn create_event_instance(
        &mut self,
        instance: &EventInstance,
    ) -> Result<EventInstance, StorageError> {
        self.inner.create_event_instance(instance).await
    }

    async fn create_listener_instance(
        &mut self,
        instance: &ListenerInstance,
    ) -> Result<ListenerInstance, StorageError> {
        if self.fail_listener_create {
            return Err(StorageError::Conflict("injected failure: listener create".into()));
        }
        self.inner.create_listener_instance(instance).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl InstanceStore for FlakyStore {
    async fn begin(&self) -> Result<Box<dyn InstanceTransaction>, StorageError> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin().await?,
            fail_listener_create: self.fail_listener_create.load(Ordering::SeqCst),
        }))
    }

    async fn edit_event_instance(&self, instance: &EventInstance) -> Result<(), StorageError> {
        if self.fail_event_edits_to.lock().unwrap().contains(&instance.status) {
            return Err(StorageError::Query(format!(
                "injected failure: event edit to {:?}",
                instance.status
            )));
        }
        self.inner.edit_event_instance(instance).await
    }

    async fn edit_listener_instance(&self, instance: &ListenerInstance) -> Result<(), StorageError> {
        Self::check(&self.fail_listener_edit, "listener edit")?;
        self.inner.edit_listener_instance(instance).await
    }

    async fn remove_event_instance(&self, id: EventInstanceId) -> Result<(), StorageError> {
        self.inner.remove_event_instance(id).await
    }

    async fn remove_listener_instance(&self, id: ListenerInstanceId) -> Result<(), StorageError> {
        self.inner.remove_listener_instance(id).await
    }

    async fn read_event_instances(
        &self,
        filter: &EventInstanceFilter,
    ) -> Result<Vec<EventInstance>, StorageError> {
        self.inner.read_event_instances(filter).await
    }

    async fn read_listener_instances(
        &self,
        filter: &ListenerInstanceFilter,
    ) -> Result<Vec<ListenerInstance>, StorageError> {
        let ListenerInstanceFilter::ByEventInstance(id) = filter;
        if self.fail_listener_reads.lock().unwrap().contains(id) {
            return Err(StorageError::Connection("injected failure: listener read".into()));
        }
        self.inner.read_listener_instances(filter).await
    }

    async fn read_status_by_business_id(
        &self,
        business_id: Uuid,
    ) -> Result<Option<EventInstanceStatusBrief>, StorageError> {
        self.inner.read_status_by_business_id(business_id).await
    }
}

pub fn event_definition(id: i64, name: &str) -> EventDefinition {
    EventDefinition {
        id: EventDefinitionId(id),
        name: name.to_string(),
        audit: Audit::default(),
    }
}

pub fn listener_type(id: i64, location: &str, type_options: &str) -> ListenerType {
    ListenerType {
        id: ListenerTypeId(id),
        name: location.rsplit('/').next().unwrap_or(location).to_string(),
        location: location.to_string(),
        type_options: type_options.to_string(),
        audit: Audit::default(),
    }
}

pub fn listener_definition(id: i64, type_id: i64, trial_count: i32, delay_minutes: u32) -> ListenerDefinition {
    ListenerDefinition {
        id: ListenerDefinitionId(id),
        name: format!("listener-{}", id),
        url: format!("https://hooks.example.com/{}", id),
        headers: vec!["X-Tenant: acme".to_string()],
        timeout_minutes: 1,
        trial_count,
        retrial_delay_minutes: delay_minutes,
        listener_type_id: ListenerTypeId(type_id),
        audit: Audit::default(),
    }
}

pub fn binding(id: i64, event_id: i64, listener_id: i64, active: bool) -> EventListenerBinding {
    let mut audit = Audit::default();
    audit.active = active;
    EventListenerBinding {
        id,
        event_definition_id: EventDefinitionId(event_id),
        listener_definition_id: ListenerDefinitionId(listener_id),
        audit,
    }
}

pub fn app_option(category: &str, name: &str, value: &str) -> AppOption {
    AppOption {
        id: 1,
        category: category.to_string(),
        name: name.to_string(),
        value: value.to_string(),
        audit: Audit::default(),
    }
}
