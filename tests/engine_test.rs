mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use common::*;
use hook_engine::{
    DefinitionError, DispatchEngine, EngineConfig, EngineError, EventDefinitionId, EventInstance,
    EventInstanceStatus, HttpResponse, InMemoryStorage, Listener, ListenerDefinitionId,
    ListenerInstanceId, ListenerInstanceStatus, ListenerResult, ListenerTarget, PluginResolver,
    METADATA_KEY, USER_EVENT_MANAGER, USER_PROCESSOR,
};

async fn engine_with(store: &FlakyStore, http: Arc<MockHttp>) -> DispatchEngine {
    let resolver = Arc::new(PluginResolver::with_builtins(http));
    engine_with_resolver(store, resolver).await
}

async fn engine_with_resolver(store: &FlakyStore, resolver: Arc<PluginResolver>) -> DispatchEngine {
    let store = Arc::new(store.clone());
    DispatchEngine::new(EngineConfig::default(), store.clone(), store, resolver)
        .await
        .expect("engine starts")
}

/// One event definition bound to one anonymous listener.
async fn single_listener_store(trial_count: i32, delay_minutes: u32) -> FlakyStore {
    let storage = InMemoryStorage::new();
    storage.seed_event_definition(event_definition(1, "OrderPlaced")).await;
    storage.seed_listener_type(listener_type(1, "plugins/anonymous", "")).await;
    storage
        .seed_listener_definition(listener_definition(1, 1, trial_count, delay_minutes))
        .await;
    storage.seed_binding(binding(1, 1, 1, true)).await;
    FlakyStore::new(storage)
}

fn order_event() -> EventInstance {
    EventInstance::new(EventDefinitionId(1), r#"{"orderId":42}"#).with_reference("order", "42")
}

#[tokio::test]
async fn test_shard_round_robin() {
    let store = single_listener_store(1, 1).await;
    store
        .inner
        .seed_app_option(app_option("GetNotProcessed", "MaxGroups", "3"))
        .await;
    let engine = engine_with(&store, MockHttp::always(200)).await;

    let mut groups = Vec::new();
    for _ in 0..4 {
        groups.push(engine.add(order_event()).await.unwrap().group_id);
    }
    assert_eq!(groups, vec![1, 2, 3, 1]);
    assert_eq!(engine.shards().max(), 3);
}

#[tokio::test]
async fn test_shard_count_defaults_to_one() {
    let store = single_listener_store(1, 1).await;
    store
        .inner
        .seed_app_option(app_option("GetNotProcessed", "MaxGroups", "many"))
        .await;
    let engine = engine_with(&store, MockHttp::always(200)).await;

    assert_eq!(engine.add(order_event()).await.unwrap().group_id, 1);
    assert_eq!(engine.add(order_event()).await.unwrap().group_id, 1);
}

#[tokio::test]
async fn test_add_snapshots_active_bindings() {
    let store = single_listener_store(4, 1).await;
    store.inner.seed_listener_definition(listener_definition(2, 1, 2, 1)).await;
    store.inner.seed_binding(binding(2, 1, 2, false)).await;
    let engine = engine_with(&store, MockHttp::always(200)).await;

    let created = engine.add(order_event()).await.unwrap();

    assert!(created.id.0 > 0);
    assert_eq!(created.listener_instances.len(), 1);
    let listener = &created.listener_instances[0];
    assert_eq!(listener.event_instance_id, created.id);
    assert_eq!(listener.status, ListenerInstanceStatus::InQueue);
    assert_eq!(listener.remaining_trial_count, 4);
    assert_eq!(listener.audit.created_by, USER_EVENT_MANAGER);
    assert!(listener.next_run <= Utc::now());
}

#[tokio::test]
async fn test_bindings_are_fixed_at_add_time() {
    let store = single_listener_store(1, 1).await;
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;
    let created = engine.add(order_event()).await.unwrap();

    store.inner.seed_listener_definition(listener_definition(2, 1, 1, 1)).await;
    store.inner.seed_binding(binding(2, 1, 2, true)).await;
    store.inner.seed_binding(binding(1, 1, 1, false)).await;
    assert!(engine.load_definitions().await);

    engine
        .process(engine.get_due(Utc::now(), created.group_id).await)
        .await;

    let urls: Vec<String> = http.calls().into_iter().map(|c| c.url).collect();
    assert_eq!(urls, vec!["https://hooks.example.com/1".to_string()]);
    let brief = engine.read_status_by_business_id(created.business_id).await.unwrap();
    assert_eq!(brief.status, EventInstanceStatus::Succeeded);

    let later = engine.add(order_event()).await.unwrap();
    assert_eq!(later.listener_instances.len(), 1);
    assert_eq!(
        later.listener_instances[0].listener_definition_id,
        ListenerDefinitionId(2)
    );
}

#[tokio::test]
async fn test_add_rolls_back_on_failure() {
    let store = single_listener_store(1, 1).await;
    let engine = engine_with(&store, MockHttp::always(200)).await;
    store.fail_listener_create.store(true, Ordering::SeqCst);

    assert!(engine.add(order_event()).await.is_none());
    assert!(store.inner.event_instances().await.is_empty());
    assert!(store.inner.listener_instances().await.is_empty());
}

#[tokio::test]
async fn test_zero_listener_event_succeeds() {
    let storage = InMemoryStorage::new();
    storage.seed_event_definition(event_definition(9, "Heartbeat")).await;
    let store = FlakyStore::new(storage);
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;

    let created = engine
        .add(EventInstance::new(EventDefinitionId(9), "{}"))
        .await
        .unwrap();
    assert!(created.listener_instances.is_empty());

    let due = engine.get_due(Utc::now(), created.group_id).await;
    assert_eq!(due.len(), 1);
    let report = engine.process(due).await;

    assert_eq!(report.processed, 1);
    assert!(http.calls().is_empty());
    let brief = engine.read_status_by_business_id(created.business_id).await.unwrap();
    assert_eq!(brief.status, EventInstanceStatus::Succeeded);
    assert!(engine.get_due(Utc::now(), created.group_id).await.is_empty());
}

#[tokio::test]
async fn test_successful_delivery_carries_metadata() {
    let store = single_listener_store(3, 1).await;
    let http = MockHttp::always(204);
    let engine = engine_with(&store, http.clone()).await;

    let created = engine.add(order_event()).await.unwrap();
    let due = engine.get_due(Utc::now(), created.group_id).await;
    assert_eq!(due[0].definition.as_ref().unwrap().name, "OrderPlaced");
    assert!(due[0].listeners[0].bound.is_some());

    let processed = engine.process_one(due.into_iter().next().unwrap()).await.unwrap();

    assert_eq!(processed.status, EventInstanceStatus::Succeeded);
    assert_eq!(processed.listener_instances[0].status, ListenerInstanceStatus::Succeeded);
    assert_eq!(processed.listener_instances[0].remaining_trial_count, 2);
    assert_eq!(processed.listener_instances[0].audit.modified_by, USER_PROCESSOR);

    let calls = http.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://hooks.example.com/1");
    assert_eq!(calls[0].headers, vec!["X-Tenant: acme"]);

    let body: serde_json::Value = serde_json::from_str(&calls[0].body).unwrap();
    assert_eq!(body["orderId"], 42);
    assert_eq!(body[METADATA_KEY]["eventDefinitionName"], "OrderPlaced");
    assert_eq!(
        body[METADATA_KEY]["eventBusinessId"],
        created.business_id.to_string()
    );
}

#[tokio::test]
async fn test_unparseable_payload_is_sent_raw() {
    let store = single_listener_store(1, 1).await;
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;

    let created = engine
        .add(EventInstance::new(EventDefinitionId(1), "plain text"))
        .await
        .unwrap();
    engine.process(engine.get_due(Utc::now(), created.group_id).await).await;

    assert_eq!(http.calls()[0].body, "plain text");
}

#[tokio::test]
async fn test_retry_exhaustion() {
    let store = single_listener_store(3, 5).await;
    let http = MockHttp::always(500);
    let engine = engine_with(&store, http.clone()).await;
    let created = engine.add(order_event()).await.unwrap();

    let mut run_date = Utc::now();
    for attempt in 1..=3 {
        let due = engine.get_due(run_date, created.group_id).await;
        assert_eq!(due.len(), 1, "attempt {}", attempt);
        let event = engine.process_one(due.into_iter().next().unwrap()).await.unwrap();
        let listener = &event.listener_instances[0];

        assert_eq!(listener.remaining_trial_count, 3 - attempt);
        if attempt < 3 {
            assert_eq!(listener.status, ListenerInstanceStatus::WaitingForRetrial);
            assert_eq!(listener.next_run, listener.audit.modify_date + Duration::minutes(5));
            assert_eq!(event.status, EventInstanceStatus::Processing);

            // Not due again until the delay has passed.
            assert!(engine.get_due(run_date, created.group_id).await.is_empty());
            run_date = listener.next_run;
        } else {
            assert_eq!(listener.status, ListenerInstanceStatus::Failed);
            assert_eq!(event.status, EventInstanceStatus::Failed);
        }
    }

    assert_eq!(http.calls().len(), 3);
    let later = Utc::now() + Duration::days(1);
    assert!(engine.get_due(later, created.group_id).await.is_empty());
}

#[tokio::test]
async fn test_unknown_listener_type_is_skipped() {
    let store = single_listener_store(1, 1).await;
    store.inner.seed_listener_definition(listener_definition(2, 77, 1, 1)).await;
    store.inner.seed_binding(binding(2, 1, 2, true)).await;
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;

    {
        let defs = engine.definitions().await;
        assert_eq!(defs.wiring_errors().len(), 1);
        assert!(matches!(
            defs.wiring_errors()[0],
            DefinitionError::ListenerTypeNotFound { .. }
        ));
    }

    let created = engine.add(order_event()).await.unwrap();
    assert_eq!(created.listener_instances.len(), 2);

    let due = engine.get_due(Utc::now(), created.group_id).await;
    let event = engine.process_one(due.into_iter().next().unwrap()).await.unwrap();

    assert_eq!(http.calls().len(), 1);
    let statuses: Vec<_> = event.listener_instances.iter().map(|l| l.status).collect();
    assert_eq!(
        statuses,
        vec![ListenerInstanceStatus::Succeeded, ListenerInstanceStatus::Failed]
    );
    assert_eq!(event.status, EventInstanceStatus::Failed);
}

#[tokio::test]
async fn test_partial_batch_failure() {
    let store = single_listener_store(1, 1).await;
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;

    let a = engine.add(order_event()).await.unwrap();
    let b = engine.add(order_event()).await.unwrap();
    store.fail_listener_reads.lock().unwrap().insert(a.id);

    let due = engine.get_due(Utc::now(), 1).await;
    assert_eq!(due.len(), 2);
    let report = engine.process(due).await;

    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(http.calls().len(), 2);

    let a_status = engine.read_status_by_business_id(a.business_id).await.unwrap();
    let b_status = engine.read_status_by_business_id(b.business_id).await.unwrap();
    assert_eq!(a_status.status, EventInstanceStatus::Processing);
    assert_eq!(b_status.status, EventInstanceStatus::Succeeded);

    store.fail_listener_reads.lock().unwrap().clear();
    let due = engine.get_due(Utc::now() + Duration::days(1), 1).await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].instance.id, a.id);
    assert!(due[0].listeners.is_empty());

    let report = engine.process(due).await;
    assert_eq!(report.processed, 1);
    assert_eq!(http.calls().len(), 2);
    let a_status = engine.read_status_by_business_id(a.business_id).await.unwrap();
    assert_eq!(a_status.status, EventInstanceStatus::Succeeded);
}

#[tokio::test]
async fn test_delivery_continues_when_processing_mark_fails() {
    let store = single_listener_store(2, 1).await;
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;
    let created = engine.add(order_event()).await.unwrap();

    store
        .fail_event_edits_to
        .lock()
        .unwrap()
        .insert(EventInstanceStatus::Processing);
    let report = engine
        .process(engine.get_due(Utc::now(), created.group_id).await)
        .await;

    assert_eq!(report.processed, 1);
    assert_eq!(http.calls().len(), 1);
    let listeners = store.inner.listener_instances().await;
    assert_eq!(listeners[0].status, ListenerInstanceStatus::Succeeded);
    let brief = engine.read_status_by_business_id(created.business_id).await.unwrap();
    assert_eq!(brief.status, EventInstanceStatus::Succeeded);
}

#[tokio::test]
async fn test_failed_aggregate_write_recovers_on_next_poll() {
    let store = single_listener_store(2, 1).await;
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;
    let created = engine.add(order_event()).await.unwrap();

    store
        .fail_event_edits_to
        .lock()
        .unwrap()
        .insert(EventInstanceStatus::Succeeded);
    let report = engine
        .process(engine.get_due(Utc::now(), created.group_id).await)
        .await;

    assert_eq!(report.processed, 1);
    let brief = engine.read_status_by_business_id(created.business_id).await.unwrap();
    assert_eq!(brief.status, EventInstanceStatus::Processing);

    store.fail_event_edits_to.lock().unwrap().clear();
    let due = engine.get_due(Utc::now(), created.group_id).await;
    assert_eq!(due.len(), 1);
    assert!(due[0].listeners.is_empty());
    engine.process(due).await;

    assert_eq!(http.calls().len(), 1);
    let brief = engine.read_status_by_business_id(created.business_id).await.unwrap();
    assert_eq!(brief.status, EventInstanceStatus::Succeeded);
    assert!(engine.get_due(Utc::now(), created.group_id).await.is_empty());
}

#[tokio::test]
async fn test_waiting_retries_are_not_repolled_early() {
    let store = single_listener_store(3, 30).await;
    let engine = engine_with(&store, MockHttp::always(500)).await;
    let created = engine.add(order_event()).await.unwrap();

    engine
        .process(engine.get_due(Utc::now(), created.group_id).await)
        .await;

    assert!(engine.get_due(Utc::now(), created.group_id).await.is_empty());
    assert_eq!(
        engine
            .get_due(Utc::now() + Duration::minutes(31), created.group_id)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_listener_skipped_when_start_write_fails() {
    let store = single_listener_store(2, 1).await;
    let http = MockHttp::always(200);
    let engine = engine_with(&store, http.clone()).await;
    let created = engine.add(order_event()).await.unwrap();

    store.fail_listener_edit.store(true, Ordering::SeqCst);
    let mut due = engine.get_due(Utc::now(), created.group_id).await;
    let listener = due.remove(0).listeners.remove(0);
    let result = engine.execute_listener(listener, "{}").await;

    assert!(http.calls().is_empty());
    assert_eq!(result.status, ListenerInstanceStatus::InQueue);
    assert_eq!(result.remaining_trial_count, 2);
}

struct PanickingListener {
    target: ListenerTarget,
}

#[async_trait]
impl Listener for PanickingListener {
    fn configure(&mut self, target: ListenerTarget) {
        self.target = target;
    }

    fn target(&self) -> &ListenerTarget {
        &self.target
    }

    async fn execute(&self, _id: ListenerInstanceId, _data: &str, _options: &str) -> ListenerResult {
        panic!("listener blew up")
    }
}

#[tokio::test]
async fn test_plugin_panic_becomes_failed_attempt() {
    let storage = InMemoryStorage::new();
    storage.seed_event_definition(event_definition(1, "OrderPlaced")).await;
    storage.seed_listener_type(listener_type(1, "custom/panicking", "")).await;
    storage.seed_listener_definition(listener_definition(1, 1, 2, 1)).await;
    storage.seed_binding(binding(1, 1, 1, true)).await;
    let store = FlakyStore::new(storage);

    let mut resolver = PluginResolver::new(MockHttp::always(200));
    resolver.register("custom/panicking", |_| {
        Ok(Box::new(PanickingListener {
            target: ListenerTarget::default(),
        }) as Box<dyn Listener>)
    });
    let engine = engine_with_resolver(&store, Arc::new(resolver)).await;

    let created = engine.add(order_event()).await.unwrap();
    let report = engine
        .process(engine.get_due(Utc::now(), created.group_id).await)
        .await;

    assert_eq!(report.processed, 1);
    let listeners = store.inner.listener_instances().await;
    assert_eq!(listeners[0].status, ListenerInstanceStatus::WaitingForRetrial);
    assert_eq!(listeners[0].remaining_trial_count, 1);
}

#[tokio::test]
async fn test_type_options_come_from_env() {
    let storage = InMemoryStorage::new();
    storage.seed_event_definition(event_definition(1, "OrderPlaced")).await;
    storage
        .seed_listener_type(listener_type(1, "plugins/oauth2", "ORDERS_OAUTH"))
        .await;
    storage.seed_listener_definition(listener_definition(1, 1, 1, 1)).await;
    storage.seed_binding(binding(1, 1, 1, true)).await;
    let store = FlakyStore::new(storage);

    let http = MockHttp::scripted(
        vec![Ok(HttpResponse::new(
            200,
            r#"{"access_token":"abc","expires_in":3600}"#,
        ))],
        200,
    );
    let env: HashMap<String, String> = [(
        "ORDERS_OAUTH".to_string(),
        r#"{"identityProviderUrl":"https://idp.example.com/token","clientId":"c","clientSecret":"s","scope":"orders"}"#
            .to_string(),
    )]
    .into_iter()
    .collect();
    let engine = engine_with(&store, http.clone()).await.with_env(Arc::new(env));

    let created = engine.add(order_event()).await.unwrap();
    engine.process(engine.get_due(Utc::now(), created.group_id).await).await;

    let calls = http.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].url, "https://idp.example.com/token");
    assert!(calls[1].headers.contains(&"Authorization: Bearer abc".to_string()));

    let brief = engine.read_status_by_business_id(created.business_id).await.unwrap();
    assert_eq!(brief.status, EventInstanceStatus::Succeeded);
}

#[tokio::test]
async fn test_startup_fails_without_definitions() {
    let store = single_listener_store(1, 1).await;
    store.fail_definitions.store(true, Ordering::SeqCst);
    let store = Arc::new(store);
    let resolver = Arc::new(PluginResolver::with_builtins(MockHttp::always(200)));

    let result = DispatchEngine::new(EngineConfig::default(), store.clone(), store, resolver).await;
    assert!(matches!(result, Err(EngineError::DefinitionsLoad(_))));
}

#[tokio::test]
async fn test_reload_reports_failure() {
    let store = single_listener_store(1, 1).await;
    let engine = engine_with(&store, MockHttp::always(200)).await;

    assert!(engine.load_definitions().await);
    store.fail_definitions.store(true, Ordering::SeqCst);
    assert!(!engine.load_definitions().await);
}

#[tokio::test]
async fn test_unknown_business_id_has_no_status() {
    let store = single_listener_store(1, 1).await;
    let engine = engine_with(&store, MockHttp::always(200)).await;

    assert!(engine.read_status_by_business_id(Uuid::new_v4()).await.is_none());
}
