use std::sync::Arc;

use chrono::Utc;
use hook_engine::{
    Audit, DispatchEngine, EngineConfig, EventDefinition, EventDefinitionId, EventInstance,
    EventListenerBinding, InMemoryStorage, ListenerDefinition, ListenerDefinitionId, ListenerType,
    ListenerTypeId, PluginResolver, ReqwestHttpClient,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let storage = InMemoryStorage::new();
    storage
        .seed_event_definition(EventDefinition {
            id: EventDefinitionId(1),
            name: "OrderPlaced".into(),
            audit: Audit::default(),
        })
        .await;
    storage
        .seed_listener_type(ListenerType {
            id: ListenerTypeId(1),
            name: "anonymous".into(),
            location: "plugins/anonymous".into(),
            type_options: String::new(),
            audit: Audit::default(),
        })
        .await;
    storage
        .seed_listener_definition(ListenerDefinition {
            id: ListenerDefinitionId(1),
            name: "orders-webhook".into(),
            url: "https://example.com/webhook".into(),
            headers: vec!["X-Source: hook-engine".into()],
            timeout_minutes: 1,
            trial_count: 3,
            retrial_delay_minutes: 5,
            listener_type_id: ListenerTypeId(1),
            audit: Audit::default(),
        })
        .await;
    storage
        .seed_binding(EventListenerBinding {
            id: 1,
            event_definition_id: EventDefinitionId(1),
            listener_definition_id: ListenerDefinitionId(1),
            audit: Audit::default(),
        })
        .await;

    let storage = Arc::new(storage);
    let resolver = Arc::new(PluginResolver::with_builtins(Arc::new(ReqwestHttpClient::new())));
    let engine = match DispatchEngine::new(
        EngineConfig::default(),
        storage.clone(),
        storage.clone(),
        resolver,
    )
    .await
    {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("engine failed to start: {}", err);
            return;
        }
    };

    let event = EventInstance::new(EventDefinitionId(1), r#"{"orderId":123}"#)
        .with_reference("order", "123")
        .with_creator("orders-service");
    let Some(created) = engine.add(event).await else {
        eprintln!("event was not stored");
        return;
    };

    let due = engine.get_due(Utc::now(), created.group_id).await;
    let report = engine.process(due).await;
    println!("processed {} failed {}", report.processed, report.failed);

    if let Some(brief) = engine.read_status_by_business_id(created.business_id).await {
        println!("event {} is {:?}", brief.id, brief.status);
    }
}
