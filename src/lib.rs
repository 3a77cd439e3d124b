//! An event dispatch engine that fans business events out to webhook
//! listeners.
//!
//! Events are stored with one listener instance per active binding of
//! their definition. A poller reads the instances of its shard that are
//! due, runs each listener through its plugin and records the outcome,
//! retrying failed deliveries until their trial count runs out.
//!
//! ## Guarantees
//! - An event and its listener instances are created atomically
//! - At-least-once delivery per listener, bounded by its trial count
//! - One failing event never stops the rest of a batch
//! - Plugin panics become failed attempts
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Transactional status updates while processing
//! - Coordination between pollers; each shard must have a single poller
//!
//! Listener types are resolved through a [`PluginResolver`], a registry of
//! named constructors. Anonymous, OAuth2 client-credentials and
//! HMAC-signed delivery are built in.

mod config;
mod definitions;
mod engine;
mod env;
mod error;
mod http;
mod log;
mod plugin;
mod resolver;
mod shard;
mod signing;
mod storage;
mod types;

pub mod plugins;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use config::EngineConfig;
pub use definitions::{BoundListener, DefinitionRegistry, Definitions};
pub use engine::{aggregate_status, BatchReport, DispatchEngine, METADATA_KEY};
pub use env::{EnvLookup, ProcessEnv};
pub use error::{DefinitionError, EngineError, PluginError, StorageError, TransportError};
pub use http::{split_header, with_default_content_type, HttpClient, HttpResponse};
pub use log::{LogBook, LogEntry, LogLevel};
pub use plugin::{Listener, ListenerResult, ListenerTarget};
pub use resolver::{normalize_location, ListenerConstructor, PluginResolver};
pub use shard::ShardAssigner;
pub use signing::{
    compute_signature,
    is_timestamp_fresh,
    parse_signature_headers,
    verify_delivery,
    verify_signature,
    ParsedSignature,
    VerificationError,
    DEFAULT_SIGNATURE_HEADER,
    DEFAULT_TIMESTAMP_HEADER,
};
pub use storage::{
    DefinitionStore,
    EventInstanceFilter,
    InMemoryStorage,
    InstanceStore,
    InstanceTransaction,
    ListenerInstanceFilter,
};
pub use types::{
    AppOption, Audit, DueEvent, DueListener, EventDefinition, EventDefinitionId, EventInstance,
    EventInstanceId, EventInstanceStatus, EventInstanceStatusBrief, EventListenerBinding,
    ListenerDefinition, ListenerDefinitionId, ListenerInstance, ListenerInstanceId,
    ListenerInstanceStatus, ListenerType, ListenerTypeId, USER_EVENT_MANAGER, USER_PROCESSOR,
};

#[cfg(feature = "http")]
pub use http::ReqwestHttpClient;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
