use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definitions::BoundListener;

/// Modifier recorded on listener instances created by `Add`.
pub const USER_EVENT_MANAGER: &str = "system.event-manager";

/// Modifier recorded on every status write performed while processing.
pub const USER_PROCESSOR: &str = "system.processor";

/// Identifier of an [`EventDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventDefinitionId(pub i64);

/// Identifier of a [`ListenerDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerDefinitionId(pub i64);

/// Identifier of a [`ListenerType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerTypeId(pub i64);

/// Identifier of a persisted [`EventInstance`].
///
/// Zero until the storage layer assigns one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventInstanceId(pub i64);

/// Identifier of a persisted [`ListenerInstance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerInstanceId(pub i64);

impl fmt::Display for EventInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ListenerInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping attributes shared by every persisted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub created_by: String,
    pub create_date: DateTime<Utc>,
    pub modified_by: String,
    pub modify_date: DateTime<Utc>,
    pub notes: String,
    pub active: bool,
}

impl Audit {
    /// Fresh, active audit stamp owned by `user`.
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();
        let now = Utc::now();
        Self {
            created_by: user.clone(),
            create_date: now,
            modified_by: user,
            modify_date: now,
            notes: String::new(),
            active: true,
        }
    }

    /// Record a modification by `user` at the current instant.
    pub fn touch(&mut self, user: &str) {
        self.modified_by = user.to_string();
        self.modify_date = Utc::now();
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self::new("system")
    }
}

/// Catalog entry describing a class of business event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: EventDefinitionId,
    pub name: String,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Identifies *how* a listener is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerType {
    pub id: ListenerTypeId,
    pub name: String,

    /// Location of the plugin implementation, resolved by the
    /// [`PluginResolver`](crate::PluginResolver).
    pub location: String,

    /// Name of the environment variable holding plugin-specific options.
    pub type_options: String,

    #[serde(flatten)]
    pub audit: Audit,
}

/// A configured delivery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerDefinition {
    pub id: ListenerDefinitionId,
    pub name: String,
    pub url: String,

    /// Outbound headers in `Name: value` form.
    pub headers: Vec<String>,

    /// Per-call timeout, in minutes.
    pub timeout_minutes: u32,

    /// Maximum number of delivery attempts.
    pub trial_count: i32,

    /// Delay between attempts, in minutes.
    pub retrial_delay_minutes: u32,

    pub listener_type_id: ListenerTypeId,

    #[serde(flatten)]
    pub audit: Audit,
}

/// Many-to-many association between event and listener definitions.
///
/// Only active bindings (`audit.active`) fan out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventListenerBinding {
    pub id: i64,
    pub event_definition_id: EventDefinitionId,
    pub listener_definition_id: ListenerDefinitionId,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Free-form `(category, name) -> value` setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppOption {
    pub id: i64,
    pub category: String,
    pub name: String,
    pub value: String,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Aggregate status of an [`EventInstance`].
///
/// Discriminants are distinct powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EventInstanceStatus {
    NotSet = 0,
    InQueue = 1,
    Processing = 2,
    Hold = 4,
    Succeeded = 8,
    Failed = 16,
    Aborted = 32,
}

impl EventInstanceStatus {
    pub fn bits(self) -> i32 {
        self as i32
    }

    pub fn from_bits(bits: i32) -> Option<Self> {
        match bits {
            0 => Some(Self::NotSet),
            1 => Some(Self::InQueue),
            2 => Some(Self::Processing),
            4 => Some(Self::Hold),
            8 => Some(Self::Succeeded),
            16 => Some(Self::Failed),
            32 => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Succeeded, Failed and Aborted are terminal.
    pub fn is_end_state(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

/// Delivery status of a [`ListenerInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ListenerInstanceStatus {
    NotSet = 0,
    InQueue = 1,
    Processing = 2,
    Hold = 4,
    Succeeded = 8,
    Failed = 16,
    Aborted = 32,
    WaitingForRetrial = 64,
}

impl ListenerInstanceStatus {
    pub fn bits(self) -> i32 {
        self as i32
    }

    pub fn from_bits(bits: i32) -> Option<Self> {
        match bits {
            0 => Some(Self::NotSet),
            1 => Some(Self::InQueue),
            2 => Some(Self::Processing),
            4 => Some(Self::Hold),
            8 => Some(Self::Succeeded),
            16 => Some(Self::Failed),
            32 => Some(Self::Aborted),
            64 => Some(Self::WaitingForRetrial),
            _ => None,
        }
    }

    pub fn is_end_state(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Statuses that keep the parent event in `Processing`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InQueue | Self::Processing | Self::WaitingForRetrial)
    }
}

/// One occurrence of a business event.
///
/// Build with [`EventInstance::new`]; listener instances are created by the
/// engine from the bindings active at `Add` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInstance {
    pub id: EventInstanceId,
    pub event_definition_id: EventDefinitionId,

    /// Caller-assigned correlation id.
    pub business_id: Uuid,

    /// Opaque payload, expected to be a JSON object.
    pub event_data: String,

    pub reference_name: String,
    pub reference_value: String,
    pub status: EventInstanceStatus,

    /// Shard this instance was assigned to.
    pub group_id: u32,

    pub listener_instances: Vec<ListenerInstance>,

    #[serde(flatten)]
    pub audit: Audit,
}

impl EventInstance {
    /// Create a not-yet-persisted instance with a random business id.
    pub fn new(event_definition_id: EventDefinitionId, event_data: impl Into<String>) -> Self {
        Self {
            id: EventInstanceId::default(),
            event_definition_id,
            business_id: Uuid::new_v4(),
            event_data: event_data.into(),
            reference_name: String::new(),
            reference_value: String::new(),
            status: EventInstanceStatus::InQueue,
            group_id: 0,
            listener_instances: Vec::new(),
            audit: Audit::new("system.trigger"),
        }
    }

    /// Use a caller-supplied business id.
    pub fn with_business_id(mut self, business_id: Uuid) -> Self {
        self.business_id = business_id;
        self
    }

    /// Attach a reference name/value correlation tag.
    pub fn with_reference(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.reference_name = name.into();
        self.reference_value = value.into();
        self
    }

    /// Record who triggered the event.
    pub fn with_creator(mut self, user: impl Into<String>) -> Self {
        self.audit = Audit::new(user);
        self
    }
}

/// Per-endpoint delivery record spawned from an [`EventInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerInstance {
    pub id: ListenerInstanceId,
    pub event_instance_id: EventInstanceId,
    pub listener_definition_id: ListenerDefinitionId,
    pub status: ListenerInstanceStatus,
    pub remaining_trial_count: i32,
    pub next_run: DateTime<Utc>,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Minimal status projection looked up by business id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInstanceStatusBrief {
    pub id: EventInstanceId,
    pub business_id: Uuid,
    pub status: EventInstanceStatus,
}

/// An event instance selected by `get_due`, enriched from the in-memory
/// definitions.
///
/// The instance's own `listener_instances` are moved into `listeners` so
/// each one travels with its definition.
#[derive(Debug, Clone)]
pub struct DueEvent {
    pub instance: EventInstance,
    pub definition: Option<EventDefinition>,
    pub listeners: Vec<DueListener>,
}

/// A listener instance paired with the definition it executes through.
#[derive(Debug, Clone)]
pub struct DueListener {
    pub instance: ListenerInstance,

    /// `None` when the definition was not present at load time.
    pub bound: Option<Arc<BoundListener>>,
}
