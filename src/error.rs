use std::fmt;

use crate::types::{ListenerDefinitionId, ListenerTypeId};

/// Failure reported by a persistence backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Could not reach or open the backing store.
    Connection(String),

    /// A statement or read failed.
    Query(String),

    /// The addressed row does not exist.
    NotFound(String),

    /// The write conflicts with existing state.
    Conflict(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Connection(msg) =>
                write!(f, "storage connection failed: {}", msg),
            StorageError::Query(msg) =>
                write!(f, "storage query failed: {}", msg),
            StorageError::NotFound(msg) =>
                write!(f, "not found: {}", msg),
            StorageError::Conflict(msg) =>
                write!(f, "conflicting write: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors raised while resolving or instantiating a listener plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// The listener type carries no location.
    EmptyLocation,

    /// Nothing is registered at the location.
    NotFound {
        location: String,
    },

    /// The module at the location does not export exactly one listener.
    InterfaceMismatch {
        location: String,
        found: usize,
    },

    /// The constructor itself failed.
    Instantiation {
        location: String,
        reason: String,
    },
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::EmptyLocation =>
                write!(f, "plugin location cannot be empty"),
            PluginError::NotFound { location } =>
                write!(f, "plugin not found at location: {}", location),
            PluginError::InterfaceMismatch { location, found } =>
                write!(f, "expected exactly one listener implementation at {}, found {}", location, found),
            PluginError::Instantiation { location, reason } =>
                write!(f, "failed to instantiate plugin at {}: {}", location, reason),
        }
    }
}

impl std::error::Error for PluginError {}

/// Per-definition problem found while wiring plugins.
///
/// These never abort a load; they are collected on the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    ListenerTypeNotFound {
        listener_definition_id: ListenerDefinitionId,
        listener_type_id: ListenerTypeId,
    },
    Plugin {
        listener_definition_id: ListenerDefinitionId,
        source: PluginError,
    },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionError::ListenerTypeNotFound { listener_definition_id, listener_type_id } =>
                write!(
                    f,
                    "listener type {} not found for listener definition {}",
                    listener_type_id.0, listener_definition_id.0
                ),
            DefinitionError::Plugin { listener_definition_id, source } =>
                write!(f, "listener definition {}: {}", listener_definition_id.0, source),
        }
    }
}

impl std::error::Error for DefinitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DefinitionError::Plugin { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors surfaced by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Definitions could not be loaded; the engine cannot dispatch.
    DefinitionsLoad(StorageError),

    /// A storage read needed to finish processing failed.
    Storage(StorageError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::DefinitionsLoad(err) =>
                write!(f, "definitions failed to load: {}", err),
            EngineError::Storage(err) =>
                write!(f, "{}", err),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::DefinitionsLoad(err) | EngineError::Storage(err) => Some(err),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Storage(err)
    }
}

/// Reasons an outbound HTTP call produced no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Network(String),
    InvalidRequest(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout =>
                write!(f, "request timed out"),
            TransportError::Network(msg) =>
                write!(f, "network error: {}", msg),
            TransportError::InvalidRequest(msg) =>
                write!(f, "invalid request: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}
