//! Error types, error codes, and recovery hints for the sync layer.

use serde::{Deserialize, Serialize};

use crate::models::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The connection manager is already retrying, or a fresh `connect` will.
    Reconnect,
    /// The credential must be refreshed before anything else can succeed.
    Reauthenticate,
    /// Try again once the pending operation on the entity has settled.
    RetryAfterSettle,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("credential rejected: {0}")]
    Auth(String),

    #[error("operation already pending for {entity_id}")]
    OperationConflict { entity_id: EntityId },

    #[error("no local record of {entity}")]
    SyncDrift { entity: String },

    #[error("confirmation failed: {0}")]
    Confirmation(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::Auth(_) => "auth_error",
            Self::OperationConflict { .. } => "operation_conflict",
            Self::SyncDrift { .. } => "sync_drift",
            Self::Confirmation(_) => "confirmation_failed",
            Self::Protocol(_) => "protocol_error",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::Config(_) => "config_error",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::Connection(_) | Self::ReconnectExhausted { .. } => RecoveryAction::Reconnect,
            Self::Auth(_) => RecoveryAction::Reauthenticate,
            Self::OperationConflict { .. } => RecoveryAction::RetryAfterSettle,
            Self::SyncDrift { .. }
            | Self::Confirmation(_)
            | Self::Protocol(_)
            | Self::Config(_) => RecoveryAction::None,
        }
    }

    /// Fatal errors end the session's connection; nothing retries them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_))
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}
