//! Live channel protocol types
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`. Both
//! directions are closed enums so that unknown or malformed server frames are
//! rejected at the boundary instead of reaching handlers.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::models::{
    ChannelId, ConversationPatch, EntityId, MessageId, MessageKind, MessagePreview, UserId,
};

/// Error code the server attaches to an `error` event when the credential is
/// no longer accepted.
pub const UNAUTHORIZED_CODE: &str = "unauthorized";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDetails {
    pub amount: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OfferStatus>,
}

/// Events sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Heartbeat, sent every heartbeat interval while connected
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "conversation:join")]
    ConversationJoin { channel_id: ChannelId },
    #[serde(rename = "conversation:leave")]
    ConversationLeave { channel_id: ChannelId },
    #[serde(rename = "message:send")]
    MessageSend {
        channel_id: ChannelId,
        content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer_details: Option<OfferDetails>,
    },
    /// Read receipt
    #[serde(rename = "message:read")]
    MessageRead {
        message_id: MessageId,
        channel_id: ChannelId,
    },
    #[serde(rename = "typing:start")]
    TypingStart { channel_id: ChannelId },
    #[serde(rename = "typing:stop")]
    TypingStop { channel_id: ChannelId },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ConversationJoin { .. } => "conversation:join",
            Self::ConversationLeave { .. } => "conversation:leave",
            Self::MessageSend { .. } => "message:send",
            Self::MessageRead { .. } => "message:read",
            Self::TypingStart { .. } => "typing:start",
            Self::TypingStop { .. } => "typing:stop",
        }
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

/// Events sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Authoritative summary patch, scoped to the conversation's channel
    #[serde(rename = "conversation:updated")]
    ConversationUpdated(ConversationPatch),
    #[serde(rename = "message:new")]
    MessageNew {
        channel_id: ChannelId,
        message: MessagePreview,
    },
    #[serde(rename = "user:online")]
    UserOnline { user_id: UserId },
    #[serde(rename = "user:offline")]
    UserOffline { user_id: UserId },
    /// Authoritative favorite membership for one entity
    #[serde(rename = "favorite:updated")]
    FavoriteUpdated { entity_id: EntityId, favorited: bool },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// Names of server events handlers can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConversationUpdated,
    MessageNew,
    UserOnline,
    UserOffline,
    FavoriteUpdated,
    Pong,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationUpdated => "conversation:updated",
            Self::MessageNew => "message:new",
            Self::UserOnline => "user:online",
            Self::UserOffline => "user:offline",
            Self::FavoriteUpdated => "favorite:updated",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConversationUpdated(_) => EventKind::ConversationUpdated,
            Self::MessageNew { .. } => EventKind::MessageNew,
            Self::UserOnline { .. } => EventKind::UserOnline,
            Self::UserOffline { .. } => EventKind::UserOffline,
            Self::FavoriteUpdated { .. } => EventKind::FavoriteUpdated,
            Self::Pong => EventKind::Pong,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// The channel this event belongs to, if it is only delivered to sessions
    /// that joined that channel.
    pub fn channel_scope(&self) -> Option<&ChannelId> {
        match self {
            Self::ConversationUpdated(patch) => Some(&patch.id),
            Self::MessageNew { channel_id, .. } => Some(channel_id),
            _ => None,
        }
    }

    /// True for an `error` event that revokes the session's credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Error { code: Some(code), .. } if code == UNAUTHORIZED_CODE)
    }

    /// Parse and validate one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        let event: ServerEvent =
            serde_json::from_str(text).map_err(|e| SyncError::Protocol(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), SyncError> {
        let empty = match self {
            Self::ConversationUpdated(patch) => patch.id.as_str().is_empty(),
            Self::MessageNew {
                channel_id,
                message,
            } => channel_id.as_str().is_empty() || message.id.as_str().is_empty(),
            Self::UserOnline { user_id } | Self::UserOffline { user_id } => {
                user_id.as_str().is_empty()
            }
            Self::FavoriteUpdated { entity_id, .. } => entity_id.as_str().is_empty(),
            Self::Pong | Self::Error { .. } => false,
        };
        if empty {
            return Err(SyncError::Protocol(format!(
                "{} event with empty identifier",
                self.kind()
            )));
        }
        Ok(())
    }
}
