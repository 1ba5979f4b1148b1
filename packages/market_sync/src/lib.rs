//! Real-time sync layer for the marketplace client: live event channel,
//! optimistic favorites, conversation summaries and presence.

pub mod api;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod error;
pub mod events;
pub mod favorites;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use api::{ConversationsApi, FavoritesApi, HttpApi};
pub use config::{ReconnectPolicy, SyncConfig};
pub use connection::{ConnectionManager, ConnectionState, StateChange};
pub use conversations::{ConversationStore, UpdateOutcome};
pub use error::{RecoveryAction, SyncError};
pub use events::{EventMultiplexer, Subscription};
pub use favorites::{FavoriteChange, FavoriteStore, PendingKind, PendingOperation};
pub use models::{
    ChannelId, ConversationPatch, ConversationSummary, Credential, EntityId, MessageId, MessageKind,
    MessagePreview, UserId,
};
pub use presence::{PresenceEntry, PresenceTracker};
pub use protocol::{ClientEvent, EventKind, ServerEvent};
pub use session::{OutgoingMessage, Session};
pub use transport::{Connector, Link, TransportEvent, WsConnector};
