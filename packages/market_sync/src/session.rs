//! Session: one authenticated user context.
//!
//! Owns the connection manager and the three state stores, and wires the
//! server events that keep those stores current. Created on authentication,
//! torn down on logout or credential loss.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::{ConversationsApi, FavoritesApi};
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState, StateChange};
use crate::conversations::ConversationStore;
use crate::error::SyncError;
use crate::events::{EventMultiplexer, Subscription};
use crate::favorites::FavoriteStore;
use crate::models::{ChannelId, ConversationPatch, Credential, EntityId, MessageId, MessageKind};
use crate::presence::PresenceTracker;
use crate::protocol::{Attachment, ClientEvent, EventKind, OfferDetails, ServerEvent};
use crate::transport::Connector;

/// A message to send on a conversation channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub channel_id: ChannelId,
    pub content: String,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
    pub offer_details: Option<OfferDetails>,
}

impl OutgoingMessage {
    pub fn text(channel_id: ChannelId, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            content: content.into(),
            kind: MessageKind::Text,
            attachments: Vec::new(),
            offer_details: None,
        }
    }

    pub fn offer(channel_id: ChannelId, content: impl Into<String>, details: OfferDetails) -> Self {
        Self {
            kind: MessageKind::Offer,
            offer_details: Some(details),
            ..Self::text(channel_id, content)
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        if self.kind == MessageKind::Text {
            self.kind = MessageKind::Image;
        }
        self.attachments.push(attachment);
        self
    }

    fn into_event(self) -> ClientEvent {
        ClientEvent::MessageSend {
            channel_id: self.channel_id,
            content: self.content,
            kind: self.kind,
            attachments: self.attachments,
            offer_details: self.offer_details,
        }
    }
}

pub struct Session {
    id: Uuid,
    config: SyncConfig,
    connection: Arc<ConnectionManager>,
    events: EventMultiplexer,
    favorites: Arc<FavoriteStore>,
    conversations: Arc<ConversationStore>,
    presence: Arc<PresenceTracker>,
    internal: Mutex<Vec<Subscription>>,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new<A>(config: SyncConfig, connector: Arc<dyn Connector>, api: Arc<A>) -> Self
    where
        A: FavoritesApi + ConversationsApi,
    {
        let id = Uuid::new_v4();
        let connection = ConnectionManager::new(connector, &config);
        let events = EventMultiplexer::new(connection.clone());
        let favorites = Arc::new(FavoriteStore::new(api.clone()));
        let conversations = Arc::new(ConversationStore::with_api(api));
        let presence = Arc::new(PresenceTracker::new());

        let internal = vec![
            events.on(EventKind::ConversationUpdated, {
                let conversations = conversations.clone();
                move |event| {
                    if let ServerEvent::ConversationUpdated(patch) = event {
                        conversations.apply_update(patch);
                    }
                }
            }),
            events.on(EventKind::MessageNew, {
                let conversations = conversations.clone();
                move |event| {
                    if let ServerEvent::MessageNew {
                        channel_id,
                        message,
                    } = event
                    {
                        conversations.apply_update(&ConversationPatch {
                            id: channel_id.clone(),
                            last_message: Some(message.clone()),
                            unread_count: None,
                        });
                    }
                }
            }),
            events.on(EventKind::UserOnline, {
                let presence = presence.clone();
                move |event| {
                    if let ServerEvent::UserOnline { user_id } = event {
                        presence.set_online(user_id);
                    }
                }
            }),
            events.on(EventKind::UserOffline, {
                let presence = presence.clone();
                move |event| {
                    if let ServerEvent::UserOffline { user_id } = event {
                        presence.set_offline(user_id);
                    }
                }
            }),
            events.on(EventKind::FavoriteUpdated, {
                let favorites = favorites.clone();
                move |event| {
                    if let ServerEvent::FavoriteUpdated {
                        entity_id,
                        favorited,
                    } = event
                    {
                        favorites.apply_authoritative(entity_id, *favorited);
                    }
                }
            }),
            events.on(EventKind::Pong, |_| debug!("heartbeat acknowledged")),
        ];

        info!(session = %id, "session created");
        Self {
            id,
            config,
            connection,
            events,
            favorites,
            conversations,
            presence,
            internal: Mutex::new(internal),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Connect with `credential`; `None` tears the connection down.
    pub async fn connect(&self, credential: Option<Credential>) -> Result<(), SyncError> {
        if self.is_torn_down() {
            return Err(SyncError::Connection("session has been torn down".to_string()));
        }
        self.connection.connect(credential).await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.connection.on_state_change(handler)
    }

    pub fn join_conversation(&self, channel_id: ChannelId) -> bool {
        self.events.join_channel(channel_id)
    }

    pub fn leave_conversation(&self, channel_id: &ChannelId) -> bool {
        self.events.leave_channel(channel_id)
    }

    /// Returns whether the message was handed to the transport.
    pub fn send_message(&self, message: OutgoingMessage) -> bool {
        self.events.emit(message.into_event())
    }

    /// Zero the local unread count and send a read receipt.
    pub fn mark_conversation_read(&self, channel_id: &ChannelId, message_id: MessageId) -> bool {
        self.conversations.mark_read(channel_id);
        self.events.emit(ClientEvent::MessageRead {
            message_id,
            channel_id: channel_id.clone(),
        })
    }

    pub fn start_typing(&self, channel_id: &ChannelId) -> bool {
        self.events.emit(ClientEvent::TypingStart {
            channel_id: channel_id.clone(),
        })
    }

    pub fn stop_typing(&self, channel_id: &ChannelId) -> bool {
        self.events.emit(ClientEvent::TypingStop {
            channel_id: channel_id.clone(),
        })
    }

    pub async fn toggle_favorite(&self, entity_id: &EntityId) -> Result<bool, SyncError> {
        self.favorites.toggle(entity_id).await
    }

    pub async fn refresh_favorites(&self) -> Result<usize, SyncError> {
        self.favorites.refresh().await
    }

    pub async fn refresh_conversations(&self) -> Result<usize, SyncError> {
        self.conversations.refresh().await
    }

    pub fn events(&self) -> &EventMultiplexer {
        &self.events
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn favorites(&self) -> &Arc<FavoriteStore> {
        &self.favorites
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Stop the driver, release every subscription, forget joined channels
    /// and close the transport. Idempotent.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.shutdown();
        let released: Vec<Subscription> = std::mem::take(&mut *self.internal.lock());
        for sub in released {
            sub.release();
        }
        info!(session = %self.id, "session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
