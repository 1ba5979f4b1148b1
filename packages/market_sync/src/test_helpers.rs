//! Shared fixtures for unit tests: an in-memory connector standing in for the
//! live channel and a scriptable collaborator API.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

use crate::api::{ConversationsApi, FavoritesApi};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{
    ChannelId, ConversationSummary, Credential, EntityId, MessageId, MessageKind, MessagePreview,
    UserId,
};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::transport::{Connector, Link, TransportEvent};

const QUEUE: usize = 64;

pub fn test_config() -> SyncConfig {
    SyncConfig::default()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub fn summary(id: &str, updated_secs: i64, unread: u32) -> ConversationSummary {
    ConversationSummary {
        id: ChannelId::from(id),
        last_message: None,
        unread_count: unread,
        participants: Vec::new(),
        updated_at: at(updated_secs),
    }
}

pub fn preview(id: &str, sent_secs: i64) -> MessagePreview {
    MessagePreview {
        id: MessageId::from(id),
        sender_id: UserId::from("seller-1"),
        content: format!("message {id}"),
        kind: MessageKind::Text,
        sent_at: at(sent_secs),
    }
}

/// Server side of one mock connection.
pub struct MockServer {
    client_events: mpsc::Receiver<ClientEvent>,
    push_tx: mpsc::Sender<TransportEvent>,
}

impl MockServer {
    /// Next event the client sent, or `None` once the client closed its side.
    pub async fn next_client_event(&mut self) -> Option<ClientEvent> {
        self.client_events.recv().await
    }

    pub async fn push(&self, event: ServerEvent) {
        let _ = self.push_tx.send(TransportEvent::Event(event)).await;
    }

    /// Simulate the server dropping the connection.
    pub async fn drop_link(self, reason: &str) {
        let _ = self
            .push_tx
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Yield until the client has drained everything pushed so far.
    pub async fn settle(&self) {
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if self.push_tx.is_closed() || self.push_tx.capacity() == self.push_tx.max_capacity() {
                break;
            }
        }
        tokio::task::yield_now().await;
    }
}

/// Connector that hands each accepted connection's server side to the test.
///
/// Outcomes queued with [`MockConnector::push_outcome`] are consumed one per
/// attempt; once the queue is empty every attempt succeeds.
pub struct MockConnector {
    outcomes: Mutex<VecDeque<Result<(), SyncError>>>,
    attempts: AtomicUsize,
    servers: mpsc::UnboundedSender<MockServer>,
    /// When set, every attempt waits for one permit before resolving.
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            servers,
            gate: Mutex::new(None),
        });
        (connector, rx)
    }

    pub fn push_outcome(&self, outcome: Result<(), SyncError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Hold every following attempt until a permit is added to the gate.
    pub fn hold_attempts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }
}

impl Connector for MockConnector {
    fn connect<'a>(
        &'a self,
        _credential: &'a Credential,
    ) -> BoxFuture<'a, Result<Link, SyncError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if let Some(Err(e)) = self.outcomes.lock().pop_front() {
                return Err(e);
            }
            let (out_tx, out_rx) = mpsc::channel(QUEUE);
            let (in_tx, in_rx) = mpsc::channel(QUEUE);
            let _ = self.servers.send(MockServer {
                client_events: out_rx,
                push_tx: in_tx,
            });
            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

/// Scriptable favorites/conversations collaborator.
pub struct MockApi {
    pub favorite_ids: Mutex<Vec<EntityId>>,
    pub conversations: Mutex<Vec<ConversationSummary>>,
    pub toggle_calls: Mutex<Vec<(EntityId, bool)>>,
    fail_toggles: AtomicBool,
    fail_fetches: AtomicBool,
    /// When set, every toggle waits for one permit before resolving.
    gate: Option<Arc<Semaphore>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Toggle confirmations block until [`Semaphore::add_permits`] is called
    /// on the returned gate.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Arc::new(Self::build(Some(gate.clone()))), gate)
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            favorite_ids: Mutex::new(Vec::new()),
            conversations: Mutex::new(Vec::new()),
            toggle_calls: Mutex::new(Vec::new()),
            fail_toggles: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            gate,
        }
    }

    pub fn fail_toggles(&self, fail: bool) {
        self.fail_toggles.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn toggle_count(&self) -> usize {
        self.toggle_calls.lock().len()
    }
}

impl FavoritesApi for MockApi {
    fn fetch_favorite_ids(&self) -> BoxFuture<'_, Result<Vec<EntityId>, SyncError>> {
        Box::pin(async move {
            if self.fail_fetches.load(Ordering::SeqCst) {
                return Err(SyncError::Connection("favorites unavailable".into()));
            }
            Ok(self.favorite_ids.lock().clone())
        })
    }

    fn confirm_toggle<'a>(
        &'a self,
        entity_id: &'a EntityId,
        previously_member: bool,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            self.toggle_calls
                .lock()
                .push((entity_id.clone(), previously_member));
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if self.fail_toggles.load(Ordering::SeqCst) {
                return Err(SyncError::Confirmation("toggle rejected".into()));
            }
            Ok(())
        })
    }
}

impl ConversationsApi for MockApi {
    fn fetch_conversations(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>, SyncError>> {
        Box::pin(async move {
            if self.fail_fetches.load(Ordering::SeqCst) {
                return Err(SyncError::Connection("conversations unavailable".into()));
            }
            Ok(self.conversations.lock().clone())
        })
    }
}

/// Poll `check` until it holds, yielding to other tasks in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
