//! Event multiplexer
//!
//! Handlers register per event kind (optionally scoped to one channel) and are
//! invoked in registration order on the connection's dispatch task. Every
//! registration hands back a [`Subscription`]; releasing or dropping it
//! removes exactly that handler.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::ConnectionManager;
use crate::models::ChannelId;
use crate::protocol::{ClientEvent, EventKind, ServerEvent};

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Handle for one registered handler.
///
/// The handler stays registered for as long as the handle lives; call
/// [`Subscription::release`] (or drop it) on consumer teardown.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: HandlerId,
    event: Option<EventKind>,
    scope: Option<ChannelId>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(
        id: HandlerId,
        event: Option<EventKind>,
        scope: Option<ChannelId>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            event,
            scope,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Event name this handler listens to; `None` for state-change listeners.
    pub fn event_name(&self) -> Option<&'static str> {
        self.event.map(|k| k.as_str())
    }

    pub fn channel_scope(&self) -> Option<&ChannelId> {
        self.scope.as_ref()
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event_name())
            .field("scope", &self.scope)
            .finish()
    }
}

struct Entry {
    id: HandlerId,
    kind: EventKind,
    scope: Option<ChannelId>,
    handler: EventHandler,
    /// Cleared on removal so an in-flight dispatch skips the handler.
    live: Arc<AtomicBool>,
}

impl Entry {
    fn retire(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Ordered handler table shared by the connection manager (which dispatches)
/// and the multiplexer facade (which registers).
pub struct HandlerRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn register(
        self: &Arc<Self>,
        kind: EventKind,
        scope: Option<ChannelId>,
        handler: EventHandler,
    ) -> Subscription {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.is_closed() {
            debug!(%id, event = %kind, "registry closed, handler not registered");
            return Subscription::new(id, Some(kind), scope, || {});
        }

        self.entries.lock().push(Entry {
            id,
            kind,
            scope: scope.clone(),
            handler,
            live: Arc::new(AtomicBool::new(true)),
        });
        trace!(%id, event = %kind, "handler registered");

        let registry: Weak<HandlerRegistry> = Arc::downgrade(self);
        Subscription::new(id, Some(kind), scope, move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }

    fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| {
            if e.id == id {
                e.retire();
            }
            e.id != id
        });
        before != entries.len()
    }

    /// Remove every handler for `kind`. Returns how many were removed.
    pub fn clear_kind(&self, kind: EventKind) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| {
            if e.kind == kind {
                e.retire();
            }
            e.kind != kind
        });
        before - entries.len()
    }

    /// Drop all handlers and refuse new ones. Dispatch becomes a no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.entries.lock().drain(..) {
            entry.retire();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.entries.lock().iter().filter(|e| e.kind == kind).count()
    }

    /// Invoke every matching handler in registration order. Handlers run
    /// outside the table lock so they may register or release freely; one
    /// released by an earlier handler is skipped.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        if self.is_closed() {
            return 0;
        }
        let kind = event.kind();
        let scope = event.channel_scope();
        let handlers: Vec<(Arc<AtomicBool>, EventHandler)> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .filter(|e| e.scope.is_none() || e.scope.as_ref() == scope)
            .map(|e| (e.live.clone(), e.handler.clone()))
            .collect();

        let mut delivered = 0;
        for (live, handler) in handlers {
            if self.is_closed() {
                break;
            }
            if !live.load(Ordering::SeqCst) {
                continue;
            }
            handler(event);
            delivered += 1;
        }
        delivered
    }
}

/// Consumer-facing facade over the shared channel.
#[derive(Clone)]
pub struct EventMultiplexer {
    registry: Arc<HandlerRegistry>,
    connection: Arc<ConnectionManager>,
}

impl EventMultiplexer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            registry: connection.registry().clone(),
            connection,
        }
    }

    /// Send an event to the server. Dropped (with a warning) unless connected.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.connection.emit(event)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.registry.register(kind, None, Arc::new(handler))
    }

    /// Register a handler that only sees `kind` events for `channel`.
    pub fn on_channel<F>(&self, kind: EventKind, channel: ChannelId, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.registry.register(kind, Some(channel), Arc::new(handler))
    }

    /// Clear every handler for `kind`.
    pub fn off(&self, kind: EventKind) -> usize {
        let removed = self.registry.clear_kind(kind);
        debug!(event = %kind, removed, "handlers cleared");
        removed
    }

    pub fn join_channel(&self, channel: ChannelId) -> bool {
        self.connection.join(channel)
    }

    pub fn leave_channel(&self, channel: &ChannelId) -> bool {
        self.connection.leave(channel)
    }

    pub fn joined_channels(&self) -> Vec<ChannelId> {
        self.connection.joined_channels()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry.handler_count(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationPatch, UserId};

    fn online(user: &str) -> ServerEvent {
        ServerEvent::UserOnline {
            user_id: UserId::from(user),
        }
    }

    fn patch(channel: &str) -> ServerEvent {
        ServerEvent::ConversationUpdated(ConversationPatch {
            id: ChannelId::from(channel),
            last_message: None,
            unread_count: Some(1),
        })
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventHandler {
        let log = log.clone();
        Arc::new(move |event: &ServerEvent| log.lock().push(format!("{tag}:{}", event.kind())))
    }

    #[test]
    fn dispatch_in_registration_order() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = registry.register(EventKind::UserOnline, None, recorder(&log, "a"));
        let _b = registry.register(EventKind::UserOnline, None, recorder(&log, "b"));
        let _c = registry.register(EventKind::UserOffline, None, recorder(&log, "c"));

        assert_eq!(registry.dispatch(&online("u1")), 2);
        assert_eq!(*log.lock(), vec!["a:user:online", "b:user:online"]);
    }

    #[test]
    fn release_removes_only_that_handler() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.register(EventKind::UserOnline, None, recorder(&log, "a"));
        let _b = registry.register(EventKind::UserOnline, None, recorder(&log, "b"));

        a.release();
        registry.dispatch(&online("u1"));
        assert_eq!(*log.lock(), vec!["b:user:online"]);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let _sub = registry.register(EventKind::UserOnline, None, recorder(&log, "a"));
            assert_eq!(registry.handler_count(EventKind::UserOnline), 1);
        }
        assert_eq!(registry.handler_count(EventKind::UserOnline), 0);
        assert_eq!(registry.dispatch(&online("u1")), 0);
    }

    #[test]
    fn clear_kind_removes_all_handlers_for_name() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = registry.register(EventKind::UserOnline, None, recorder(&log, "a"));
        let _b = registry.register(EventKind::UserOnline, None, recorder(&log, "b"));
        let _c = registry.register(EventKind::UserOffline, None, recorder(&log, "c"));

        assert_eq!(registry.clear_kind(EventKind::UserOnline), 2);
        assert_eq!(registry.handler_count(EventKind::UserOffline), 1);
    }

    #[test]
    fn scoped_handlers_only_see_their_channel() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _scoped = registry.register(
            EventKind::ConversationUpdated,
            Some(ChannelId::from("conv_1")),
            recorder(&log, "scoped"),
        );
        let _global =
            registry.register(EventKind::ConversationUpdated, None, recorder(&log, "global"));

        registry.dispatch(&patch("conv_2"));
        registry.dispatch(&patch("conv_1"));
        assert_eq!(
            *log.lock(),
            vec![
                "global:conversation:updated",
                "scoped:conversation:updated",
                "global:conversation:updated"
            ]
        );
    }

    #[test]
    fn closed_registry_delivers_nothing() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = registry.register(EventKind::UserOnline, None, recorder(&log, "a"));
        registry.close();

        assert_eq!(registry.dispatch(&online("u1")), 0);
        let late = registry.register(EventKind::UserOnline, None, recorder(&log, "late"));
        assert_eq!(registry.handler_count(EventKind::UserOnline), 0);
        sub.release();
        late.release();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn handler_may_release_itself_during_dispatch() {
        let registry = HandlerRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_handler = slot.clone();
        let sub = registry.register(
            EventKind::UserOnline,
            None,
            Arc::new(move |_: &ServerEvent| {
                if let Some(sub) = slot_in_handler.lock().take() {
                    sub.release();
                }
            }),
        );
        *slot.lock() = Some(sub);

        assert_eq!(registry.dispatch(&online("u1")), 1);
        assert_eq!(registry.handler_count(EventKind::UserOnline), 0);
    }

    #[test]
    fn handler_released_by_earlier_handler_is_skipped() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let victim_in_handler = victim.clone();
        let log_in_handler = log.clone();
        let _first = registry.register(
            EventKind::UserOnline,
            None,
            Arc::new(move |_: &ServerEvent| {
                log_in_handler.lock().push("first".to_string());
                if let Some(sub) = victim_in_handler.lock().take() {
                    sub.release();
                }
            }),
        );
        *victim.lock() = Some(registry.register(
            EventKind::UserOnline,
            None,
            recorder(&log, "second"),
        ));

        assert_eq!(registry.dispatch(&online("u1")), 1);
        assert_eq!(*log.lock(), vec!["first"]);
        assert_eq!(registry.handler_count(EventKind::UserOnline), 1);
    }

    #[test]
    fn subscription_reports_its_scope() {
        let registry = HandlerRegistry::new();
        let sub = registry.register(
            EventKind::MessageNew,
            Some(ChannelId::from("conv_7")),
            Arc::new(|_: &ServerEvent| {}),
        );
        assert_eq!(sub.event_name(), Some("message:new"));
        assert_eq!(sub.channel_scope(), Some(&ChannelId::from("conv_7")));
    }
}
