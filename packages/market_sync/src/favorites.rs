//! Optimistic favorites store.
//!
//! Confirmed membership only changes on a successful confirmation or an
//! authoritative `favorite:updated` event. A pending operation masks the
//! confirmed value while it is in flight, so rollback is just dropping it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::FavoritesApi;
use crate::error::SyncError;
use crate::models::EntityId;

const CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub entity_id: EntityId,
    pub kind: PendingKind,
    pub submitted_at: DateTime<Utc>,
}

/// Broadcast whenever the effective membership or pending flag of an entity
/// changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoriteChange {
    pub entity_id: EntityId,
    pub member: bool,
    pub pending: bool,
}

#[derive(Debug, Default)]
struct FavoriteSet {
    confirmed: HashSet<EntityId>,
    pending: HashMap<EntityId, PendingOperation>,
}

impl FavoriteSet {
    fn is_member(&self, entity_id: &EntityId) -> bool {
        match self.pending.get(entity_id) {
            Some(op) => op.kind == PendingKind::Add,
            None => self.confirmed.contains(entity_id),
        }
    }

    fn change(&self, entity_id: &EntityId) -> FavoriteChange {
        FavoriteChange {
            entity_id: entity_id.clone(),
            member: self.is_member(entity_id),
            pending: self.pending.contains_key(entity_id),
        }
    }
}

pub struct FavoriteStore {
    state: RwLock<FavoriteSet>,
    api: Arc<dyn FavoritesApi>,
    changes: broadcast::Sender<FavoriteChange>,
}

impl FavoriteStore {
    pub fn new(api: Arc<dyn FavoritesApi>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            state: RwLock::new(FavoriteSet::default()),
            api,
            changes,
        }
    }

    /// Effective membership: confirmed with any pending operation applied.
    pub fn is_member(&self, entity_id: &EntityId) -> bool {
        self.state.read().is_member(entity_id)
    }

    pub fn is_pending(&self, entity_id: &EntityId) -> bool {
        self.state.read().pending.contains_key(entity_id)
    }

    pub fn pending_operation(&self, entity_id: &EntityId) -> Option<PendingOperation> {
        self.state.read().pending.get(entity_id).cloned()
    }

    /// Effective members, sorted.
    pub fn members(&self) -> Vec<EntityId> {
        let state = self.state.read();
        let mut members: Vec<EntityId> = state
            .confirmed
            .iter()
            .chain(state.pending.keys())
            .filter(|id| state.is_member(id))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        members.sort();
        members
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FavoriteChange> {
        self.changes.subscribe()
    }

    /// Replace the confirmed set. Pending operations keep masking their
    /// entities until they settle.
    pub fn load(&self, ids: impl IntoIterator<Item = EntityId>) {
        let mut state = self.state.write();
        state.confirmed = ids.into_iter().collect();
        info!(count = state.confirmed.len(), "favorites loaded");
    }

    /// Reload the confirmed set from the server.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let ids = self.api.fetch_favorite_ids().await?;
        let count = ids.len();
        self.load(ids);
        Ok(count)
    }

    /// Apply a server-side correction (last writer wins).
    pub fn apply_authoritative(&self, entity_id: &EntityId, favorited: bool) {
        let change = {
            let mut state = self.state.write();
            let before = state.is_member(entity_id);
            if favorited {
                state.confirmed.insert(entity_id.clone());
            } else {
                state.confirmed.remove(entity_id);
            }
            if state.pending.contains_key(entity_id) {
                debug!(entity = %entity_id, favorited, "correction masked by pending toggle");
            }
            (state.is_member(entity_id) != before).then(|| state.change(entity_id))
        };
        if let Some(change) = change {
            self.notify(change);
        }
    }

    /// Flip membership of `entity_id` optimistically and confirm it remotely.
    ///
    /// Returns the confirmed membership. While a toggle for the same entity is
    /// in flight this fails immediately with `OperationConflict` and makes no
    /// remote call. On confirmation failure the effective membership returns
    /// to its pre-toggle value and the error is returned.
    pub async fn toggle(&self, entity_id: &EntityId) -> Result<bool, SyncError> {
        let (previous, change) = {
            let mut state = self.state.write();
            if state.pending.contains_key(entity_id) {
                debug!(entity = %entity_id, "toggle rejected, operation pending");
                return Err(SyncError::OperationConflict {
                    entity_id: entity_id.clone(),
                });
            }
            let previous = state.is_member(entity_id);
            let kind = if previous {
                PendingKind::Remove
            } else {
                PendingKind::Add
            };
            state.pending.insert(
                entity_id.clone(),
                PendingOperation {
                    entity_id: entity_id.clone(),
                    kind,
                    submitted_at: Utc::now(),
                },
            );
            (previous, state.change(entity_id))
        };
        self.notify(change);

        let mut guard = SettleOnDrop {
            store: self,
            entity_id,
            armed: true,
        };
        let result = self.api.confirm_toggle(entity_id, previous).await;
        guard.armed = false;

        match result {
            Ok(()) => {
                let change = {
                    let mut state = self.state.write();
                    if let Some(op) = state.pending.remove(entity_id) {
                        match op.kind {
                            PendingKind::Add => state.confirmed.insert(entity_id.clone()),
                            PendingKind::Remove => state.confirmed.remove(entity_id),
                        };
                    }
                    state.change(entity_id)
                };
                debug!(entity = %entity_id, member = change.member, "toggle confirmed");
                let member = change.member;
                self.notify(change);
                Ok(member)
            }
            Err(err) => {
                self.rollback(entity_id);
                warn!(entity = %entity_id, "toggle rolled back: {}", err);
                Err(err)
            }
        }
    }

    fn rollback(&self, entity_id: &EntityId) {
        let change = {
            let mut state = self.state.write();
            state.pending.remove(entity_id);
            state.change(entity_id)
        };
        self.notify(change);
    }

    fn notify(&self, change: FavoriteChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }
}

/// Rolls back the pending operation if the toggle future is dropped before
/// the confirmation resolves.
struct SettleOnDrop<'a> {
    store: &'a FavoriteStore,
    entity_id: &'a EntityId,
    armed: bool,
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(entity = %self.entity_id, "toggle cancelled, rolling back");
            self.store.rollback(self.entity_id);
        }
    }
}
