//! Conversation summaries kept in sync with `conversation:updated` patches.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::api::ConversationsApi;
use crate::error::SyncError;
use crate::models::{ChannelId, ConversationPatch, ConversationSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Merged,
    /// No summary with that id; the patch was dropped.
    Discarded(SyncError),
}

struct Slot {
    /// Insertion sequence, used to break `updated_at` ties.
    seq: u64,
    summary: ConversationSummary,
}

#[derive(Default)]
struct Table {
    slots: HashMap<ChannelId, Slot>,
    next_seq: u64,
}

impl Table {
    fn insert_new(&mut self, summary: ConversationSummary) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(summary.id.clone(), Slot { seq, summary });
    }

    /// Replace in place (keeping the original sequence) or insert.
    fn upsert(&mut self, summary: ConversationSummary) {
        match self.slots.get_mut(&summary.id) {
            Some(slot) => slot.summary = summary,
            None => self.insert_new(summary),
        }
    }
}

pub struct ConversationStore {
    table: RwLock<Table>,
    api: Option<Arc<dyn ConversationsApi>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Store without a collaborator; [`ConversationStore::refresh`] fails.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            api: None,
        }
    }

    pub fn with_api(api: Arc<dyn ConversationsApi>) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            api: Some(api),
        }
    }

    /// Replace all summaries. Duplicate ids keep their first occurrence.
    pub fn load_initial(&self, summaries: impl IntoIterator<Item = ConversationSummary>) {
        let mut table = Table::default();
        let mut duplicates = 0usize;
        for summary in summaries {
            if table.slots.contains_key(&summary.id) {
                duplicates += 1;
                continue;
            }
            table.insert_new(summary);
        }
        if duplicates > 0 {
            debug!(duplicates, "ignored duplicate conversation ids");
        }
        info!(count = table.slots.len(), "conversations loaded");
        *self.table.write() = table;
    }

    /// Insert or replace one summary from an explicit fetch.
    pub fn upsert(&self, summary: ConversationSummary) {
        self.table.write().upsert(summary);
    }

    /// Merge a server patch field by field. Absent fields are left alone; a
    /// patch for an unknown conversation is discarded as drift.
    pub fn apply_update(&self, patch: &ConversationPatch) -> UpdateOutcome {
        let mut table = self.table.write();
        let Some(slot) = table.slots.get_mut(&patch.id) else {
            let err = SyncError::SyncDrift {
                entity: patch.id.to_string(),
            };
            warn!(channel = %patch.id, "discarding update: {}", err);
            return UpdateOutcome::Discarded(err);
        };

        let summary = &mut slot.summary;
        if let Some(unread) = patch.unread_count {
            summary.unread_count = unread;
        }
        if let Some(message) = &patch.last_message {
            if message.sent_at > summary.updated_at {
                summary.updated_at = message.sent_at;
            }
            summary.last_message = Some(message.clone());
        }
        debug!(channel = %patch.id, unread = summary.unread_count, "conversation updated");
        UpdateOutcome::Merged
    }

    /// Local read: reset the unread count. Returns false for unknown ids.
    pub fn mark_read(&self, id: &ChannelId) -> bool {
        match self.table.write().slots.get_mut(id) {
            Some(slot) => {
                slot.summary.unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ChannelId) -> Option<ConversationSummary> {
        self.table.read().slots.get(id).map(|s| s.summary.clone())
    }

    /// All summaries, most recently updated first; ties keep insertion order.
    pub fn list(&self) -> Vec<ConversationSummary> {
        let table = self.table.read();
        let mut slots: Vec<&Slot> = table.slots.values().collect();
        slots.sort_by(|a, b| {
            b.summary
                .updated_at
                .cmp(&a.summary.updated_at)
                .then(a.seq.cmp(&b.seq))
        });
        slots.into_iter().map(|s| s.summary.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_unread(&self) -> u32 {
        self.table
            .read()
            .slots
            .values()
            .map(|s| s.summary.unread_count)
            .fold(0u32, u32::saturating_add)
    }

    /// Fetch the conversation list and upsert every entry. Conversations not
    /// in the response are kept.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let Some(api) = &self.api else {
            return Err(SyncError::Config(
                "no conversations collaborator configured".to_string(),
            ));
        };
        let summaries = api.fetch_conversations().await?;
        let count = summaries.len();
        let mut table = self.table.write();
        for summary in summaries {
            table.upsert(summary);
        }
        info!(count, "conversations refreshed");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{MockApi, at, preview, summary};

    fn ids(list: &[ConversationSummary]) -> Vec<&str> {
        list.iter().map(|s| s.id.as_str()).collect()
    }

    fn unread_patch(id: &str, unread: u32) -> ConversationPatch {
        ConversationPatch {
            id: ChannelId::from(id),
            last_message: None,
            unread_count: Some(unread),
        }
    }

    #[test]
    fn unread_count_is_replaced() {
        let store = ConversationStore::new();
        store.load_initial([summary("conv_1", 0, 5)]);

        assert_eq!(store.apply_update(&unread_patch("conv_1", 0)), UpdateOutcome::Merged);
        assert_eq!(store.get(&ChannelId::from("conv_1")).unwrap().unread_count, 0);
    }

    #[test]
    fn absent_fields_are_untouched() {
        let store = ConversationStore::new();
        let mut original = summary("conv_1", 10, 2);
        original.last_message = Some(preview("m1", 10));
        store.load_initial([original.clone()]);

        store.apply_update(&ConversationPatch {
            id: ChannelId::from("conv_1"),
            last_message: None,
            unread_count: None,
        });
        assert_eq!(store.get(&original.id).unwrap(), original);
    }

    #[test]
    fn unknown_id_is_discarded_as_drift() {
        let store = ConversationStore::new();
        store.load_initial([summary("conv_1", 0, 1)]);

        let outcome = store.apply_update(&unread_patch("conv_404", 3));
        assert_eq!(
            outcome,
            UpdateOutcome::Discarded(SyncError::SyncDrift {
                entity: "conv_404".into()
            })
        );
        assert_eq!(store.len(), 1);
        assert!(store.get(&ChannelId::from("conv_404")).is_none());
    }

    #[test]
    fn last_message_advances_updated_at_but_never_backwards() {
        let store = ConversationStore::new();
        store.load_initial([summary("a", 100, 0), summary("b", 50, 0)]);

        let newer = ConversationPatch {
            id: ChannelId::from("b"),
            last_message: Some(preview("m2", 200)),
            unread_count: Some(1),
        };
        store.apply_update(&newer);
        assert_eq!(ids(&store.list()), vec!["b", "a"]);

        let older = ConversationPatch {
            id: ChannelId::from("b"),
            last_message: Some(preview("m0", 10)),
            unread_count: None,
        };
        store.apply_update(&older);
        let b = store.get(&ChannelId::from("b")).unwrap();
        assert_eq!(b.updated_at, at(200));
        assert_eq!(b.last_message.unwrap().id.as_str(), "m0");
    }

    #[test]
    fn applying_a_patch_twice_equals_once() {
        let store = ConversationStore::new();
        store.load_initial([summary("c", 0, 4)]);
        let patch = ConversationPatch {
            id: ChannelId::from("c"),
            last_message: Some(preview("m9", 30)),
            unread_count: Some(7),
        };
        store.apply_update(&patch);
        let once = store.list();
        store.apply_update(&patch);
        assert_eq!(store.list(), once);
    }

    #[test]
    fn list_orders_by_recency_with_stable_ties() {
        let store = ConversationStore::new();
        store.load_initial([
            summary("first", 10, 0),
            summary("second", 10, 0),
            summary("newest", 20, 0),
            summary("third", 10, 0),
        ]);
        assert_eq!(
            ids(&store.list()),
            vec!["newest", "first", "second", "third"]
        );
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let store = ConversationStore::new();
        store.load_initial([summary("dup", 1, 1), summary("dup", 2, 9)]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&ChannelId::from("dup")).unwrap().unread_count, 1);
    }

    #[test]
    fn mark_read_and_total_unread() {
        let store = ConversationStore::new();
        store.load_initial([summary("a", 0, 3), summary("b", 0, 4)]);
        assert_eq!(store.total_unread(), 7);

        assert!(store.mark_read(&ChannelId::from("a")));
        assert!(!store.mark_read(&ChannelId::from("zzz")));
        assert_eq!(store.total_unread(), 4);
    }

    #[test]
    fn upsert_keeps_position_among_ties() {
        let store = ConversationStore::new();
        store.load_initial([summary("a", 5, 0), summary("b", 5, 0)]);
        store.upsert(summary("a", 5, 2));
        store.upsert(summary("c", 5, 0));
        assert_eq!(ids(&store.list()), vec!["a", "b", "c"]);
        assert_eq!(store.get(&ChannelId::from("a")).unwrap().unread_count, 2);
    }

    #[tokio::test]
    async fn refresh_upserts_from_collaborator() {
        let api = MockApi::new();
        *api.conversations.lock() = vec![summary("a", 1, 9), summary("new", 2, 1)];
        let store = ConversationStore::with_api(api.clone());
        store.load_initial([summary("a", 1, 0), summary("kept", 0, 0)]);

        assert_eq!(store.refresh().await, Ok(2));
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&ChannelId::from("a")).unwrap().unread_count, 9);

        api.fail_fetches(true);
        assert!(matches!(store.refresh().await, Err(SyncError::Connection(_))));
    }

    #[tokio::test]
    async fn refresh_without_collaborator_fails() {
        let store = ConversationStore::new();
        assert!(store.refresh().await.is_err());
    }
}
