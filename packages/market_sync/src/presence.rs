use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;

use crate::models::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Online/offline state per user, driven by `user:online` / `user:offline`.
#[derive(Default)]
pub struct PresenceTracker {
    entries: RwLock<HashMap<UserId, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, user_id: &UserId) {
        self.set(user_id, true, Utc::now());
    }

    pub fn set_offline(&self, user_id: &UserId) {
        self.set(user_id, false, Utc::now());
    }

    /// Record an event observed at `at`. Last event wins.
    pub fn set(&self, user_id: &UserId, online: bool, at: DateTime<Utc>) {
        trace!(user = %user_id, online, "presence");
        self.entries.write().insert(
            user_id.clone(),
            PresenceEntry {
                user_id: user_id.clone(),
                online,
                last_seen: at,
            },
        );
    }

    /// Unknown users are offline.
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.entries
            .read()
            .get(user_id)
            .is_some_and(|entry| entry.online)
    }

    pub fn entry(&self, user_id: &UserId) -> Option<PresenceEntry> {
        self.entries.read().get(user_id).cloned()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .read()
            .values()
            .filter(|e| e.online)
            .map(|e| e.user_id.clone())
            .collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::at;

    #[test]
    fn unknown_users_are_offline() {
        let presence = PresenceTracker::new();
        assert!(!presence.is_online(&UserId::from("ghost")));
        assert!(presence.entry(&UserId::from("ghost")).is_none());
    }

    #[test]
    fn last_event_wins_and_updates_last_seen() {
        let presence = PresenceTracker::new();
        let user = UserId::from("u1");

        presence.set(&user, true, at(0));
        presence.set(&user, true, at(5));
        assert!(presence.is_online(&user));
        assert_eq!(presence.entry(&user).unwrap().last_seen, at(5));

        presence.set(&user, false, at(9));
        assert!(!presence.is_online(&user));
        assert_eq!(presence.entry(&user).unwrap().last_seen, at(9));
    }

    #[test]
    fn online_users_are_sorted() {
        let presence = PresenceTracker::new();
        presence.set_online(&UserId::from("zed"));
        presence.set_online(&UserId::from("amy"));
        presence.set_online(&UserId::from("bob"));
        presence.set_offline(&UserId::from("bob"));
        assert_eq!(
            presence.online_users(),
            vec![UserId::from("amy"), UserId::from("zed")]
        );
    }
}
