use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use uuid::Uuid;

use hypideas_types::models::{LegacyLike, PostReaction, ReactionType};

/// Reactions on one post, comment or message, as seen by `me`.
///
/// Each key keeps the set of users holding it, so replayed or duplicated
/// change events never move a count twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionTally<K: Ord> {
    me: Uuid,
    users: BTreeMap<K, BTreeSet<Uuid>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Added,
    Removed,
}

impl Toggle {
    pub fn added(self) -> bool {
        self == Toggle::Added
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionGroup<K> {
    pub key: K,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
    pub mine: bool,
}

impl<K: Ord + Clone> ReactionTally<K> {
    pub fn new(me: Uuid) -> Self {
        Self {
            me,
            users: BTreeMap::new(),
        }
    }

    pub fn from_pairs(me: Uuid, pairs: impl IntoIterator<Item = (Uuid, K)>) -> Self {
        let mut tally = Self::new(me);
        for (user, key) in pairs {
            tally.apply(user, key, true);
        }
        tally
    }

    pub fn me(&self) -> Uuid {
        self.me
    }

    pub fn count(&self, key: &K) -> usize {
        self.users.get(key).map_or(0, BTreeSet::len)
    }

    /// Whether `me` currently holds `key`.
    pub fn is_active(&self, key: &K) -> bool {
        self.users.get(key).is_some_and(|u| u.contains(&self.me))
    }

    /// Flip `me`'s state for `key`.
    pub fn toggle(&mut self, key: K) -> Toggle {
        if self.is_active(&key) {
            self.apply(self.me, key, false);
            Toggle::Removed
        } else {
            self.apply(self.me, key, true);
            Toggle::Added
        }
    }

    /// Record that `user` holds (`present`) or no longer holds `key`.
    /// Returns whether anything changed.
    pub fn apply(&mut self, user: Uuid, key: K, present: bool) -> bool {
        if present {
            self.users.entry(key).or_default().insert(user)
        } else {
            let Some(set) = self.users.get_mut(&key) else {
                return false;
            };
            let removed = set.remove(&user);
            if set.is_empty() {
                self.users.remove(&key);
            }
            removed
        }
    }

    /// Sum over all keys.
    pub fn total(&self) -> usize {
        self.users.values().map(BTreeSet::len).sum()
    }

    /// Keys `me` currently holds.
    pub fn mine(&self) -> Vec<K> {
        self.users
            .iter()
            .filter(|(_, users)| users.contains(&self.me))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn groups(&self) -> Vec<ReactionGroup<K>> {
        self.users
            .iter()
            .map(|(key, users)| ReactionGroup {
                key: key.clone(),
                count: users.len(),
                user_ids: users.iter().copied().collect(),
                mine: users.contains(&self.me),
            })
            .collect()
    }
}

/// Engagement on a post. Typed reactions are authoritative; a row in the
/// older `likes` table counts as a `like` reaction for its user unless that
/// user already holds a typed like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostEngagement {
    pub tally: ReactionTally<ReactionType>,
    legacy_likers: BTreeSet<Uuid>,
}

impl PostEngagement {
    pub fn from_rows(me: Uuid, typed: &[PostReaction], legacy: &[LegacyLike]) -> Self {
        let mut tally =
            ReactionTally::from_pairs(me, typed.iter().map(|r| (r.user_id, r.reaction_type)));
        let legacy_likers: BTreeSet<Uuid> = legacy.iter().map(|l| l.user_id).collect();
        for user in &legacy_likers {
            tally.apply(*user, ReactionType::Like, true);
        }
        Self {
            tally,
            legacy_likers,
        }
    }

    /// Whether `me` still has a row in the legacy table that an unlike must
    /// also remove.
    pub fn has_legacy_like(&self) -> bool {
        self.legacy_likers.contains(&self.tally.me())
    }

    /// Forget `me`'s legacy row once it has been deleted remotely.
    pub fn clear_legacy_like(&mut self) {
        let me = self.tally.me();
        self.legacy_likers.remove(&me);
    }

    pub fn total(&self) -> usize {
        self.tally.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_love_unlike_sequence() {
        let me = Uuid::new_v4();
        let mut tally = ReactionTally::new(me);

        assert_eq!(tally.toggle(ReactionType::Like), Toggle::Added);
        assert_eq!(tally.toggle(ReactionType::Love), Toggle::Added);
        assert_eq!(tally.toggle(ReactionType::Like), Toggle::Removed);

        assert_eq!(tally.count(&ReactionType::Love), 1);
        assert!(tally.is_active(&ReactionType::Love));
        assert_eq!(tally.count(&ReactionType::Like), 0);
        assert!(!tally.is_active(&ReactionType::Like));
        assert_eq!(tally.mine(), vec![ReactionType::Love]);
    }

    #[test]
    fn double_toggle_restores_state() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut tally = ReactionTally::from_pairs(me, [(other, "🔥".to_string())]);
        let before = tally.clone();

        tally.toggle("🔥".to_string());
        assert_eq!(tally.count(&"🔥".to_string()), 2);
        tally.toggle("🔥".to_string());
        assert_eq!(tally, before);
    }

    #[test]
    fn duplicate_remote_events_are_idempotent() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut tally = ReactionTally::new(me);

        assert!(tally.apply(other, ReactionType::Idea, true));
        assert!(!tally.apply(other, ReactionType::Idea, true));
        assert_eq!(tally.count(&ReactionType::Idea), 1);

        assert!(tally.apply(other, ReactionType::Idea, false));
        assert!(!tally.apply(other, ReactionType::Idea, false));
        assert_eq!(tally.total(), 0);
        assert!(tally.groups().is_empty());
    }

    #[test]
    fn legacy_likes_are_not_double_counted() {
        let me = Uuid::new_v4();
        let both = Uuid::new_v4();
        let legacy_only = Uuid::new_v4();
        let post_id = Uuid::new_v4();

        let typed = vec![
            PostReaction { post_id, user_id: both, reaction_type: ReactionType::Like },
            PostReaction { post_id, user_id: both, reaction_type: ReactionType::Fire },
        ];
        let legacy = vec![
            LegacyLike { post_id, user_id: both },
            LegacyLike { post_id, user_id: legacy_only },
            LegacyLike { post_id, user_id: me },
        ];

        let engagement = PostEngagement::from_rows(me, &typed, &legacy);
        assert_eq!(engagement.tally.count(&ReactionType::Like), 3);
        assert_eq!(engagement.total(), 4);
        assert!(engagement.tally.is_active(&ReactionType::Like));
        assert!(engagement.has_legacy_like());

        let groups = engagement.tally.groups();
        assert_eq!(groups[0].key, ReactionType::Like);
        assert!(groups[0].mine);
    }
}
