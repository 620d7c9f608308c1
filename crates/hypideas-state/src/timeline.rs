use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use hypideas_types::events::ChangeEvent;
use hypideas_types::models::Message;

/// Messages from one sender closer together than this share a header.
pub const HEADER_GAP_SECS: i64 = 5 * 60;

/// Messages of one conversation or channel, ascending by creation time and
/// unique by id.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
}

/// What applying a change did to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineChange {
    Inserted,
    Updated,
    Removed,
    Ignored,
}

fn sort_key(m: &Message) -> (DateTime<Utc>, Uuid) {
    (m.created_at, m.id)
}

/// Position in a chat's history. Messages sharing a timestamp are told apart
/// by id, so a page boundary never falls between two of them unseen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl PageCursor {
    pub fn of(message: &Message) -> Self {
        PageCursor {
            created_at: message.created_at,
            id: message.id,
        }
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    /// Cursor for the page before the oldest loaded message.
    pub fn oldest(&self) -> Option<PageCursor> {
        self.messages.first().map(PageCursor::of)
    }

    /// Merge a fetched page, in either order. Known ids and deleted rows are
    /// skipped. Returns how many messages were added.
    pub fn merge_page(&mut self, page: Vec<Message>) -> usize {
        let mut added = 0;
        for message in page {
            if message.is_deleted || self.ids.contains(&message.id) {
                continue;
            }
            self.insert_sorted(message);
            added += 1;
        }
        added
    }

    /// Apply one realtime change. Duplicate inserts collapse into one entry,
    /// updates that arrive before their insert are inserted, and soft
    /// deletes remove the message.
    pub fn apply(&mut self, event: ChangeEvent<Message>) -> TimelineChange {
        match event {
            ChangeEvent::Insert(message) | ChangeEvent::Update(message) => {
                if message.is_deleted {
                    return self.remove(message.id);
                }
                self.upsert(message)
            }
            ChangeEvent::Delete(key) => self.remove(key.id),
        }
    }

    fn upsert(&mut self, message: Message) -> TimelineChange {
        if !self.ids.contains(&message.id) {
            self.insert_sorted(message);
            return TimelineChange::Inserted;
        }

        let Some(pos) = self.messages.iter().position(|m| m.id == message.id) else {
            self.ids.remove(&message.id);
            self.insert_sorted(message);
            return TimelineChange::Inserted;
        };

        if self.messages[pos] == message {
            debug!("Ignoring duplicate delivery of message {}", message.id);
            return TimelineChange::Ignored;
        }

        let mut merged = message;
        // Realtime rows carry no embedded author; keep what the page query had.
        if merged.author.is_none() {
            merged.author = self.messages[pos].author.take();
        }
        if merged.reply_to.is_none() && merged.reply_to_message_id.is_some() {
            merged.reply_to = self.messages[pos].reply_to.take();
        }

        if sort_key(&self.messages[pos]) == sort_key(&merged) {
            self.messages[pos] = merged;
        } else {
            self.messages.remove(pos);
            self.ids.remove(&merged.id);
            self.insert_sorted(merged);
        }
        TimelineChange::Updated
    }

    fn remove(&mut self, id: Uuid) -> TimelineChange {
        if !self.ids.remove(&id) {
            return TimelineChange::Ignored;
        }
        self.messages.retain(|m| m.id != id);
        TimelineChange::Removed
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = sort_key(&message);
        let pos = self.messages.partition_point(|m| sort_key(m) < key);
        self.ids.insert(message.id);
        self.messages.insert(pos, message);
    }

    /// Rows for rendering, with the header/avatar grouping rule applied.
    pub fn display_rows(&self, me: Uuid) -> Vec<DisplayRow<'_>> {
        let gap = Duration::seconds(HEADER_GAP_SECS);
        self.messages
            .iter()
            .enumerate()
            .map(|(i, message)| {
                let is_own = message.sender_id == me;
                let starts_group = match i.checked_sub(1).map(|p| &self.messages[p]) {
                    None => true,
                    Some(prev) => {
                        prev.sender_id != message.sender_id
                            || message.created_at - prev.created_at > gap
                    }
                };
                DisplayRow {
                    message,
                    is_own,
                    show_avatar: !is_own && starts_group,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayRow<'a> {
    pub message: &'a Message,
    pub is_own: bool,
    pub show_avatar: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hypideas_types::events::RowId;
    use hypideas_types::models::{ChatTarget, MessageKind};

    fn message(id: u128, sender: u128, minute: u32, second: u32) -> Message {
        Message {
            id: Uuid::from_u128(id),
            target: ChatTarget::Direct(Uuid::from_u128(77)),
            sender_id: Uuid::from_u128(sender),
            kind: MessageKind::Text,
            content: format!("m{}", id),
            attachment: None,
            reply_to_message_id: None,
            reply_to: None,
            reactions: Default::default(),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, second).unwrap(),
            author: None,
        }
    }

    fn ids(t: &Timeline) -> Vec<u128> {
        t.messages().iter().map(|m| m.id.as_u128()).collect()
    }

    #[test]
    fn pages_concatenate_without_gaps_or_duplicates() {
        let all: Vec<Message> = (0..10).map(|i| message(i, 1, i as u32, 0)).collect();

        // Newest-first pages of 4 as the backend returns them.
        let mut desc = all.clone();
        desc.reverse();
        let mut timeline = Timeline::new();
        for page in desc.chunks(4) {
            timeline.merge_page(page.to_vec());
        }
        assert_eq!(ids(&timeline), (0..10).collect::<Vec<_>>());

        // Overlapping refetch adds nothing.
        assert_eq!(timeline.merge_page(desc[..3].to_vec()), 0);
        assert_eq!(timeline.len(), 10);
        assert_eq!(timeline.oldest(), Some(PageCursor::of(&all[0])));
    }

    #[test]
    fn duplicate_insert_is_rendered_once() {
        let mut timeline = Timeline::new();
        let m = message(1, 1, 0, 0);
        assert_eq!(timeline.apply(ChangeEvent::Insert(m.clone())), TimelineChange::Inserted);
        assert_eq!(timeline.apply(ChangeEvent::Insert(m)), TimelineChange::Ignored);
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn out_of_order_events_are_sorted() {
        let mut timeline = Timeline::new();
        timeline.apply(ChangeEvent::Insert(message(3, 1, 3, 0)));
        timeline.apply(ChangeEvent::Update(message(1, 1, 1, 0)));
        timeline.apply(ChangeEvent::Insert(message(2, 2, 2, 0)));
        assert_eq!(ids(&timeline), vec![1, 2, 3]);

        let mut edited = message(2, 2, 2, 0);
        edited.content = "edited".into();
        edited.is_edited = true;
        assert_eq!(timeline.apply(ChangeEvent::Update(edited)), TimelineChange::Updated);
        assert_eq!(timeline.get(Uuid::from_u128(2)).unwrap().content, "edited");

        let mut deleted = message(3, 1, 3, 0);
        deleted.is_deleted = true;
        assert_eq!(timeline.apply(ChangeEvent::Update(deleted)), TimelineChange::Removed);
        assert_eq!(
            timeline.apply(ChangeEvent::Delete(RowId { id: Uuid::from_u128(1) })),
            TimelineChange::Removed
        );
        assert_eq!(ids(&timeline), vec![2]);
    }

    #[test]
    fn update_keeps_embedded_author() {
        let mut timeline = Timeline::new();
        let mut m = message(1, 1, 0, 0);
        m.author = Some(hypideas_types::models::Profile {
            id: m.sender_id,
            username: Some("ada".into()),
            display_name: None,
            avatar_url: None,
        });
        timeline.merge_page(vec![m.clone()]);

        let mut update = message(1, 1, 0, 0);
        update.content = "changed".into();
        timeline.apply(ChangeEvent::Update(update));
        assert_eq!(timeline.get(m.id).unwrap().author, m.author);
    }

    #[test]
    fn avatar_grouping() {
        let me = Uuid::from_u128(9);
        let mut timeline = Timeline::new();
        timeline.merge_page(vec![
            message(6, 9, 20, 0),
            message(5, 1, 12, 0),
            message(4, 1, 4, 0),
            message(3, 2, 3, 0),
            message(2, 1, 1, 0),
            message(1, 1, 0, 0),
        ]);
        let avatars: Vec<bool> = timeline.display_rows(me).iter().map(|r| r.show_avatar).collect();
        // Same sender within 5 minutes groups; a new sender or a >5 minute gap
        // starts a new group; own messages never show an avatar.
        assert_eq!(avatars, vec![true, false, true, true, true, false]);
    }
}
