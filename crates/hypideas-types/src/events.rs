use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RowError;
use crate::models::{ChatTarget, Message, MessageReaction, TargetColumns, TypingIndicator};

/// Kind of row change delivered by the realtime feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change as delivered on the wire, before it is parsed into a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: serde_json::Value,
    #[serde(default)]
    pub old_record: serde_json::Value,
}

impl RawChange {
    pub fn insert(table: &str, record: serde_json::Value) -> Self {
        RawChange {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            record,
            old_record: serde_json::Value::Null,
        }
    }

    pub fn update(table: &str, record: serde_json::Value, old_record: serde_json::Value) -> Self {
        RawChange {
            table: table.to_string(),
            kind: ChangeKind::Update,
            record,
            old_record,
        }
    }

    pub fn delete(table: &str, old_record: serde_json::Value) -> Self {
        RawChange {
            table: table.to_string(),
            kind: ChangeKind::Delete,
            record: serde_json::Value::Null,
            old_record,
        }
    }

    /// Parse into a typed change. Deletes only carry the old row, which may
    /// be partial (primary key only), so they decode into `T::Key`.
    pub fn decode<T: ChangeRecord>(&self) -> Result<ChangeEvent<T>, RowError> {
        match self.kind {
            ChangeKind::Insert => Ok(ChangeEvent::Insert(decode_row(&self.record)?)),
            ChangeKind::Update => Ok(ChangeEvent::Update(decode_row(&self.record)?)),
            ChangeKind::Delete => Ok(ChangeEvent::Delete(decode_row(&self.old_record)?)),
        }
    }
}

fn decode_row<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, RowError> {
    serde_json::from_value(value.clone()).map_err(|e| RowError::Malformed(e.to_string()))
}

/// Records that can arrive through the change feed.
pub trait ChangeRecord: DeserializeOwned {
    /// What a delete event identifies the removed row by.
    type Key: DeserializeOwned;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T: ChangeRecord> {
    Insert(T),
    Update(T),
    Delete(T::Key),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RowId {
    pub id: Uuid,
}

impl ChangeRecord for Message {
    type Key = RowId;
}

/// Typing deletes identify the user, plus the chat when the old row
/// carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TypingKey {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub chat: TargetColumns,
}

impl TypingKey {
    pub fn user(user_id: Uuid) -> Self {
        TypingKey {
            user_id,
            chat: TargetColumns::default(),
        }
    }

    /// True when the old row names a chat other than `target`. A key without
    /// chat columns matches every chat.
    pub fn names_other_chat(&self, target: ChatTarget) -> bool {
        match ChatTarget::try_from(self.chat) {
            Ok(chat) => chat != target,
            Err(_) => false,
        }
    }
}

impl ChangeRecord for TypingIndicator {
    type Key = TypingKey;
}

impl ChangeRecord for MessageReaction {
    type Key = MessageReaction;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_change_uses_wire_names() {
        let change: RawChange = serde_json::from_value(json!({
            "table": "messages",
            "type": "DELETE",
            "old_record": { "id": "8b0d7e0c-3c1e-4a55-9a0e-6a7d9f9d1c11" }
        }))
        .unwrap();
        assert_eq!(change.kind, ChangeKind::Delete);
        match change.decode::<Message>().unwrap() {
            ChangeEvent::Delete(key) => {
                assert_eq!(key.id.to_string(), "8b0d7e0c-3c1e-4a55-9a0e-6a7d9f9d1c11")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_record_is_an_error() {
        let change = RawChange::insert("messages", json!({ "id": "not-a-uuid" }));
        assert!(change.decode::<Message>().is_err());
    }

    #[test]
    fn typing_key_reads_chat_from_old_row() {
        let channel = Uuid::from_u128(7);
        let change: RawChange = serde_json::from_value(json!({
            "table": "typing_indicators",
            "type": "DELETE",
            "old_record": { "user_id": Uuid::from_u128(2), "channel_id": channel }
        }))
        .unwrap();
        let ChangeEvent::Delete(key) = change.decode::<TypingIndicator>().unwrap() else {
            panic!("expected a delete");
        };
        assert!(!key.names_other_chat(ChatTarget::Broadcast(channel)));
        assert!(key.names_other_chat(ChatTarget::Broadcast(Uuid::from_u128(8))));
        assert!(!TypingKey::user(Uuid::from_u128(2)).names_other_chat(ChatTarget::Direct(channel)));
    }
}
