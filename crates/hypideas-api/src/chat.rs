use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hypideas_backend::{Backend, Error, Filter, Mutation, Op, Query, fetch_all, fetch_lenient, fetch_optional, write, write_one};
use hypideas_state::reactions::ReactionTally;
use hypideas_state::timeline::PageCursor;
use hypideas_state::typing::TYPING_EXPIRY_SECS;
use hypideas_types::ValidationError;
use hypideas_types::api::{MAX_MESSAGE_LENGTH, NewFileMessage, NewMessage};
use hypideas_types::models::{
    ChatTarget, Conversation, Message, MessageKind, MessageReaction, PresenceStatus, WorldChannel,
};

use crate::{Api, Result};

pub(crate) const MESSAGE_COLUMNS: &str = "*, users(id, username, display_name, avatar_url), \
     reply_to:reply_to_message_id(id, content, message_type, users(id, username, display_name))";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl<B: Backend> Api<B> {
    /// Up to `limit` messages before `before` (or the newest ones),
    /// returned oldest first.
    pub async fn fetch_messages(
        &self,
        target: ChatTarget,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut query = Query::table("messages")
            .select(MESSAGE_COLUMNS)
            .eq(target.column(), target.id().to_string())
            .eq("is_deleted", false)
            .order("created_at", false)
            .order("id", false)
            .limit(limit);
        if let Some(cursor) = before {
            let at = timestamp(cursor.created_at);
            query = query.or(vec![
                Filter::cmp("created_at", Op::Lt, at.clone()),
                Filter::And(vec![
                    Filter::eq("created_at", at),
                    Filter::cmp("id", Op::Lt, cursor.id.to_string()),
                ]),
            ]);
        }
        let mut page: Vec<Message> = fetch_lenient(self.backend(), &query).await?;
        page.reverse();
        Ok(page)
    }

    pub async fn send_message(&self, message: NewMessage) -> Result<Message> {
        message.validate()?;
        let mut row = json!({
            "sender_id": self.me.id,
            "content": message.content.trim(),
            "message_type": MessageKind::Text,
            "reply_to_message_id": message.reply_to_message_id,
        });
        row[message.target.column()] = json!(message.target.id());
        self.insert_message(message.target, row).await
    }

    /// Upload a file to chat storage and post it as an image or file
    /// message.
    pub async fn send_file(&self, file: NewFileMessage) -> Result<Message> {
        file.validate()?;
        let path = format!(
            "chat-files/{}/{}.{}",
            self.me.id,
            Utc::now().timestamp_millis(),
            file.extension()
        );
        let url = self
            .backend()
            .upload(&self.bucket, &path, Bytes::from(file.bytes), &file.mime)
            .await?;
        debug!("Uploaded {} to {}", file.file_name, path);

        let mut row = json!({
            "sender_id": self.me.id,
            "content": file.file_name,
            "message_type": MessageKind::for_mime(&file.mime),
            "file_url": url,
            "file_name": file.file_name,
            "file_type": file.mime,
        });
        row[file.target.column()] = json!(file.target.id());
        self.insert_message(file.target, row).await
    }

    async fn insert_message(&self, target: ChatTarget, row: Value) -> Result<Message> {
        let mut message: Message = write_one(self.backend(), Mutation::insert("messages", row)).await?;
        message.author.get_or_insert_with(|| self.me.clone());
        if let ChatTarget::Direct(conversation_id) = target {
            self.touch_conversation(conversation_id, message.created_at).await;
        }
        Ok(message)
    }

    /// The message is already stored at this point; a failed timestamp
    /// update only affects inbox ordering and is not rolled back.
    async fn touch_conversation(&self, conversation_id: Uuid, at: DateTime<Utc>) {
        let update = Mutation::update("conversations", json!({ "last_message_at": timestamp(at) }))
            .eq("id", conversation_id.to_string());
        if let Err(e) = write(self.backend(), update).await {
            warn!("Conversation {} last_message_at not updated: {}", conversation_id, e);
        }
    }

    pub async fn edit_message(&self, message_id: Uuid, content: &str) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::Required("message").into());
        }
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(ValidationError::TooLong {
                field: "message",
                max: MAX_MESSAGE_LENGTH,
            }
            .into());
        }
        let update = Mutation::update(
            "messages",
            json!({ "content": content, "is_edited": true, "edited_at": timestamp(Utc::now()) }),
        )
        .eq("id", message_id.to_string())
        .eq("sender_id", self.me.id.to_string());
        write_one(self.backend(), update).await
    }

    /// Soft delete one of the caller's own messages.
    pub async fn delete_message(&self, message_id: Uuid) -> Result<()> {
        let update = Mutation::update("messages", json!({ "is_deleted": true }))
            .eq("id", message_id.to_string())
            .eq("sender_id", self.me.id.to_string());
        let _: Message = write_one(self.backend(), update).await?;
        Ok(())
    }

    pub async fn add_message_reaction(&self, message_id: Uuid, emoji: &str) -> Result<()> {
        if emoji.trim().is_empty() {
            return Err(ValidationError::Required("reaction").into());
        }
        let row = json!({ "message_id": message_id, "user_id": self.me.id, "reaction_type": emoji });
        write(
            self.backend(),
            Mutation::upsert("message_reactions", row, Some("message_id,user_id,reaction_type")),
        )
        .await
    }

    pub async fn remove_message_reaction(&self, message_id: Uuid, emoji: &str) -> Result<()> {
        let delete = Mutation::delete("message_reactions")
            .eq("message_id", message_id.to_string())
            .eq("user_id", self.me.id.to_string())
            .eq("reaction_type", emoji);
        write(self.backend(), delete).await
    }

    pub async fn message_reactions(&self, message_ids: &[Uuid]) -> Result<HashMap<Uuid, ReactionTally<String>>> {
        let mut tallies: HashMap<Uuid, ReactionTally<String>> = HashMap::new();
        if message_ids.is_empty() {
            return Ok(tallies);
        }
        let query = Query::table("message_reactions").in_list("message_id", message_ids.iter().map(Uuid::to_string));
        let rows: Vec<MessageReaction> = fetch_lenient(self.backend(), &query).await?;
        for row in rows {
            tallies
                .entry(row.message_id)
                .or_insert_with(|| ReactionTally::new(self.me.id))
                .apply(row.user_id, row.reaction_type, true);
        }
        Ok(tallies)
    }

    /// Announce or clear the caller's typing state in `target`. The
    /// indicator row expires on its own after a few seconds.
    pub async fn set_typing(&self, target: ChatTarget, typing: bool) -> Result<()> {
        let column = target.column();
        if typing {
            let mut row = json!({
                "user_id": self.me.id,
                "is_typing": true,
                "expires_at": timestamp(Utc::now() + Duration::seconds(TYPING_EXPIRY_SECS)),
            });
            row[column] = json!(target.id());
            let on_conflict = format!("user_id,{}", column);
            write(
                self.backend(),
                Mutation::upsert("typing_indicators", row, Some(&on_conflict)),
            )
            .await
        } else {
            let delete = Mutation::delete("typing_indicators")
                .eq(column, target.id().to_string())
                .eq("user_id", self.me.id.to_string());
            write(self.backend(), delete).await
        }
    }

    pub async fn update_presence(&self, status: PresenceStatus, custom_status: Option<&str>) -> Result<()> {
        let now = timestamp(Utc::now());
        let row = json!({
            "user_id": self.me.id,
            "status": status,
            "custom_status": custom_status,
            "last_seen": now,
            "updated_at": now,
        });
        write(self.backend(), Mutation::upsert("user_presence", row, Some("user_id"))).await
    }

    async fn find_conversation(&self, other: Uuid) -> Result<Option<Conversation>> {
        let (me, other) = (self.me.id.to_string(), other.to_string());
        let query = Query::table("conversations").or(vec![
            Filter::And(vec![
                Filter::eq("participant_1", me.clone()),
                Filter::eq("participant_2", other.clone()),
            ]),
            Filter::And(vec![Filter::eq("participant_1", other), Filter::eq("participant_2", me)]),
        ]);
        fetch_optional(self.backend(), &query).await
    }

    /// The direct conversation between the caller and `other`, whichever of
    /// them started it. Created on first use.
    pub async fn get_or_create_conversation(&self, other: Uuid) -> Result<Conversation> {
        if other == self.me.id {
            return Err(ValidationError::Invalid {
                field: "conversation",
                reason: "you cannot message yourself".into(),
            }
            .into());
        }
        if let Some(existing) = self.find_conversation(other).await? {
            return Ok(existing);
        }

        let row = json!({ "participant_1": self.me.id, "participant_2": other });
        match write_one(self.backend(), Mutation::insert("conversations", row)).await {
            Ok(created) => {
                info!("Started conversation with {}", other);
                Ok(created)
            }
            // Someone created it between our lookup and insert.
            Err(Error::Conflict(_)) => self
                .find_conversation(other)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conversation with {}", other))),
            Err(e) => Err(e),
        }
    }

    /// Active public channels, busiest first.
    pub async fn world_channels(&self) -> Result<Vec<WorldChannel>> {
        let query = Query::table("world_chat_channels")
            .select("id, name, description, icon_url, member_count")
            .eq("is_active", true)
            .order("member_count", false);
        fetch_lenient(self.backend(), &query).await
    }

    /// The caller's direct conversations, most recently active first.
    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        let me = self.me.id.to_string();
        let query = Query::table("conversations")
            .or(vec![Filter::eq("participant_1", me.clone()), Filter::eq("participant_2", me)])
            .order("last_message_at", false);
        fetch_all(self.backend(), &query).await
    }

    pub async fn mark_read(&self, message_ids: &[Uuid]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let read_at = timestamp(Utc::now());
        let rows: Vec<Value> = message_ids
            .iter()
            .map(|id| json!({ "message_id": id, "user_id": self.me.id, "read_at": read_at }))
            .collect();
        write(
            self.backend(),
            Mutation::upsert("message_read_receipts", Value::Array(rows), Some("message_id,user_id")),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, user};
    use hypideas_types::api::MESSAGE_PAGE_SIZE;

    fn text(target: ChatTarget, content: &str) -> NewMessage {
        NewMessage {
            target,
            content: content.into(),
            reply_to_message_id: None,
        }
    }

    #[tokio::test]
    async fn pages_are_oldest_first_and_respect_cursor() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let channel = ChatTarget::Broadcast(Uuid::from_u128(100));
        for i in 0..5 {
            ada.send_message(text(channel, &format!("m{}", i))).await.unwrap();
        }
        let other = ChatTarget::Broadcast(Uuid::from_u128(101));
        ada.send_message(text(other, "elsewhere")).await.unwrap();

        let newest = ada.fetch_messages(channel, None, 3).await.unwrap();
        let contents: Vec<&str> = newest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(newest[0].author.as_ref().unwrap().id, ada.me().id);

        let older = ada
            .fetch_messages(channel, Some(PageCursor::of(&newest[0])), MESSAGE_PAGE_SIZE)
            .await
            .unwrap();
        let contents: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn shared_timestamp_at_page_boundary_is_not_skipped() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let channel = ChatTarget::Broadcast(Uuid::from_u128(100));
        let rows = (1..=3u128)
            .map(|n| {
                json!({
                    "id": Uuid::from_u128(n),
                    "channel_id": channel.id(),
                    "sender_id": ada.me().id,
                    "message_type": "text",
                    "content": format!("m{}", n),
                    "is_deleted": false,
                    "created_at": "2024-05-01T10:00:00Z",
                })
            })
            .collect();
        h.backend.seed("messages", rows);

        let newest = ada.fetch_messages(channel, None, 2).await.unwrap();
        let contents: Vec<&str> = newest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);

        let older = ada
            .fetch_messages(channel, Some(PageCursor::of(&newest[0])), 2)
            .await
            .unwrap();
        let contents: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1"]);
    }

    #[tokio::test]
    async fn deleted_messages_are_not_fetched() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let channel = ChatTarget::Broadcast(Uuid::from_u128(100));
        let m = ada.send_message(text(channel, "oops")).await.unwrap();

        assert!(bob.delete_message(m.id).await.unwrap_err().is_not_found());
        ada.delete_message(m.id).await.unwrap();
        assert!(ada.fetch_messages(channel, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_message_touches_conversation() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let convo = ada.get_or_create_conversation(bob.me().id).await.unwrap();
        assert!(convo.last_message_at.is_none());

        let sent = ada.send_message(text(ChatTarget::Direct(convo.id), "hi")).await.unwrap();
        let inbox = bob.conversations().await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].last_message_at, Some(sent.created_at));
    }

    #[tokio::test]
    async fn failed_conversation_touch_keeps_message() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let convo = ada.get_or_create_conversation(bob.me().id).await.unwrap();
        h.backend.fail_writes_to("conversations");

        let target = ChatTarget::Direct(convo.id);
        ada.send_message(text(target, "hi")).await.unwrap();
        assert_eq!(bob.fetch_messages(target, None, 10).await.unwrap().len(), 1);
        assert!(bob.conversations().await.unwrap()[0].last_message_at.is_none());
    }

    #[tokio::test]
    async fn conversation_found_from_either_side() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let first = ada.get_or_create_conversation(bob.me().id).await.unwrap();
        let second = bob.get_or_create_conversation(ada.me().id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.backend.rows("conversations").len(), 1);
        assert_eq!(second.other(bob.me().id), ada.me().id);

        let err = ada.get_or_create_conversation(ada.me().id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn file_messages_use_storage_path_and_kind() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let channel = ChatTarget::Broadcast(Uuid::from_u128(100));

        let image = ada
            .send_file(NewFileMessage {
                target: channel,
                file_name: "cat.png".into(),
                mime: "image/png".into(),
                bytes: vec![1, 2, 3],
            })
            .await
            .unwrap();
        assert_eq!(image.kind, MessageKind::Image);
        assert_eq!(image.content, "cat.png");
        let attachment = image.attachment.unwrap();
        let prefix = format!("memory://storage/chat-files/chat-files/{}/", ada.me().id);
        assert!(attachment.url.starts_with(&prefix), "{}", attachment.url);
        assert!(attachment.url.ends_with(".png"));

        let doc = ada
            .send_file(NewFileMessage {
                target: channel,
                file_name: "notes.pdf".into(),
                mime: "application/pdf".into(),
                bytes: vec![4],
            })
            .await
            .unwrap();
        assert_eq!(doc.kind, MessageKind::File);
    }

    #[tokio::test]
    async fn typing_rows_are_upserted_and_cleared() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let channel = ChatTarget::Broadcast(Uuid::from_u128(100));

        ada.set_typing(channel, true).await.unwrap();
        ada.set_typing(channel, true).await.unwrap();
        let rows = h.backend.rows("typing_indicators");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["channel_id"], json!(channel.id()));

        ada.set_typing(channel, false).await.unwrap();
        assert!(h.backend.rows("typing_indicators").is_empty());
    }

    #[tokio::test]
    async fn message_reactions_are_grouped() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let channel = ChatTarget::Broadcast(Uuid::from_u128(100));
        let m = ada.send_message(text(channel, "vote")).await.unwrap();

        ada.add_message_reaction(m.id, "👍").await.unwrap();
        bob.add_message_reaction(m.id, "👍").await.unwrap();
        bob.add_message_reaction(m.id, "👍").await.unwrap();
        bob.add_message_reaction(m.id, "🎉").await.unwrap();
        bob.remove_message_reaction(m.id, "🎉").await.unwrap();

        let tallies = ada.message_reactions(&[m.id]).await.unwrap();
        let tally = &tallies[&m.id];
        assert_eq!(tally.count(&"👍".to_string()), 2);
        assert!(tally.is_active(&"👍".to_string()));
        assert_eq!(tally.total(), 2);
    }

    #[tokio::test]
    async fn read_receipts_and_presence_upsert() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        ada.mark_read(&ids).await.unwrap();
        ada.mark_read(&ids).await.unwrap();
        assert_eq!(h.backend.rows("message_read_receipts").len(), 2);

        ada.update_presence(PresenceStatus::Online, None).await.unwrap();
        ada.update_presence(PresenceStatus::Away, Some("lunch")).await.unwrap();
        let presence = h.backend.rows("user_presence");
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0]["status"], json!("away"));
    }

    #[tokio::test]
    async fn world_channels_are_active_and_busiest_first() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        h.backend.seed(
            "world_chat_channels",
            vec![
                json!({ "id": Uuid::from_u128(10), "name": "quiet", "member_count": 3, "is_active": true }),
                json!({ "id": Uuid::from_u128(11), "name": "closed", "member_count": 90, "is_active": false }),
                json!({ "id": Uuid::from_u128(12), "name": "general", "member_count": 40, "is_active": true }),
                json!({ "id": Uuid::from_u128(13), "name": "new", "member_count": null, "is_active": true }),
            ],
        );

        let channels = ada.world_channels().await.unwrap();
        let names: Vec<&str> = channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["general", "quiet", "new"]);
        assert_eq!(channels[2].member_count, 0);
        assert_eq!(channels[0].target(), ChatTarget::Broadcast(Uuid::from_u128(12)));
    }
}
