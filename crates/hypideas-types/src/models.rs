use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RowError;

/// Public profile fields, embedded into other rows under the `users` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Name shown in notifications and typing summaries.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or("Someone")
    }
}

// -- Posts --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_pinned: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_deleted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub likes_count: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub comments_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "users", skip_serializing_if = "Option::is_none")]
    pub author: Option<Profile>,
}

// -- Comments --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub parent_comment_id: Option<Uuid>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub depth: u8,
    #[serde(default)]
    pub thread_root_id: Option<Uuid>,
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reaction_counts: BTreeMap<String, u32>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "users", skip_serializing_if = "Option::is_none")]
    pub author: Option<Profile>,
}

// -- Reactions --

/// Typed reactions available on posts and comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionType {
    Like,
    Love,
    Idea,
    Fire,
}

impl ReactionType {
    pub const ALL: [ReactionType; 4] = [Self::Like, Self::Love, Self::Idea, Self::Fire];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Love => "love",
            Self::Idea => "idea",
            Self::Fire => "fire",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Like => "👍",
            Self::Love => "❤️",
            Self::Idea => "💡",
            Self::Fire => "🔥",
        }
    }
}

impl fmt::Display for ReactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReactionType {
    type Err = RowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "like" => Ok(Self::Like),
            "love" => Ok(Self::Love),
            "idea" => Ok(Self::Idea),
            "fire" => Ok(Self::Fire),
            other => Err(RowError::UnknownVariant {
                field: "reaction_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostReaction {
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub reaction_type: ReactionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentReaction {
    pub comment_id: Uuid,
    pub user_id: Uuid,
    pub reaction_type: ReactionType,
}

/// Row of the older binary `likes` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyLike {
    pub post_id: Uuid,
    pub user_id: Uuid,
}

/// Message reactions are keyed by a free-form emoji string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub reaction_type: String,
}

// -- Chat --

/// Where a message or typing indicator lives. The backend stores this as two
/// nullable columns; exactly one of them is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatTarget {
    Direct(Uuid),
    Broadcast(Uuid),
}

impl ChatTarget {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Direct(id) | Self::Broadcast(id) => *id,
        }
    }

    /// Foreign-key column holding this target's id.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Direct(_) => "conversation_id",
            Self::Broadcast(_) => "channel_id",
        }
    }

    /// Realtime topic name for this chat.
    pub fn topic(&self) -> String {
        format!("chat_{}", self.id())
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }
}

/// Public channel anyone can broadcast to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldChannel {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub member_count: u32,
}

impl WorldChannel {
    pub fn target(&self) -> ChatTarget {
        ChatTarget::Broadcast(self.id)
    }
}

/// Raw column pair as it appears in `messages` and `typing_indicators` rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumns {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub channel_id: Option<Uuid>,
}

impl TryFrom<TargetColumns> for ChatTarget {
    type Error = RowError;

    fn try_from(cols: TargetColumns) -> Result<Self, Self::Error> {
        match (cols.conversation_id, cols.channel_id) {
            (Some(id), None) => Ok(ChatTarget::Direct(id)),
            (None, Some(id)) => Ok(ChatTarget::Broadcast(id)),
            (Some(_), Some(_)) => Err(RowError::AmbiguousTarget),
            (None, None) => Err(RowError::MissingTarget),
        }
    }
}

impl From<ChatTarget> for TargetColumns {
    fn from(target: ChatTarget) -> Self {
        match target {
            ChatTarget::Direct(id) => TargetColumns {
                conversation_id: Some(id),
                channel_id: None,
            },
            ChatTarget::Broadcast(id) => TargetColumns {
                conversation_id: None,
                channel_id: Some(id),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn for_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else {
            Self::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub mime: String,
}

/// Short form of a replied-to message, embedded under `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: Uuid,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, rename = "users")]
    pub author: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub target: ChatTarget,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub reply_to_message_id: Option<Uuid>,
    pub reply_to: Option<ReplyPreview>,
    pub reactions: BTreeMap<String, u32>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub author: Option<Profile>,
}

/// Wire shape of a `messages` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: Uuid,
    #[serde(flatten)]
    pub target: TargetColumns,
    #[serde(default)]
    pub sender_id: Option<Uuid>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reactions: BTreeMap<String, u32>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "users", skip_serializing_if = "Option::is_none")]
    pub author: Option<Profile>,
}

impl TryFrom<MessageRow> for Message {
    type Error = RowError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let target = ChatTarget::try_from(row.target)?;
        // Embedded selects sometimes omit sender_id but carry the author.
        let sender_id = row
            .sender_id
            .or_else(|| row.author.as_ref().map(|a| a.id))
            .ok_or(RowError::MissingField("sender_id"))?;

        let attachment = match (row.file_url, row.message_type) {
            (Some(url), MessageKind::Image | MessageKind::File) => Some(Attachment {
                url,
                name: row.file_name.unwrap_or_default(),
                mime: row.file_type.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Message {
            id: row.id,
            target,
            sender_id,
            kind: row.message_type,
            content: row.content.unwrap_or_default(),
            attachment,
            reply_to_message_id: row.reply_to_message_id,
            reply_to: row.reply_to,
            reactions: row.reactions,
            is_edited: row.is_edited,
            edited_at: row.edited_at,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            author: row.author,
        })
    }
}

impl From<Message> for MessageRow {
    fn from(m: Message) -> Self {
        let (file_url, file_name, file_type) = match m.attachment {
            Some(a) => (Some(a.url), Some(a.name), Some(a.mime)),
            None => (None, None, None),
        };
        MessageRow {
            id: m.id,
            target: m.target.into(),
            sender_id: Some(m.sender_id),
            message_type: m.kind,
            content: Some(m.content),
            file_url,
            file_name,
            file_type,
            reply_to_message_id: m.reply_to_message_id,
            reply_to: m.reply_to,
            reactions: m.reactions,
            is_edited: m.is_edited,
            edited_at: m.edited_at,
            is_deleted: m.is_deleted,
            created_at: m.created_at,
            author: m.author,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MessageRow::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let row = MessageRow::deserialize(deserializer)?;
        Message::try_from(row).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_1: Uuid,
    pub participant_2: Uuid,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn includes(&self, user_id: Uuid) -> bool {
        self.participant_1 == user_id || self.participant_2 == user_id
    }

    /// The participant that is not `me`.
    pub fn other(&self, me: Uuid) -> Uuid {
        if self.participant_1 == me {
            self.participant_2
        } else {
            self.participant_1
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypingIndicator {
    pub target: ChatTarget,
    pub user_id: Uuid,
    pub is_typing: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRow {
    #[serde(flatten)]
    pub target: TargetColumns,
    pub user_id: Uuid,
    #[serde(default = "default_true")]
    pub is_typing: bool,
    pub expires_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl TryFrom<TypingRow> for TypingIndicator {
    type Error = RowError;

    fn try_from(row: TypingRow) -> Result<Self, Self::Error> {
        Ok(TypingIndicator {
            target: ChatTarget::try_from(row.target)?,
            user_id: row.user_id,
            is_typing: row.is_typing,
            expires_at: row.expires_at,
        })
    }
}

impl Serialize for TypingIndicator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TypingRow {
            target: self.target.into(),
            user_id: self.user_id,
            is_typing: self.is_typing,
            expires_at: self.expires_at,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TypingIndicator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let row = TypingRow::deserialize(deserializer)?;
        TypingIndicator::try_from(row).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    #[serde(default)]
    pub custom_status: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

// -- Notifications --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    PostReaction,
    CommentReaction,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// -- Admin --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminUser {
    pub role: String,
    #[serde(default)]
    pub permissions: serde_json::Value,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanType {
    Temporary,
    Permanent,
    Shadow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBan {
    pub user_id: Uuid,
    pub ban_type: BanType,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub banned_by: Option<Uuid>,
    #[serde(default)]
    pub banned_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl UserBan {
    /// A ban is in force while active and not past its end time.
    pub fn in_force(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.banned_until.is_none_or(|until| until > now)
    }
}

/// Row returned by the admin user listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedUser {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub posts_count: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub followers_count: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_bans: Vec<UserBan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Post,
    Comment,
}

impl ContentKind {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Post => "posts",
            Self::Comment => "comments",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationItem {
    pub id: Uuid,
    pub content_type: String,
    pub content_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub status: ModerationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub action_taken: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminActionLog {
    pub id: Uuid,
    pub admin_id: Uuid,
    pub action_type: String,
    pub target_type: String,
    pub target_id: Uuid,
    #[serde(default)]
    pub old_values: serde_json::Value,
    #[serde(default)]
    pub new_values: serde_json::Value,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub announcement_type: String,
    pub target_audience: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
}

/// Result of the `get_platform_stats` RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformStats {
    #[serde(default)]
    pub total_users: u64,
    #[serde(default)]
    pub new_users: u64,
    #[serde(default)]
    pub total_posts: u64,
    #[serde(default)]
    pub new_posts: u64,
    #[serde(default)]
    pub total_comments: u64,
    #[serde(default)]
    pub active_users: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub database: HealthStatus,
    pub storage: HealthStatus,
    pub auth: HealthStatus,
    pub realtime: HealthStatus,
    pub overall: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub value: u32,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
