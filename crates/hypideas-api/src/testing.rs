//! Shared fixtures: a memory backend whose writes feed a local change feed.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use hypideas_backend::Error;
use hypideas_backend::memory::{MemoryBackend, Tables};
use hypideas_realtime::LocalFeed;
use hypideas_types::models::Profile;

use crate::Api;

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub feed: Arc<LocalFeed>,
}

pub fn user(n: u128, name: &str) -> Profile {
    Profile {
        id: Uuid::from_u128(n),
        username: Some(name.to_string()),
        display_name: None,
        avatar_url: None,
    }
}

impl Harness {
    pub fn new() -> Self {
        let feed = LocalFeed::new();
        let sink = feed.clone();
        let backend = MemoryBackend::new()
            .with_unique("post_reactions", &["post_id", "user_id", "reaction_type"])
            .with_unique("likes", &["post_id", "user_id"])
            .with_unique("comment_reactions", &["comment_id", "user_id", "reaction_type"])
            .with_unique("message_reactions", &["message_id", "user_id", "reaction_type"])
            .with_unique("conversations", &["participant_1", "participant_2"])
            .with_defaults(
                "posts",
                json!({ "tags": [], "is_pinned": false, "is_deleted": false, "likes_count": 0, "comments_count": 0 }),
            )
            .with_defaults("comments", json!({ "depth": 0, "is_deleted": false, "reaction_counts": {} }))
            .with_defaults(
                "messages",
                json!({ "message_type": "text", "is_deleted": false, "is_edited": false, "reactions": {} }),
            )
            .with_defaults("notifications", json!({ "is_read": false, "data": {} }))
            .with_relation("posts", "users", "users", "user_id")
            .with_relation("comments", "users", "users", "user_id")
            .with_relation("messages", "users", "users", "sender_id")
            .with_rpc("increment_post_comments", increment_post_comments)
            .with_rpc("generate_username_from_interests", generate_username)
            .with_rpc("get_platform_stats", platform_stats)
            .with_change_sink(move |change| {
                sink.publish(change);
            });
        Self {
            backend: Arc::new(backend),
            feed: Arc::new(feed),
        }
    }

    /// Services acting as `profile`, whose users row is created on first use.
    pub fn api(&self, profile: Profile) -> Api<MemoryBackend> {
        let known = self
            .backend
            .rows("users")
            .iter()
            .any(|row| row["id"] == json!(profile.id));
        if !known {
            self.backend.seed(
                "users",
                vec![json!({
                    "id": profile.id,
                    "username": profile.username,
                    "display_name": profile.display_name,
                    "avatar_url": profile.avatar_url,
                    "phone": format!("+1555000{:04}", profile.id.as_u128() % 10_000),
                    "created_at": "2024-05-01T08:00:00Z",
                })],
            );
        }
        Api::new(self.backend.clone(), profile)
    }

    /// Seed a post by `author` and return its id.
    pub fn post(&self, author: &Profile, title: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.backend.seed(
            "posts",
            vec![json!({
                "id": id,
                "user_id": author.id,
                "title": title,
                "content": "body",
                "tags": [],
                "is_pinned": false,
                "is_deleted": false,
                "likes_count": 0,
                "comments_count": 0,
                "created_at": "2024-05-01T09:00:00Z",
            })],
        );
        id
    }
}

fn increment_post_comments(tables: &mut Tables, args: Value) -> Result<Value, Error> {
    let post_id = args["post_id"].clone();
    let post = tables
        .rows_mut("posts")
        .iter_mut()
        .find(|row| row["id"] == post_id)
        .ok_or_else(|| Error::NotFound("post".into()))?;
    let count = post["comments_count"].as_u64().unwrap_or(0) + 1;
    post["comments_count"] = json!(count);
    Ok(Value::Null)
}

fn generate_username(_: &mut Tables, args: Value) -> Result<Value, Error> {
    let first = args["user_interests"][0].as_str().unwrap_or("idea").to_lowercase();
    Ok(json!(format!("{}_thinker", first.replace(' ', "_"))))
}

fn platform_stats(tables: &mut Tables, _: Value) -> Result<Value, Error> {
    Ok(json!([{
        "total_users": tables.rows("users").len(),
        "total_posts": tables.rows("posts").len(),
        "total_comments": tables.rows("comments").len(),
    }]))
}
