use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hypideas_backend::{Backend, Error, Mutation, Query, fetch_all, fetch_lenient, fetch_one, fetch_optional, write, write_one};
use hypideas_state::reactions::PostEngagement;
use hypideas_types::api::{FEED_PAGE_SIZE, NewPost, ToggleReactionResponse};
use hypideas_types::models::{LegacyLike, NotificationKind, Post, PostReaction, ReactionType};

use crate::notifications::NewNotification;
use crate::{Api, Result};

pub(crate) const POST_COLUMNS: &str = "*, users(id, username, display_name, avatar_url)";

/// Just enough of a post to address a notification.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PostSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub title: String,
}

impl<B: Backend> Api<B> {
    /// One page of the feed: pinned posts first, then newest first.
    pub async fn feed(&self, page: usize) -> Result<Vec<Post>> {
        let from = page * FEED_PAGE_SIZE;
        let query = Query::table("posts")
            .select(POST_COLUMNS)
            .eq("is_deleted", false)
            .order("is_pinned", false)
            .order("created_at", false)
            .range(from, from + FEED_PAGE_SIZE - 1);
        fetch_lenient(self.backend(), &query).await
    }

    pub async fn get_post(&self, post_id: Uuid) -> Result<Post> {
        let query = Query::table("posts")
            .select(POST_COLUMNS)
            .eq("id", post_id.to_string())
            .eq("is_deleted", false);
        fetch_one(self.backend(), &query).await
    }

    pub async fn create_post(&self, post: NewPost) -> Result<Post> {
        post.validate()?;
        let row = json!({
            "user_id": self.me.id,
            "title": post.title.trim(),
            "content": post.content.trim(),
            "tags": post.tags,
            "category": post.category,
        });
        let mut created: Post = write_one(self.backend(), Mutation::insert("posts", row)).await?;
        created.author.get_or_insert_with(|| self.me.clone());
        info!("Created post {}", created.id);
        Ok(created)
    }

    pub async fn post_engagement(&self, post_id: Uuid) -> Result<PostEngagement> {
        let mut all = self.engagement_for(&[post_id]).await?;
        Ok(all
            .remove(&post_id)
            .unwrap_or_else(|| PostEngagement::from_rows(self.me.id, &[], &[])))
    }

    /// Engagement for a page of posts with two queries in total.
    pub async fn engagement_for(&self, post_ids: &[Uuid]) -> Result<HashMap<Uuid, PostEngagement>> {
        if post_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = post_ids.iter().map(Uuid::to_string);
        let typed: Vec<PostReaction> = fetch_lenient(
            self.backend(),
            &Query::table("post_reactions").in_list("post_id", ids.clone()),
        )
        .await?;
        let legacy: Vec<LegacyLike> =
            fetch_lenient(self.backend(), &Query::table("likes").in_list("post_id", ids)).await?;

        Ok(post_ids
            .iter()
            .map(|id| {
                let typed: Vec<PostReaction> = typed.iter().filter(|r| r.post_id == *id).cloned().collect();
                let legacy: Vec<LegacyLike> = legacy.iter().filter(|l| l.post_id == *id).cloned().collect();
                (*id, PostEngagement::from_rows(self.me.id, &typed, &legacy))
            })
            .collect())
    }

    pub async fn toggle_post_reaction(&self, post_id: Uuid, reaction: ReactionType) -> Result<ToggleReactionResponse> {
        self.toggle_reaction(post_id, reaction, NotificationKind::PostReaction).await
    }

    /// Like or unlike. Likes are written as typed `like` reactions; unliking
    /// also removes the caller's row from the older `likes` table.
    pub async fn toggle_like(&self, post_id: Uuid) -> Result<ToggleReactionResponse> {
        self.toggle_reaction(post_id, ReactionType::Like, NotificationKind::Like).await
    }

    async fn toggle_reaction(
        &self,
        post_id: Uuid,
        reaction: ReactionType,
        kind: NotificationKind,
    ) -> Result<ToggleReactionResponse> {
        let me = self.me.id;
        let mut engagement = self.post_engagement(post_id).await?;

        let added = if engagement.tally.is_active(&reaction) {
            let delete = Mutation::delete("post_reactions")
                .eq("post_id", post_id.to_string())
                .eq("user_id", me.to_string())
                .eq("reaction_type", reaction.as_str());
            write(self.backend(), delete).await?;

            if reaction == ReactionType::Like && engagement.has_legacy_like() {
                let legacy = Mutation::delete("likes")
                    .eq("post_id", post_id.to_string())
                    .eq("user_id", me.to_string());
                write(self.backend(), legacy).await?;
                engagement.clear_legacy_like();
                debug!("Removed legacy like on {}", post_id);
            }
            engagement.tally.apply(me, reaction, false);
            false
        } else {
            let row = json!({
                "post_id": post_id,
                "user_id": me,
                "reaction_type": reaction,
            });
            match write(self.backend(), Mutation::insert("post_reactions", row)).await {
                Ok(()) => {}
                Err(Error::Conflict(_)) => debug!("{} reaction on {} already stored", reaction, post_id),
                Err(e) => return Err(e),
            }
            engagement.tally.apply(me, reaction, true);
            self.notify_post_author(post_id, reaction, kind).await;
            true
        };

        Ok(ToggleReactionResponse {
            reaction_type: reaction,
            added,
            count: engagement.tally.count(&reaction),
        })
    }

    pub(crate) async fn post_summary(&self, post_id: Uuid) -> Option<PostSummary> {
        let query = Query::table("posts")
            .select("id, user_id, title")
            .eq("id", post_id.to_string());
        match fetch_optional(self.backend(), &query).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Could not load post {} for notification: {}", post_id, e);
                None
            }
        }
    }

    async fn notify_post_author(&self, post_id: Uuid, reaction: ReactionType, kind: NotificationKind) {
        let Some(post) = self.post_summary(post_id).await else {
            return;
        };
        let label = self.me.label();
        let note = if kind == NotificationKind::Like {
            NewNotification {
                recipient: post.user_id,
                kind,
                title: "New Like".into(),
                message: format!("{} liked your post", label),
                data: json!({ "post_id": post.id, "liker_id": self.me.id, "post_title": post.title }),
            }
        } else {
            NewNotification {
                recipient: post.user_id,
                kind,
                title: "New Reaction".into(),
                message: format!("{} reacted {} to your post", label, reaction.emoji()),
                data: json!({
                    "post_id": post.id,
                    "reactor_id": self.me.id,
                    "reaction_type": reaction,
                    "post_title": post.title,
                }),
            }
        };
        self.notify(note).await;
    }

    /// Posts written by `user_id`, newest first.
    pub async fn posts_by(&self, user_id: Uuid) -> Result<Vec<Post>> {
        let query = Query::table("posts")
            .select(POST_COLUMNS)
            .eq("user_id", user_id.to_string())
            .eq("is_deleted", false)
            .order("created_at", false);
        fetch_all(self.backend(), &query).await
    }
}
