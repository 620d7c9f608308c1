use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hypideas_backend::{Backend, Error, Mutation, Query, fetch_lenient, fetch_optional, write, write_one};
use hypideas_state::comments::{
    CommentNode, DISPLAY_DEPTH, DisplayComment, ParentRef, build_forest, child_placement, find_in_forest,
    flatten_for_display,
};
use hypideas_state::reactions::ReactionTally;
use hypideas_types::ValidationError;
use hypideas_types::api::{NewComment, ToggleReactionResponse};
use hypideas_types::models::{Comment, CommentReaction, NotificationKind, ReactionType};

use crate::notifications::NewNotification;
use crate::{Api, PROFILE_COLUMNS, Result};

/// A post's comments as a tree, with reactions per comment.
#[derive(Debug, Clone)]
pub struct Thread {
    pub post_id: Uuid,
    pub forest: Vec<CommentNode>,
    reactions: HashMap<Uuid, ReactionTally<ReactionType>>,
    me: Uuid,
}

impl Thread {
    pub fn display(&self) -> Vec<DisplayComment<'_>> {
        flatten_for_display(&self.forest, DISPLAY_DEPTH)
    }

    pub fn find(&self, comment_id: Uuid) -> Option<&CommentNode> {
        find_in_forest(&self.forest, comment_id)
    }

    /// Reactions on one comment; empty when it has none.
    pub fn reactions_for(&self, comment_id: Uuid) -> ReactionTally<ReactionType> {
        self.reactions
            .get(&comment_id)
            .cloned()
            .unwrap_or_else(|| ReactionTally::new(self.me))
    }

    pub fn len(&self) -> usize {
        self.forest.iter().map(|n| 1 + n.descendant_count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.forest.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct CommentOwner {
    user_id: Uuid,
    post_id: Uuid,
}

impl<B: Backend> Api<B> {
    pub async fn load_thread(&self, post_id: Uuid) -> Result<Thread> {
        let query = Query::table("comments")
            .select(&format!("*, users({})", PROFILE_COLUMNS))
            .eq("post_id", post_id.to_string())
            .eq("is_deleted", false)
            .order("created_at", true);
        let comments: Vec<Comment> = fetch_lenient(self.backend(), &query).await?;

        let mut reactions: HashMap<Uuid, ReactionTally<ReactionType>> = HashMap::new();
        if !comments.is_empty() {
            let ids = comments.iter().map(|c| c.id.to_string());
            let rows: Vec<CommentReaction> = fetch_lenient(
                self.backend(),
                &Query::table("comment_reactions").in_list("comment_id", ids),
            )
            .await?;
            for row in rows {
                reactions
                    .entry(row.comment_id)
                    .or_insert_with(|| ReactionTally::new(self.me.id))
                    .apply(row.user_id, row.reaction_type, true);
            }
        }

        debug!("Loaded {} comments on {}", comments.len(), post_id);
        Ok(Thread {
            post_id,
            forest: build_forest(comments),
            reactions,
            me: self.me.id,
        })
    }

    /// Add a top-level comment or a reply. Replies are stored one level
    /// below their parent, never deeper than the depth cap, and share the
    /// parent's thread root.
    pub async fn add_comment(&self, comment: NewComment) -> Result<Comment> {
        comment.validate()?;

        let parent = match comment.parent_comment_id {
            None => None,
            Some(parent_id) => {
                let query = Query::table("comments")
                    .select("id, post_id, depth, thread_root_id")
                    .eq("id", parent_id.to_string());
                let parent: ParentRef = fetch_optional(self.backend(), &query)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("comment {}", parent_id)))?;
                if parent.post_id != comment.post_id {
                    return Err(ValidationError::Invalid {
                        field: "reply",
                        reason: "the parent comment belongs to another post".into(),
                    }
                    .into());
                }
                Some(parent)
            }
        };
        let placement = child_placement(parent.as_ref());

        let row = json!({
            "post_id": comment.post_id,
            "user_id": self.me.id,
            "parent_comment_id": comment.parent_comment_id,
            "depth": placement.depth,
            "thread_root_id": placement.thread_root_id,
            "content": comment.content.trim(),
        });
        let mut created: Comment = write_one(self.backend(), Mutation::insert("comments", row)).await?;
        created.author.get_or_insert_with(|| self.me.clone());
        info!("Comment {} added to {} at depth {}", created.id, created.post_id, created.depth);

        if let Err(e) = self
            .backend()
            .rpc("increment_post_comments", json!({ "post_id": comment.post_id }))
            .await
        {
            warn!("Comment count for {} not updated: {}", comment.post_id, e);
        }

        if let Some(post) = self.post_summary(comment.post_id).await {
            self.notify(NewNotification {
                recipient: post.user_id,
                kind: NotificationKind::Comment,
                title: "New Comment".into(),
                message: format!("{} commented on your post", self.me.label()),
                data: json!({ "post_id": post.id, "comment_id": created.id, "commenter_id": self.me.id }),
            })
            .await;
        }

        Ok(created)
    }

    /// Reaction keys on a comment are independent: a user may hold several.
    pub async fn toggle_comment_reaction(
        &self,
        comment_id: Uuid,
        reaction: ReactionType,
    ) -> Result<ToggleReactionResponse> {
        let me = self.me.id;
        let rows: Vec<CommentReaction> = fetch_lenient(
            self.backend(),
            &Query::table("comment_reactions").eq("comment_id", comment_id.to_string()),
        )
        .await?;
        let mut tally = ReactionTally::from_pairs(me, rows.into_iter().map(|r| (r.user_id, r.reaction_type)));

        let added = if tally.is_active(&reaction) {
            let delete = Mutation::delete("comment_reactions")
                .eq("comment_id", comment_id.to_string())
                .eq("user_id", me.to_string())
                .eq("reaction_type", reaction.as_str());
            write(self.backend(), delete).await?;
            tally.apply(me, reaction, false);
            false
        } else {
            let row = json!({ "comment_id": comment_id, "user_id": me, "reaction_type": reaction });
            match write(self.backend(), Mutation::insert("comment_reactions", row)).await {
                Ok(()) => {}
                Err(Error::Conflict(_)) => debug!("{} reaction on comment {} already stored", reaction, comment_id),
                Err(e) => return Err(e),
            }
            tally.apply(me, reaction, true);
            self.notify_comment_author(comment_id, reaction).await;
            true
        };

        Ok(ToggleReactionResponse {
            reaction_type: reaction,
            added,
            count: tally.count(&reaction),
        })
    }

    async fn notify_comment_author(&self, comment_id: Uuid, reaction: ReactionType) {
        let query = Query::table("comments")
            .select("user_id, post_id")
            .eq("id", comment_id.to_string());
        let owner: CommentOwner = match fetch_optional(self.backend(), &query).await {
            Ok(Some(owner)) => owner,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not load comment {} for notification: {}", comment_id, e);
                return;
            }
        };
        self.notify(NewNotification {
            recipient: owner.user_id,
            kind: NotificationKind::CommentReaction,
            title: "New Reaction".into(),
            message: format!("{} reacted {} to your comment", self.me.label(), reaction.emoji()),
            data: json!({
                "post_id": owner.post_id,
                "comment_id": comment_id,
                "reactor_id": self.me.id,
                "reaction_type": reaction,
            }),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, user};
    use hypideas_types::api::MAX_COMMENT_DEPTH;

    fn reply(post_id: Uuid, parent: Option<Uuid>, text: &str) -> NewComment {
        NewComment {
            post_id,
            parent_comment_id: parent,
            content: text.into(),
        }
    }

    #[tokio::test]
    async fn replies_are_capped_at_max_depth() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let post = h.post(ada.me(), "thread");

        let root = ada.add_comment(reply(post, None, "root")).await.unwrap();
        assert_eq!(root.depth, 0);
        assert_eq!(root.thread_root_id, None);

        let mut parent = root.clone();
        for _ in 0..4 {
            parent = ada.add_comment(reply(post, Some(parent.id), "deeper")).await.unwrap();
            assert_eq!(parent.thread_root_id, Some(root.id));
        }
        assert_eq!(parent.depth, MAX_COMMENT_DEPTH);

        let thread = ada.load_thread(post).await.unwrap();
        assert_eq!(thread.len(), 5);
        assert_eq!(thread.forest.len(), 1);
        assert_eq!(thread.find(parent.id).unwrap().comment.depth, MAX_COMMENT_DEPTH);

        let posts = h.backend.rows("posts");
        assert_eq!(posts[0]["comments_count"], json!(5));
    }

    #[tokio::test]
    async fn missing_or_foreign_parent_is_rejected() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let post = h.post(ada.me(), "one");
        let other = h.post(ada.me(), "two");

        let err = ada.add_comment(reply(post, Some(Uuid::new_v4()), "hi")).await.unwrap_err();
        assert!(err.is_not_found());

        let elsewhere = ada.add_comment(reply(other, None, "there")).await.unwrap();
        let err = ada.add_comment(reply(post, Some(elsewhere.id), "hi")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(h.backend.rows("comments").len(), 1);
    }

    #[tokio::test]
    async fn orphaned_reply_is_shown_at_top_level() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let post = h.post(ada.me(), "thread");
        let root = ada.add_comment(reply(post, None, "root")).await.unwrap();
        let child = ada.add_comment(reply(post, Some(root.id), "child")).await.unwrap();

        h.backend.seed(
            "comments",
            vec![json!({
                "id": Uuid::new_v4(),
                "post_id": post,
                "user_id": ada.me().id,
                "parent_comment_id": Uuid::new_v4(),
                "depth": 2,
                "content": "lost parent",
                "is_deleted": false,
                "created_at": "2030-01-01T00:00:00Z",
            })],
        );

        let thread = ada.load_thread(post).await.unwrap();
        assert_eq!(thread.forest.len(), 2);
        let rows = thread.display();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].comment.id, child.id);
        assert_eq!(rows[2].level, 0);
    }

    #[tokio::test]
    async fn null_columns_keep_the_comment_in_its_thread() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let post = h.post(ada.me(), "nulls");
        let root = Uuid::new_v4();
        h.backend.seed(
            "comments",
            vec![
                json!({
                    "id": root,
                    "post_id": post,
                    "user_id": ada.me().id,
                    "depth": null,
                    "content": "root",
                    "reaction_counts": null,
                    "is_deleted": false,
                    "created_at": "2024-05-01T10:00:00Z",
                }),
                json!({
                    "id": Uuid::new_v4(),
                    "post_id": post,
                    "user_id": ada.me().id,
                    "parent_comment_id": root,
                    "depth": 1,
                    "content": "child",
                    "is_deleted": false,
                    "created_at": "2024-05-01T10:01:00Z",
                }),
            ],
        );

        let thread = ada.load_thread(post).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread.forest.len(), 1);
        assert_eq!(thread.forest[0].comment.id, root);
        assert!(thread.forest[0].comment.reaction_counts.is_empty());
        assert_eq!(thread.forest[0].replies[0].comment.content, "child");
    }

    #[tokio::test]
    async fn comment_notifies_post_author_only() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let post = h.post(ada.me(), "thread");

        ada.add_comment(reply(post, None, "my own")).await.unwrap();
        assert!(h.backend.rows("notifications").is_empty());

        let c = bob.add_comment(reply(post, None, "nice")).await.unwrap();
        let notes = ada.notifications(10).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::Comment);
        assert_eq!(notes[0].message, "bob commented on your post");
        assert_eq!(notes[0].data["comment_id"], json!(c.id));
    }

    #[tokio::test]
    async fn failed_notification_does_not_fail_comment() {
        let h = Harness::new();
        h.backend.fail_writes_to("notifications");
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let post = h.post(ada.me(), "thread");

        bob.add_comment(reply(post, None, "still saved")).await.unwrap();
        assert_eq!(h.backend.rows("comments").len(), 1);
    }

    #[tokio::test]
    async fn comment_reactions_toggle_independently() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let bob = h.api(user(2, "bob"));
        let post = h.post(ada.me(), "thread");
        let c = ada.add_comment(reply(post, None, "react to me")).await.unwrap();

        assert!(bob.toggle_comment_reaction(c.id, ReactionType::Idea).await.unwrap().added);
        assert!(bob.toggle_comment_reaction(c.id, ReactionType::Fire).await.unwrap().added);
        let removed = bob.toggle_comment_reaction(c.id, ReactionType::Idea).await.unwrap();
        assert!(!removed.added);
        assert_eq!(removed.count, 0);

        let thread = bob.load_thread(post).await.unwrap();
        let tally = thread.reactions_for(c.id);
        assert_eq!(tally.mine(), vec![ReactionType::Fire]);
        assert_eq!(tally.total(), 1);
        assert_eq!(ada.notifications(10).await.unwrap().len(), 2);
    }
}
