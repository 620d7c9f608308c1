use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use hypideas_backend::{Backend, Mutation, Query, fetch_all, write};
use hypideas_types::models::{Notification, NotificationKind};

use crate::{Api, Result};

/// A notification about to be sent to another user.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: Value,
}

impl<B: Backend> Api<B> {
    /// Best effort: nothing is sent to the acting user, and a failed insert
    /// is logged rather than failing the action that caused it.
    pub(crate) async fn notify(&self, note: NewNotification) {
        if note.recipient == self.me.id {
            debug!("Not notifying {} about their own action", note.recipient);
            return;
        }
        let row = json!({
            "user_id": note.recipient,
            "type": note.kind,
            "title": note.title,
            "message": note.message,
            "data": note.data,
        });
        if let Err(e) = write(self.backend(), Mutation::insert("notifications", row)).await {
            warn!("Failed to notify {} ({:?}): {}", note.recipient, note.kind, e);
        }
    }

    pub async fn notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let query = Query::table("notifications")
            .eq("user_id", self.me.id.to_string())
            .order("created_at", false)
            .limit(limit);
        fetch_all(self.backend(), &query).await
    }

    pub async fn unread_notification_count(&self) -> Result<usize> {
        let query = Query::table("notifications")
            .select("id")
            .eq("user_id", self.me.id.to_string())
            .eq("is_read", false);
        Ok(self.backend().select(&query).await?.len())
    }

    pub async fn mark_notification_read(&self, id: Uuid) -> Result<()> {
        let update = Mutation::update("notifications", json!({ "is_read": true }))
            .eq("id", id.to_string())
            .eq("user_id", self.me.id.to_string());
        write(self.backend(), update).await
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        let update = Mutation::update("notifications", json!({ "is_read": true }))
            .eq("user_id", self.me.id.to_string())
            .eq("is_read", false);
        write(self.backend(), update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, user};

    fn note(recipient: Uuid) -> NewNotification {
        NewNotification {
            recipient,
            kind: NotificationKind::Comment,
            title: "New Comment".into(),
            message: "someone commented".into(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn self_notifications_are_skipped() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        ada.notify(note(ada.me().id)).await;
        assert!(h.backend.rows("notifications").is_empty());

        let bob = user(2, "bob");
        ada.notify(note(bob.id)).await;
        let bob_api = h.api(bob);
        let inbox = bob_api.notifications(10).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, NotificationKind::Comment);
        assert_eq!(bob_api.unread_notification_count().await.unwrap(), 1);

        bob_api.mark_all_notifications_read().await.unwrap();
        assert_eq!(bob_api.unread_notification_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn notification_failure_is_swallowed() {
        let h = Harness::new();
        h.backend.fail_writes_to("notifications");
        let ada = h.api(user(1, "ada"));
        ada.notify(note(Uuid::from_u128(2))).await;
        assert!(h.backend.rows("notifications").is_empty());
    }
}
