//! Moderation and platform administration. Every mutation is followed by an
//! entry in the admin action log.

use std::collections::HashMap;

use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hypideas_backend::{
    Backend, Error, Filter, Mutation, Op, Query, fetch_all, fetch_lenient, fetch_optional, write, write_one,
};
use hypideas_state::analytics::{MAX_RANGE_DAYS, SeriesSummary, daily_series, parse_range, summarize};
use hypideas_types::ValidationError;
use hypideas_types::api::{BanRequest, NewAnnouncement, UserFilters};
use hypideas_types::models::{
    AdminActionLog, AdminUser, Announcement, BanType, ContentKind, DailyCount, HealthStatus, ManagedUser,
    ModerationItem, ModerationStatus, PlatformStats, SystemHealth, UserBan,
};

use crate::{Api, Result};

const HEALTH_SERVICES: [&str; 4] = ["database", "storage", "auth", "realtime"];

/// Daily activity over a range of days, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analytics {
    pub days: u32,
    pub users: Vec<DailyCount>,
    pub posts: Vec<DailyCount>,
    pub reactions: Vec<DailyCount>,
    pub new_users: u64,
    pub new_posts: u64,
    pub new_reactions: u64,
    pub peak_posts: u32,
    pub reactions_per_post: f64,
}

#[derive(Debug, Deserialize)]
struct Created {
    created_at: DateTime<Utc>,
}

/// Admin operations, available once the caller's admin role is confirmed.
pub struct AdminConsole<B> {
    api: Api<B>,
    role: AdminUser,
}

impl<B: Backend> Api<B> {
    /// The caller's active admin role, if any.
    pub async fn check_admin_access(&self) -> Result<Option<AdminUser>> {
        let query = Query::table("admin_users")
            .select("role, permissions, is_active")
            .eq("user_id", self.me.id.to_string())
            .eq("is_active", true);
        fetch_optional(self.backend(), &query).await
    }

    pub async fn admin_console(&self) -> Result<AdminConsole<B>> {
        match self.check_admin_access().await? {
            Some(role) => {
                debug!("Admin access granted to {} as {}", self.me.id, role.role);
                Ok(AdminConsole {
                    api: self.clone(),
                    role,
                })
            }
            None => Err(Error::Unauthorized("admin access required".into())),
        }
    }
}

impl<B: Backend> AdminConsole<B> {
    pub fn role(&self) -> &AdminUser {
        &self.role
    }

    fn backend(&self) -> &B {
        self.api.backend()
    }

    fn admin_id(&self) -> Uuid {
        self.api.me().id
    }

    pub async fn platform_stats(&self, days: u32) -> Result<PlatformStats> {
        let result = self
            .backend()
            .rpc("get_platform_stats", json!({ "days_back": days }))
            .await?;
        let first = match result {
            Value::Array(rows) => rows.into_iter().next(),
            Value::Null => None,
            row => Some(row),
        };
        Ok(match first {
            Some(row) => serde_json::from_value(row)?,
            None => PlatformStats::default(),
        })
    }

    /// Users newest first. Active bans are attached to each user.
    pub async fn list_users(&self, filters: &UserFilters, limit: usize, offset: usize) -> Result<Vec<ManagedUser>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut query = Query::table("users")
            .order("created_at", false)
            .range(offset, offset + limit - 1);

        if let Some(term) = filters.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = format!("*{}*", term);
            query = query.or(vec![
                Filter::cmp("username", Op::ILike, pattern.as_str()),
                Filter::cmp("display_name", Op::ILike, pattern.as_str()),
                Filter::cmp("email", Op::ILike, pattern.as_str()),
            ]);
        }
        if filters.banned {
            let banned: Vec<UserBan> =
                fetch_lenient(self.backend(), &Query::table("user_bans").eq("is_active", true)).await?;
            if banned.is_empty() {
                return Ok(Vec::new());
            }
            query = query.in_list("id", banned.iter().map(|b| b.user_id.to_string()));
        }

        let mut users: Vec<ManagedUser> = fetch_lenient(self.backend(), &query).await?;
        if users.is_empty() {
            return Ok(users);
        }
        let bans: Vec<UserBan> = fetch_lenient(
            self.backend(),
            &Query::table("user_bans")
                .eq("is_active", true)
                .in_list("user_id", users.iter().map(|u| u.id.to_string())),
        )
        .await?;
        let mut by_user: HashMap<Uuid, Vec<UserBan>> = HashMap::new();
        for ban in bans {
            by_user.entry(ban.user_id).or_default().push(ban);
        }
        for user in &mut users {
            user.user_bans = by_user.remove(&user.id).unwrap_or_default();
        }
        Ok(users)
    }

    pub async fn ban_user(&self, request: BanRequest) -> Result<UserBan> {
        request.validate()?;
        if request.user_id == self.admin_id() {
            return Err(ValidationError::Invalid {
                field: "ban",
                reason: "admins cannot ban themselves".into(),
            }
            .into());
        }
        let banned_until = match request.ban_type {
            BanType::Permanent => None,
            _ => request.duration.map(|d| Utc::now() + d),
        };
        let row = json!({
            "user_id": request.user_id,
            "ban_type": request.ban_type,
            "reason": request.reason.trim(),
            "banned_by": self.admin_id(),
            "banned_until": banned_until,
            "is_active": true,
        });
        let ban: UserBan = write_one(self.backend(), Mutation::insert("user_bans", row)).await?;
        info!("User {} banned ({:?})", request.user_id, request.ban_type);

        self.log_action(
            "ban_user",
            "user",
            request.user_id,
            Value::Null,
            json!({ "ban_type": ban.ban_type, "banned_until": ban.banned_until }),
            Some(request.reason.trim()),
        )
        .await;
        Ok(ban)
    }

    /// Lift every active ban on `user_id`. Returns how many were lifted.
    pub async fn unban_user(&self, user_id: Uuid, reason: &str) -> Result<usize> {
        let update = Mutation::update("user_bans", json!({ "is_active": false }))
            .eq("user_id", user_id.to_string())
            .eq("is_active", true)
            .returning();
        let lifted = self.backend().mutate(&update).await?.len();
        info!("Lifted {} bans on {}", lifted, user_id);

        self.log_action(
            "unban_user",
            "user",
            user_id,
            json!({ "is_active": true }),
            json!({ "is_active": false }),
            Some(reason),
        )
        .await;
        Ok(lifted)
    }

    /// Highest priority first, then oldest first.
    pub async fn moderation_queue(&self, status: ModerationStatus, limit: usize) -> Result<Vec<ModerationItem>> {
        let query = Query::table("moderation_queue")
            .eq("status", status.as_str())
            .order("priority", false)
            .order("created_at", true)
            .limit(limit);
        fetch_lenient(self.backend(), &query).await
    }

    pub async fn moderate(
        &self,
        item_id: Uuid,
        status: ModerationStatus,
        notes: Option<&str>,
        action_taken: Option<&str>,
    ) -> Result<ModerationItem> {
        let update = Mutation::update(
            "moderation_queue",
            json!({
                "status": status,
                "reviewed_by": self.admin_id(),
                "reviewed_at": Utc::now(),
                "notes": notes,
                "action_taken": action_taken,
            }),
        )
        .eq("id", item_id.to_string());
        let item: ModerationItem = write_one(self.backend(), update).await?;

        self.log_action(
            "moderate_content",
            "moderation_item",
            item_id,
            Value::Null,
            json!({ "status": status, "action_taken": action_taken }),
            notes,
        )
        .await;
        Ok(item)
    }

    /// Soft delete a post or comment.
    pub async fn delete_content(&self, kind: ContentKind, content_id: Uuid, reason: &str) -> Result<()> {
        let update = Mutation::update(
            kind.table(),
            json!({
                "is_deleted": true,
                "deleted_at": Utc::now(),
                "deleted_by": self.admin_id(),
                "deletion_reason": reason,
            }),
        )
        .eq("id", content_id.to_string())
        .returning();
        if self.backend().mutate(&update).await?.is_empty() {
            return Err(Error::NotFound(format!("{} {}", kind.as_str(), content_id)));
        }
        info!("Deleted {} {}", kind.as_str(), content_id);

        self.log_action(
            "delete_content",
            kind.as_str(),
            content_id,
            json!({ "is_deleted": false }),
            json!({ "is_deleted": true }),
            Some(reason),
        )
        .await;
        Ok(())
    }

    /// Activity for a range such as `7d` or `30d`, ending today.
    pub async fn analytics(&self, range: &str) -> Result<Analytics> {
        let days = parse_range(range).ok_or_else(|| ValidationError::Invalid {
            field: "range",
            reason: format!("'{}' is not a day count from 1d to {}d", range, MAX_RANGE_DAYS),
        })?;
        let today = Utc::now().date_naive();
        let first = today
            .checked_sub_days(Days::new(u64::from(days - 1)))
            .unwrap_or(today);
        let since = first.and_time(NaiveTime::MIN).and_utc();

        let users = self.created_since(Query::table("users"), since).await?;
        let posts = self
            .created_since(Query::table("posts").eq("is_deleted", false), since)
            .await?;
        let reactions = self.created_since(Query::table("post_reactions"), since).await?;

        let users = daily_series(&users, days, today);
        let posts = daily_series(&posts, days, today);
        let reactions = daily_series(&reactions, days, today);
        let (u, p, r): (SeriesSummary, SeriesSummary, SeriesSummary) =
            (summarize(&users), summarize(&posts), summarize(&reactions));

        Ok(Analytics {
            days,
            users,
            posts,
            reactions,
            new_users: u.total,
            new_posts: p.total,
            new_reactions: r.total,
            peak_posts: p.peak,
            reactions_per_post: if p.total == 0 {
                0.0
            } else {
                r.total as f64 / p.total as f64
            },
        })
    }

    async fn created_since(&self, query: Query, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        let query = query.select("created_at").gte("created_at", since.to_rfc3339());
        let rows: Vec<Created> = fetch_lenient(self.backend(), &query).await?;
        Ok(rows.into_iter().map(|r| r.created_at).collect())
    }

    pub async fn create_announcement(&self, announcement: NewAnnouncement) -> Result<Announcement> {
        announcement.validate()?;
        let row = json!({
            "title": announcement.title.trim(),
            "content": announcement.content.trim(),
            "announcement_type": announcement.announcement_type,
            "target_audience": announcement.target_audience,
            "expires_at": announcement.expires_at,
            "created_by": self.admin_id(),
        });
        let created: Announcement = write_one(self.backend(), Mutation::insert("platform_announcements", row)).await?;

        self.log_action(
            "create_announcement",
            "announcement",
            created.id,
            Value::Null,
            json!({ "title": created.title }),
            None,
        )
        .await;
        Ok(created)
    }

    pub async fn admin_logs(&self, limit: usize, offset: usize) -> Result<Vec<AdminActionLog>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = Query::table("admin_action_logs")
            .order("created_at", false)
            .range(offset, offset + limit - 1);
        fetch_all(self.backend(), &query).await
    }

    /// Probe the database and record the result for every service. Only
    /// the database is probed from the client; the other services are
    /// reported healthy while the database answers.
    pub async fn system_health(&self) -> Result<SystemHealth> {
        let database = match self.backend().select(&Query::table("users").select("id").limit(1)).await {
            Ok(_) => HealthStatus::Healthy,
            Err(e) => {
                warn!("Database health probe failed: {}", e);
                HealthStatus::Unhealthy
            }
        };
        let health = SystemHealth {
            database,
            storage: database,
            auth: database,
            realtime: database,
            overall: database,
        };

        let now = Utc::now();
        let rows: Vec<Value> = HEALTH_SERVICES
            .iter()
            .map(|service| json!({ "service_name": service, "status": database, "last_check": now }))
            .collect();
        if let Err(e) = write(
            self.backend(),
            Mutation::upsert("system_health", Value::Array(rows), Some("service_name")),
        )
        .await
        {
            warn!("Could not record system health: {}", e);
        }
        Ok(health)
    }

    /// Best effort: a failed log write never fails the action it records.
    async fn log_action(
        &self,
        action_type: &str,
        target_type: &str,
        target_id: Uuid,
        old_values: Value,
        new_values: Value,
        reason: Option<&str>,
    ) {
        let row = json!({
            "admin_id": self.admin_id(),
            "action_type": action_type,
            "target_type": target_type,
            "target_id": target_id,
            "old_values": old_values,
            "new_values": new_values,
            "reason": reason,
        });
        if let Err(e) = write(self.backend(), Mutation::insert("admin_action_logs", row)).await {
            warn!("Admin action {} on {} not logged: {}", action_type, target_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, user};
    use hypideas_types::models::ReactionType;

    async fn console(h: &Harness) -> AdminConsole<hypideas_backend::memory::MemoryBackend> {
        let admin = h.api(user(1, "root"));
        h.backend.seed(
            "admin_users",
            vec![json!({ "user_id": admin.me().id, "role": "super_admin", "permissions": {}, "is_active": true })],
        );
        admin.admin_console().await.unwrap()
    }

    #[tokio::test]
    async fn non_admin_is_refused() {
        let h = Harness::new();
        let bob = h.api(user(2, "bob"));
        assert!(bob.check_admin_access().await.unwrap().is_none());
        assert!(matches!(bob.admin_console().await, Err(Error::Unauthorized(_))));
    }

    #[tokio::test]
    async fn ban_and_unban_are_logged() {
        let h = Harness::new();
        let admin = console(&h).await;
        let bob = h.api(user(2, "bob"));
        h.api(user(3, "carol"));

        let ban = admin
            .ban_user(BanRequest {
                user_id: bob.me().id,
                ban_type: BanType::Temporary,
                reason: "spam".into(),
                duration: Some(chrono::Duration::days(1)),
            })
            .await
            .unwrap();
        assert!(ban.in_force(Utc::now()));

        let banned = admin
            .list_users(&UserFilters { search: None, banned: true }, 10, 0)
            .await
            .unwrap();
        assert_eq!(banned.len(), 1);
        assert_eq!(banned[0].id, bob.me().id);
        assert_eq!(banned[0].user_bans.len(), 1);

        assert_eq!(admin.unban_user(bob.me().id, "appeal").await.unwrap(), 1);
        assert!(admin
            .list_users(&UserFilters { search: None, banned: true }, 10, 0)
            .await
            .unwrap()
            .is_empty());

        let logs = admin.admin_logs(10, 0).await.unwrap();
        let actions: Vec<&str> = logs.iter().map(|l| l.action_type.as_str()).collect();
        assert_eq!(actions, vec!["unban_user", "ban_user"]);
    }

    #[tokio::test]
    async fn search_matches_names_case_insensitively() {
        let h = Harness::new();
        let admin = console(&h).await;
        h.api(user(2, "Bobby"));
        h.api(user(3, "carol"));

        let found = admin
            .list_users(&UserFilters { search: Some("bob".into()), banned: false }, 10, 0)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username.as_deref(), Some("Bobby"));
        assert_eq!(admin.list_users(&UserFilters::default(), 2, 1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_log_write_does_not_fail_action() {
        let h = Harness::new();
        let admin = console(&h).await;
        let author = user(2, "bob");
        let post = h.post(&author, "spam");
        h.backend.fail_writes_to("admin_action_logs");

        admin.delete_content(ContentKind::Post, post, "spam").await.unwrap();
        assert_eq!(h.backend.rows("posts")[0]["is_deleted"], json!(true));
        assert!(admin.delete_content(ContentKind::Comment, Uuid::new_v4(), "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn moderation_queue_orders_by_priority_then_age() {
        let h = Harness::new();
        let admin = console(&h).await;
        let item = |priority: i32, created: &str| {
            json!({ "id": Uuid::new_v4(), "content_type": "post", "content_id": Uuid::new_v4(),
                    "priority": priority, "status": "pending", "created_at": created })
        };
        h.backend.seed(
            "moderation_queue",
            vec![
                item(1, "2024-05-01T00:00:00Z"),
                item(5, "2024-05-03T00:00:00Z"),
                item(5, "2024-05-02T00:00:00Z"),
            ],
        );
        let queue = admin.moderation_queue(ModerationStatus::Pending, 10).await.unwrap();
        let order: Vec<(i32, u32)> = queue.iter().map(|i| (i.priority, chrono::Datelike::day(&i.created_at))).collect();
        assert_eq!(order, vec![(5, 2), (5, 3), (1, 1)]);

        let reviewed = admin
            .moderate(queue[0].id, ModerationStatus::Approved, Some("fine"), None)
            .await
            .unwrap();
        assert_eq!(reviewed.status, ModerationStatus::Approved);
        assert_eq!(admin.moderation_queue(ModerationStatus::Pending, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn analytics_counts_recent_activity() {
        let h = Harness::new();
        let admin = console(&h).await;
        let bob = h.api(user(2, "bob"));
        let post = bob
            .create_post(hypideas_types::api::NewPost::from_form("new", "text", "", None))
            .await
            .unwrap();
        bob.toggle_post_reaction(post.id, ReactionType::Idea).await.unwrap();
        admin.api.toggle_post_reaction(post.id, ReactionType::Fire).await.unwrap();

        let report = admin.analytics("7d").await.unwrap();
        assert_eq!(report.days, 7);
        assert_eq!(report.posts.len(), 7);
        assert_eq!(report.new_posts, 1);
        assert_eq!(report.new_reactions, 2);
        assert_eq!(report.new_users, 0);
        assert!((report.reactions_per_post - 2.0).abs() < f64::EPSILON);
        assert!(admin.analytics("week").await.is_err());
    }

    #[tokio::test]
    async fn oversized_analytics_range_is_rejected() {
        let h = Harness::new();
        let admin = console(&h).await;
        let err = admin.analytics("50000000d").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::Invalid { field: "range", .. })));
        assert_eq!(admin.analytics("365d").await.unwrap().users.len(), 365);
    }

    #[tokio::test]
    async fn stats_and_health() {
        let h = Harness::new();
        let admin = console(&h).await;
        h.api(user(2, "bob"));
        let stats = admin.platform_stats(30).await.unwrap();
        assert_eq!(stats.total_users, 2);

        let health = admin.system_health().await.unwrap();
        assert_eq!(health.overall, HealthStatus::Healthy);
        admin.system_health().await.unwrap();
        assert_eq!(h.backend.rows("system_health").len(), 4);
    }
}
