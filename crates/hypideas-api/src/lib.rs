//! Client services over a [`Backend`]: feed and posts, comment threads,
//! chat, sign-in and profile, search, notifications and admin moderation.

pub mod admin;
pub mod auth;
pub mod chat;
pub mod chat_view;
pub mod comments;
pub mod notifications;
pub mod posts;
pub mod search;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use hypideas_backend::config::DEFAULT_STORAGE_BUCKET;
use hypideas_backend::{Backend, Query, fetch_optional};
use hypideas_types::models::Profile;

pub use hypideas_backend::{Error, Result};

pub(crate) const PROFILE_COLUMNS: &str = "id, username, display_name, avatar_url";

/// Services acting as one signed-in user.
pub struct Api<B> {
    backend: Arc<B>,
    me: Profile,
    bucket: String,
}

impl<B> Clone for Api<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            me: self.me.clone(),
            bucket: self.bucket.clone(),
        }
    }
}

impl<B: Backend> Api<B> {
    pub fn new(backend: Arc<B>, me: Profile) -> Self {
        Self {
            backend,
            me,
            bucket: DEFAULT_STORAGE_BUCKET.to_string(),
        }
    }

    /// Load the profile of `user_id` and act as that user. A user without a
    /// profile row yet gets an empty one.
    pub async fn for_user(backend: Arc<B>, user_id: Uuid) -> Result<Self> {
        let query = Query::table("users")
            .select(PROFILE_COLUMNS)
            .eq("id", user_id.to_string());
        let me = match fetch_optional::<Profile>(backend.as_ref(), &query).await? {
            Some(profile) => profile,
            None => {
                debug!("No profile row for {} yet", user_id);
                Profile {
                    id: user_id,
                    username: None,
                    display_name: None,
                    avatar_url: None,
                }
            }
        };
        Ok(Self::new(backend, me))
    }

    pub fn with_storage_bucket(mut self, bucket: &str) -> Self {
        self.bucket = bucket.to_string();
        self
    }

    pub fn me(&self) -> &Profile {
        &self.me
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
