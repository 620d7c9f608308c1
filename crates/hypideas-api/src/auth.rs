use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use hypideas_backend::auth::{AuthClient, Session};
use hypideas_backend::{Backend, Error, Mutation, Query, fetch_lenient, fetch_optional, write_one};
use hypideas_types::api::{ProfileSetup, normalize_phone, validate_otp};
use hypideas_types::models::Profile;

use crate::{Api, PROFILE_COLUMNS, Result};

/// Phone and OAuth sign-in with input checks applied before any request.
#[derive(Clone)]
pub struct AuthService {
    client: AuthClient,
}

impl AuthService {
    pub fn new(client: AuthClient) -> Self {
        Self { client }
    }

    /// Send a code to `raw_phone`. Returns the normalized number, which
    /// must be passed back to [`AuthService::verify_otp`].
    pub async fn send_otp(&self, raw_phone: &str) -> Result<String> {
        let phone = normalize_phone(raw_phone)?;
        self.client.send_otp(&phone).await?;
        info!("Verification code sent");
        Ok(phone)
    }

    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<Session> {
        validate_otp(code.trim())?;
        self.client.verify_otp(phone, code.trim()).await
    }

    pub fn oauth_url(&self, provider: &str) -> Result<Url> {
        self.client.authorize_url(provider)
    }

    /// Finish an OAuth sign-in from the redirect the browser landed on.
    pub fn complete_oauth(&self, redirect: &Url) -> Result<Session> {
        Session::from_redirect(redirect)
    }

    pub async fn refresh(&self, session: &Session) -> Result<Session> {
        self.client.refresh(&session.refresh_token).await
    }

    /// Return `session`, refreshed first if it is about to expire.
    pub async fn ensure_fresh(&self, session: Session) -> Result<Session> {
        if session.is_expired(Utc::now()) {
            debug!("Session expired, refreshing");
            return self.refresh(&session).await;
        }
        Ok(session)
    }

    pub async fn sign_out(&self, session: &Session) -> Result<()> {
        self.client.logout(&session.access_token).await
    }
}

/// Whether a profile already exists for `raw_phone`.
pub async fn user_exists_by_phone<B: Backend>(backend: &B, raw_phone: &str) -> Result<bool> {
    let phone = normalize_phone(raw_phone)?;
    let query = Query::table("users").select("id").eq("phone", phone);
    Ok(fetch_optional::<Value>(backend, &query).await?.is_some())
}

#[derive(Debug, Deserialize)]
struct Category {
    name: String,
}

/// Interest names offered during profile setup.
pub async fn interest_categories<B: Backend>(backend: &B) -> Result<Vec<String>> {
    let query = Query::table("interest_categories")
        .select("name")
        .order("name", true);
    let rows: Vec<Category> = fetch_lenient(backend, &query).await?;
    Ok(rows.into_iter().map(|c| c.name).collect())
}

impl<B: Backend> Api<B> {
    /// Set display name and interests for a new account. The username is
    /// generated by the backend from the interests.
    pub async fn complete_profile(&mut self, setup: ProfileSetup) -> Result<Profile> {
        setup.validate()?;
        let interests: Vec<&str> = setup
            .interests
            .iter()
            .map(|i| i.trim())
            .filter(|i| !i.is_empty())
            .collect();

        let generated = self
            .backend()
            .rpc("generate_username_from_interests", json!({ "user_interests": interests }))
            .await?;
        let username = generated
            .as_str()
            .ok_or_else(|| Error::Decode(format!("expected a username, got {}", generated)))?
            .to_string();

        let update = Mutation::update(
            "users",
            json!({
                "display_name": setup.display_name.trim(),
                "interests": interests,
                "username": username,
            }),
        )
        .eq("id", self.me.id.to_string());
        let profile: Profile = write_one(self.backend(), update).await?;
        info!("Profile set up as {}", username);
        self.me = profile.clone();
        Ok(profile)
    }

    pub async fn profile(&self, user_id: uuid::Uuid) -> Result<Option<Profile>> {
        let query = Query::table("users")
            .select(PROFILE_COLUMNS)
            .eq("id", user_id.to_string());
        fetch_optional(self.backend(), &query).await
    }
}
