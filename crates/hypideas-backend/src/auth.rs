use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use hypideas_types::api::Claims;

use crate::config::BackendConfig;
use crate::error::{self, Error, Result};

/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// A signed-in session as issued by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: Uuid,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<AuthUser>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: Uuid,
    #[serde(default)]
    phone: Option<String>,
}

impl Session {
    fn from_tokens(resp: TokenResponse, now: DateTime<Utc>) -> Result<Self> {
        let claims = decode_claims(&resp.access_token)?;
        let expires_at = resp
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| resp.expires_in.map(|secs| now + Duration::seconds(secs)))
            .or_else(|| DateTime::from_timestamp(claims.exp as i64, 0))
            .ok_or_else(|| Error::Decode("session has no expiry".into()))?;
        let (user_id, phone) = match resp.user {
            Some(user) => (user.id, user.phone.or(claims.phone)),
            None => (claims.sub, claims.phone),
        };
        Ok(Session {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at,
            user_id,
            phone,
        })
    }

    /// Session carried in the fragment of an OAuth redirect, e.g.
    /// `hypideas://auth/callback#access_token=..&refresh_token=..&expires_in=3600`.
    pub fn from_redirect(redirect: &Url) -> Result<Self> {
        let fragment = redirect
            .fragment()
            .ok_or_else(|| Error::Unauthorized("redirect carries no session".into()))?;
        let params: HashMap<String, String> = url::form_urlencoded::parse(fragment.as_bytes())
            .into_owned()
            .collect();

        if let Some(description) = params.get("error_description").or(params.get("error")) {
            return Err(Error::Unauthorized(description.clone()));
        }
        let field = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Decode(format!("redirect is missing {}", name)))
        };
        let resp = TokenResponse {
            access_token: field("access_token")?,
            refresh_token: field("refresh_token")?,
            expires_in: params.get("expires_in").and_then(|v| v.parse().ok()),
            expires_at: params.get("expires_at").and_then(|v| v.parse().ok()),
            user: None,
        };
        Self::from_tokens(resp, Utc::now())
    }

    pub fn claims(&self) -> Result<Claims> {
        decode_claims(&self.access_token)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

/// Read the claims of an access token. The signature is checked by the
/// backend on every request, so it is not verified here.
pub fn decode_claims(token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::Unauthorized(format!("invalid access token: {}", e)))
}

/// Client for the phone OTP and OAuth sign-in endpoints.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    config: BackendConfig,
}

impl AuthClient {
    pub fn new(config: BackendConfig) -> Result<Self> {
        Ok(Self {
            http: Client::builder().build()?,
            config,
        })
    }

    async fn post(&self, path: &str, bearer: Option<&str>, body: serde_json::Value) -> Result<String> {
        let resp = self
            .http
            .post(self.config.endpoint(path))
            .header("apikey", &self.config.anon_key)
            .header(
                "Authorization",
                format!("Bearer {}", bearer.unwrap_or(&self.config.anon_key)),
            )
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(error::from_response(status, &text));
        }
        Ok(text)
    }

    /// Text a one-time code to `phone` (already normalized).
    pub async fn send_otp(&self, phone: &str) -> Result<()> {
        debug!("Requesting OTP");
        self.post("auth/v1/otp", None, json!({ "phone": phone })).await?;
        Ok(())
    }

    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<Session> {
        let body = self
            .post(
                "auth/v1/verify",
                None,
                json!({ "type": "sms", "phone": phone, "token": code }),
            )
            .await?;
        let session = Session::from_tokens(serde_json::from_str(&body)?, Utc::now())?;
        info!("Signed in as {}", session.user_id);
        Ok(session)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let body = self
            .post(
                "auth/v1/token?grant_type=refresh_token",
                None,
                json!({ "refresh_token": refresh_token }),
            )
            .await?;
        let session = Session::from_tokens(serde_json::from_str(&body)?, Utc::now())?;
        debug!("Refreshed session for {}", session.user_id);
        Ok(session)
    }

    pub async fn logout(&self, access_token: &str) -> Result<()> {
        self.post("auth/v1/logout", Some(access_token), json!({})).await?;
        info!("Signed out");
        Ok(())
    }

    /// URL to open in a browser to start an OAuth sign-in with `provider`.
    pub fn authorize_url(&self, provider: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.endpoint("auth/v1/authorize"))
            .map_err(|e| Error::Config(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", &self.config.oauth_redirect);
        Ok(url)
    }
}
