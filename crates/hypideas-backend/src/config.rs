use std::path::PathBuf;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_STORAGE_BUCKET: &str = "chat-files";
pub const DEFAULT_SESSION_PATH: &str = ".hypideas-session.json";
pub const DEFAULT_OAUTH_REDIRECT: &str = "hypideas://auth/callback";

/// Connection settings for the hosted backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: Url,
    pub anon_key: String,
    pub storage_bucket: String,
    pub session_path: PathBuf,
    pub oauth_redirect: String,
}

impl BackendConfig {
    pub fn new(url: &str, anon_key: &str) -> Result<Self> {
        let url = Url::parse(url.trim_end_matches('/'))
            .map_err(|e| Error::Config(format!("invalid backend url '{}': {}", url, e)))?;
        if anon_key.trim().is_empty() {
            return Err(Error::Config("anon key is empty".into()));
        }
        Ok(Self {
            url,
            anon_key: anon_key.to_string(),
            storage_bucket: DEFAULT_STORAGE_BUCKET.into(),
            session_path: PathBuf::from(DEFAULT_SESSION_PATH),
            oauth_redirect: DEFAULT_OAUTH_REDIRECT.into(),
        })
    }

    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{} must be set", key)))
        };

        let mut config = Self::new(
            &required("HYPIDEAS_BACKEND_URL")?,
            &required("HYPIDEAS_ANON_KEY")?,
        )?;
        if let Some(bucket) = lookup("HYPIDEAS_STORAGE_BUCKET") {
            config.storage_bucket = bucket;
        }
        if let Some(path) = lookup("HYPIDEAS_SESSION_PATH") {
            config.session_path = PathBuf::from(path);
        }
        if let Some(redirect) = lookup("HYPIDEAS_OAUTH_REDIRECT") {
            config.oauth_redirect = redirect;
        }
        Ok(config)
    }

    /// Base URL with `path` appended; `path` must not start with a slash.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url.as_str().trim_end_matches('/'), path)
    }

    /// Websocket endpoint of the realtime service.
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.url.clone();
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme)
            .map_err(|_| Error::Config(format!("cannot derive websocket url from {}", self.url)))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        self.endpoint(&format!("storage/v1/object/public/{}/{}", bucket, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn required_values_and_defaults() {
        assert!(matches!(
            BackendConfig::from_lookup(lookup(&[("HYPIDEAS_ANON_KEY", "k")])),
            Err(Error::Config(_))
        ));

        let config = BackendConfig::from_lookup(lookup(&[
            ("HYPIDEAS_BACKEND_URL", "https://abc.example.co/"),
            ("HYPIDEAS_ANON_KEY", "anon"),
        ]))
        .unwrap();
        assert_eq!(config.storage_bucket, "chat-files");
        assert_eq!(config.endpoint("rest/v1/posts"), "https://abc.example.co/rest/v1/posts");
        assert_eq!(
            config.realtime_url().unwrap().as_str(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert_eq!(
            config.public_object_url("chat-files", "u/1.png"),
            "https://abc.example.co/storage/v1/object/public/chat-files/u/1.png"
        );
    }

    #[test]
    fn invalid_url_is_config_error() {
        assert!(matches!(BackendConfig::new("not a url", "k"), Err(Error::Config(_))));
    }
}
