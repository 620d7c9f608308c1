use std::sync::RwLock;

use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::BackendConfig;
use crate::error::{self, Error, Result};
use crate::query::{Mutation, MutationKind, Query};
use crate::Backend;

/// [`Backend`] over the hosted REST, RPC and storage endpoints.
pub struct RestBackend {
    http: Client,
    config: BackendConfig,
    access_token: RwLock<Option<String>>,
}

impl RestBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            config,
            access_token: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Requests run as the signed-in user when a token is set, and as the
    /// anonymous role otherwise.
    pub fn set_access_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.access_token.write() {
            *slot = token;
        }
    }

    fn bearer(&self) -> String {
        self.access_token
            .read()
            .ok()
            .and_then(|t| t.clone())
            .unwrap_or_else(|| self.config.anon_key.clone())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.config.endpoint(path))
            .header("apikey", &self.config.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
    }
}

/// Check the status and parse the body; an empty body reads as `null`.
async fn read_json(resp: Response) -> Result<Value> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(error::from_response(status, &body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        row => vec![row],
    }
}

impl Backend for RestBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        debug!("GET {} {:?}", query.table, query.to_params());
        let resp = self
            .request(Method::GET, &format!("rest/v1/{}", query.table))
            .query(&query.to_params())
            .send()
            .await?;
        read_json(resp).await.map(into_rows)
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Vec<Value>> {
        let method = match mutation.kind {
            MutationKind::Insert(_) | MutationKind::Upsert { .. } => Method::POST,
            MutationKind::Update(_) => Method::PATCH,
            MutationKind::Delete => Method::DELETE,
        };
        debug!("{} {} {:?}", method, mutation.table, mutation.to_params());

        let mut req = self
            .request(method, &format!("rest/v1/{}", mutation.table))
            .query(&mutation.to_params())
            .header("Prefer", mutation.prefer());
        if let Some(body) = mutation.body() {
            req = req.json(body);
        }
        let resp = req.send().await?;
        read_json(resp).await.map(into_rows)
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value> {
        debug!("RPC {}", function);
        let resp = self
            .request(Method::POST, &format!("rest/v1/rpc/{}", function))
            .json(&args)
            .send()
            .await?;
        read_json(resp).await
    }

    async fn upload(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<String> {
        debug!("Uploading {} bytes to {}/{}", data.len(), bucket, path);
        let resp = self
            .request(Method::POST, &format!("storage/v1/object/{}/{}", bucket, path))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(data)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("Upload to {}/{} failed ({}): {}", bucket, path, status, body);
            return Err(match error::from_response(status, &body) {
                Error::Backend { message, .. } => Error::Storage(message),
                other => other,
            });
        }
        Ok(self.config.public_object_url(bucket, path))
    }
}
