//! Typed client for the hosted backend: table queries and mutations, RPC,
//! object storage and phone/OAuth sign-in.

pub mod auth;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod query;
pub mod rest;

use std::future::Future;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

pub use config::BackendConfig;
pub use error::{Error, Result};
pub use query::{Filter, Mutation, Op, Query};
pub use rest::RestBackend;

/// Operations the client needs from the backend. Rows travel as JSON and
/// are parsed into records by the callers.
pub trait Backend: Send + Sync + 'static {
    fn select(&self, query: &Query) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Rows are returned only when the mutation asks for them.
    fn mutate(&self, mutation: &Mutation) -> impl Future<Output = Result<Vec<Value>>> + Send;

    fn rpc(&self, function: &str, args: Value) -> impl Future<Output = Result<Value>> + Send;

    /// Store an object and return its public URL.
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}

pub async fn fetch_all<T: DeserializeOwned>(backend: &impl Backend, query: &Query) -> Result<Vec<T>> {
    decode_rows(backend.select(query).await?)
}

/// Like [`fetch_all`], but rows that fail to parse are logged and skipped.
pub async fn fetch_lenient<T: DeserializeOwned>(backend: &impl Backend, query: &Query) -> Result<Vec<T>> {
    let rows = backend.select(query).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Dropping malformed {} row: {}", query.table, e);
                None
            }
        })
        .collect())
}

pub async fn fetch_optional<T: DeserializeOwned>(backend: &impl Backend, query: &Query) -> Result<Option<T>> {
    let rows = backend.select(&query.clone().limit(1)).await?;
    match rows.into_iter().next() {
        Some(row) => Ok(Some(serde_json::from_value(row)?)),
        None => Ok(None),
    }
}

pub async fn fetch_one<T: DeserializeOwned>(backend: &impl Backend, query: &Query) -> Result<T> {
    fetch_optional(backend, query)
        .await?
        .ok_or_else(|| Error::NotFound(format!("{} row", query.table)))
}

/// Run a mutation that returns exactly one row.
pub async fn write_one<T: DeserializeOwned>(backend: &impl Backend, mutation: Mutation) -> Result<T> {
    let table = mutation.table.clone();
    let rows = backend.mutate(&mutation.returning()).await?;
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("{} row", table)))?;
    Ok(serde_json::from_value(row)?)
}

pub async fn write(backend: &impl Backend, mutation: Mutation) -> Result<()> {
    backend.mutate(&mutation).await.map(|_| ())
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Error::from))
        .collect()
}
