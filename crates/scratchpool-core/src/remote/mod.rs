//! Remote store RPC boundary
//!
//! [`RemoteClient`] is the only way the pool touches the remote store. Every
//! call is a single round trip with no internal retry; callers wrap calls in
//! the retry combinator where needed.

mod http;

pub use http::HttpRemoteClient;

use crate::error::RemoteError;
use crate::query::SoqlQuery;
use crate::types::RecordId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw record as returned by the remote store
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Field values for create/update calls
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Build a [`Fields`] map from `(name, value)` pairs
pub fn fields<I, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<serde_json::Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect()
}

/// Authenticated session handle, obtained and refreshed elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConnection {
    /// e.g. `https://mydomain.my.salesforce.com`
    pub instance_url: String,
    /// Bearer token
    pub access_token: String,
    /// e.g. `58.0`
    pub api_version: String,
}

impl HubConnection {
    /// Create new connection handle
    #[inline]
    #[must_use]
    pub fn new(
        instance_url: impl Into<String>,
        access_token: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            api_version: api_version.into(),
        }
    }

    /// `/services/data/vXX.X`
    #[must_use]
    pub fn data_path(&self) -> String {
        format!("/services/data/v{}", self.api_version)
    }
}

/// Guard for a conditional update
///
/// The write only applies if the record has not been modified after
/// `unmodified_since`; otherwise the call fails with
/// [`RemoteError::PreconditionFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precondition {
    /// Last modification the caller observed
    pub unmodified_since: DateTime<Utc>,
}

/// Minimal RPC surface of the remote store
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Run a query, following pagination to completion
    async fn query(&self, query: &SoqlQuery) -> Result<Vec<Record>, RemoteError>;

    /// Run a `COUNT()` query and return the matching row count
    async fn count(&self, query: &SoqlQuery) -> Result<usize, RemoteError>;

    /// Create a record; returns its id from the create response
    async fn create(&self, object: &str, fields: &Fields) -> Result<RecordId, RemoteError>;

    /// Update a record by id, optionally guarded by a precondition
    async fn update(
        &self,
        object: &str,
        id: &RecordId,
        fields: &Fields,
        precondition: Option<Precondition>,
    ) -> Result<(), RemoteError>;

    /// Delete a record by id
    async fn delete(&self, object: &str, id: &RecordId) -> Result<(), RemoteError>;

    /// GET a resource path relative to the instance (e.g. a record's `attributes.url`)
    async fn get(&self, path: &str) -> Result<serde_json::Value, RemoteError>;

    /// POST a JSON body to a resource path relative to the instance
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError>;
}
