//! REST implementation of [`RemoteClient`] over `reqwest`

use super::{Fields, HubConnection, Precondition, Record, RemoteClient};
use crate::error::RemoteError;
use crate::logging::LogContext;
use crate::query::{QueryApi, SoqlQuery};
use crate::types::RecordId;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, IF_UNMODIFIED_SINCE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(rename = "nextRecordsUrl", default)]
    next_records_url: Option<String>,
    #[serde(rename = "totalSize", default)]
    total_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "errorCode", alias = "statusCode", default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Authenticated REST client for the hub
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    http: reqwest::Client,
    conn: HubConnection,
    log: LogContext,
}

impl HttpRemoteClient {
    /// Create client for a session handle
    ///
    /// # Errors
    /// `RemoteError::Transport` if the HTTP client cannot be built.
    pub fn new(conn: HubConnection, log: LogContext) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self { http, conn, log })
    }

    /// Session handle in use
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &HubConnection {
        &self.conn
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.conn.instance_url, path)
        }
    }

    fn query_endpoint(&self, query: &SoqlQuery) -> String {
        match query.api {
            QueryApi::Data => format!("{}/query", self.conn.data_path()),
            QueryApi::Tooling => format!("{}/tooling/query", self.conn.data_path()),
        }
    }

    fn sobject_path(&self, object: &str, id: Option<&RecordId>) -> String {
        match id {
            Some(id) => format!("{}/sobjects/{object}/{id}", self.conn.data_path()),
            None => format!("{}/sobjects/{object}", self.conn.data_path()),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .bearer_auth(&self.conn.access_token)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(parent: self.log.span(), %status, body = %body, "remote call failed");
        Err(map_status(status, &body))
    }

    async fn json(&self, request: RequestBuilder) -> Result<serde_json::Value, RemoteError> {
        let response = self.send(request).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::Malformed(e.to_string()))
    }
}

/// Map a non-success status and body to a typed error
fn map_status(status: StatusCode, body: &str) -> RemoteError {
    let first = serde_json::from_str::<Vec<ApiError>>(body)
        .ok()
        .and_then(|mut errs| (!errs.is_empty()).then(|| errs.swap_remove(0)))
        .or_else(|| serde_json::from_str::<ApiError>(body).ok());
    let (code, message) = match first {
        Some(e) => (e.code, e.message),
        None => (String::new(), body.to_string()),
    };

    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::PRECONDITION_FAILED => RemoteError::PreconditionFailed(message),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited(message),
        StatusCode::FORBIDDEN if code == "REQUEST_LIMIT_EXCEEDED" => {
            RemoteError::RateLimited(message)
        }
        s if s.is_server_error() => RemoteError::Unavailable {
            status: s.as_u16(),
            message,
        },
        s => RemoteError::Validation {
            code: if code.is_empty() {
                s.as_u16().to_string()
            } else {
                code
            },
            message,
        },
    }
}

/// RFC 7231 HTTP-date
fn http_date(precondition: &Precondition) -> String {
    precondition
        .unmodified_since
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn query(&self, query: &SoqlQuery) -> Result<Vec<Record>, RemoteError> {
        let soql = query.to_soql();
        tracing::trace!(parent: self.log.span(), query = %soql, "QUERY");

        let endpoint = self.query_endpoint(query);

        let first = self
            .json(self.http.get(self.url(&endpoint)).query(&[("q", soql.as_str())]))
            .await?;
        let mut page: QueryPage =
            serde_json::from_value(first).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let mut records = std::mem::take(&mut page.records);

        while let Some(next) = page.next_records_url.take() {
            let value = self.json(self.http.get(self.url(&next))).await?;
            page = serde_json::from_value(value)
                .map_err(|e| RemoteError::Malformed(e.to_string()))?;
            records.append(&mut page.records);
        }

        tracing::trace!(parent: self.log.span(), rows = records.len(), "query complete");
        Ok(records)
    }

    async fn count(&self, query: &SoqlQuery) -> Result<usize, RemoteError> {
        let soql = query.to_soql();
        tracing::trace!(parent: self.log.span(), query = %soql, "COUNT");

        let value = self
            .json(
                self.http
                    .get(self.url(&self.query_endpoint(query)))
                    .query(&[("q", soql.as_str())]),
            )
            .await?;
        let page: QueryPage =
            serde_json::from_value(value).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        page.total_size
            .ok_or_else(|| RemoteError::Malformed("count response without totalSize".into()))
    }

    async fn create(&self, object: &str, fields: &Fields) -> Result<RecordId, RemoteError> {
        let url = self.url(&self.sobject_path(object, None));
        let value = self.json(self.http.post(url).json(fields)).await?;
        let response: CreateResponse =
            serde_json::from_value(value).map_err(|e| RemoteError::Malformed(e.to_string()))?;

        if !response.success {
            let first = response.errors.into_iter().next();
            return Err(RemoteError::Validation {
                code: first.as_ref().map(|e| e.code.clone()).unwrap_or_default(),
                message: first.map(|e| e.message).unwrap_or_default(),
            });
        }

        let raw = response
            .id
            .ok_or_else(|| RemoteError::Malformed("create response without id".into()))?;
        RecordId::parse(raw).map_err(|raw| RemoteError::Malformed(format!("bad id {raw:?}")))
    }

    async fn update(
        &self,
        object: &str,
        id: &RecordId,
        fields: &Fields,
        precondition: Option<Precondition>,
    ) -> Result<(), RemoteError> {
        let url = self.url(&self.sobject_path(object, Some(id)));
        let mut request = self.http.patch(url).json(fields);
        if let Some(p) = precondition {
            let value = HeaderValue::from_str(&http_date(&p))
                .map_err(|e| RemoteError::Malformed(e.to_string()))?;
            request = request.header(IF_UNMODIFIED_SINCE, value);
        }
        self.send(request).await?;
        Ok(())
    }

    async fn delete(&self, object: &str, id: &RecordId) -> Result<(), RemoteError> {
        let url = self.url(&self.sobject_path(object, Some(id)));
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, RemoteError> {
        self.json(self.http.get(self.url(path))).await
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError> {
        self.json(self.http.post(self.url(path)).json(body)).await
    }
}
