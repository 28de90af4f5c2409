//! Sandbox process lookup over the tooling API

use crate::error::PoolError;
use crate::logging::LogContext;
use crate::query::{Condition, Direction, SoqlQuery};
use crate::remote::{Record, RemoteClient};
use crate::schema::{self, field};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Detail of one sandbox refresh or copy process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxProcess {
    /// Process record id
    #[serde(rename = "Id")]
    pub id: String,
    /// Sandbox name
    #[serde(rename = "SandboxName")]
    pub sandbox_name: String,
    /// e.g. `Completed`, `Processing`
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
    /// Copy progress, in percent
    #[serde(rename = "CopyProgress", default)]
    pub copy_progress: Option<u32>,
    /// Last modification timestamp
    #[serde(rename = "LastModifiedDate", default)]
    pub last_modified: Option<String>,
    /// Everything else the detail endpoint returns
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Reads sandbox process history by sandbox name
pub struct SandboxInspector {
    remote: Arc<dyn RemoteClient>,
    log: LogContext,
}

impl SandboxInspector {
    /// Create inspector
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteClient>, log: &LogContext) -> Self {
        Self {
            remote,
            log: log.child("sandbox"),
        }
    }

    /// Processes for sandbox `name`, most recently modified first
    ///
    /// With `show_only_latest` only the newest process detail is fetched.
    ///
    /// # Errors
    /// `PoolError::NotFound` if no process exists for `name`; remote failures;
    /// `PoolError::MalformedRecord` if a detail body cannot be read.
    pub async fn info(&self, name: &str, show_only_latest: bool) -> Result<Vec<SandboxProcess>, PoolError> {
        let query = SoqlQuery::from(schema::SANDBOX_PROCESS)
            .select(&[field::ID, field::SANDBOX_NAME])
            .filter(Condition::is_in(field::SANDBOX_NAME, [name]))
            .order_by(field::LAST_MODIFIED, Direction::Desc)
            .tooling();

        let rows = self.remote.query(&query).await?;
        if rows.is_empty() {
            return Err(PoolError::NotFound(format!(
                "Unable to find a sandbox with name: {name}"
            )));
        }

        let take = if show_only_latest { 1 } else { rows.len() };
        let mut processes = Vec::with_capacity(take);
        for row in rows.iter().take(take) {
            let url = detail_url(row)?;
            tracing::debug!(parent: self.log.span(), "GET {url}");
            let body = self.remote.get(url).await?;
            let process = serde_json::from_value(body)
                .map_err(|e| PoolError::malformed(schema::SANDBOX_PROCESS, e.to_string()))?;
            processes.push(process);
        }
        Ok(processes)
    }
}

fn detail_url(row: &Record) -> Result<&str, PoolError> {
    row.get("attributes")
        .and_then(|a| a.get("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| PoolError::malformed(schema::SANDBOX_PROCESS, "row has no attributes.url"))
}
