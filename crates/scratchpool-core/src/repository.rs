//! Resource record repository
//!
//! Filtered queries and keyed writes over ResourceInfo and ActiveResource
//! records. Reads may lag recent writes; nothing here re-derives an id it
//! could have taken from a create response.

use crate::config::RetrySettings;
use crate::error::{PoolError, RemoteError};
use crate::logging::LogContext;
use crate::query::{Condition, Direction, SoqlQuery};
use crate::remote::{fields, Fields, Precondition, Record, RemoteClient};
use crate::retry::RetryExecutor;
use crate::schema::{self, field};
use crate::types::{ActiveResource, AllocationStatus, RecordId, ResourceInfo, ResourceStatus};
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The record is now assigned to the requester
    Claimed,
    /// Another caller holds it
    Lost,
    /// The write may have applied, but no read fresh enough to tell arrived
    /// within the visibility budget. The record is not handed out; if the
    /// write did apply it stays Assigned until it expires and is swept.
    Unconfirmed,
}

/// Query and write access to pool records
#[derive(Clone)]
pub struct ResourceRecordRepository {
    remote: Arc<dyn RemoteClient>,
    records: RetryExecutor,
    visibility: RetryExecutor,
    hub_username: Option<String>,
    log: LogContext,
}

impl std::fmt::Debug for ResourceRecordRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRecordRepository")
            .field("hub_username", &self.hub_username)
            .finish_non_exhaustive()
    }
}

impl ResourceRecordRepository {
    /// Create repository
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteClient>, retry: &RetrySettings, log: &LogContext) -> Self {
        let log = log.child("repository");
        Self {
            remote,
            records: RetryExecutor::new(retry.records, log.clone()),
            visibility: RetryExecutor::new(retry.visibility, log.clone()),
            hub_username: None,
            log,
        }
    }

    /// Username of the hub session, used for "my pool only" filters
    #[must_use]
    pub fn with_hub_username(mut self, username: impl Into<String>) -> Self {
        self.hub_username = Some(username.into());
        self
    }

    /// Hub username, if known
    #[inline]
    #[must_use]
    pub fn hub_username(&self) -> Option<&str> {
        self.hub_username.as_deref()
    }

    /// Underlying client
    #[inline]
    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    async fn query(&self, name: &str, query: &SoqlQuery) -> Result<Vec<Record>, PoolError> {
        tracing::trace!(parent: self.log.span(), query = %query, "QUERY");
        self.records
            .execute(name, || self.remote.query(query))
            .await
            .map_err(PoolError::from)
    }

    fn parse_infos(&self, rows: &[Record]) -> Vec<ResourceInfo> {
        rows.iter()
            .filter_map(|row| match ResourceInfo::from_record(row) {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::warn!(parent: self.log.span(), "skipping record: {e}");
                    None
                }
            })
            .collect()
    }

    fn tag_filter(&self, tag: &str, only_mine: bool) -> Result<Condition, PoolError> {
        let mut filter = Condition::eq(field::TAG, tag)
            .and(Condition::eq(field::STATUS, ResourceStatus::Active.as_str()));
        if only_mine {
            let username = self.hub_username.as_deref().ok_or_else(|| {
                PoolError::Config("my-pool filter requested without a hub username".into())
            })?;
            filter = filter.and(Condition::eq(field::CREATED_BY_USERNAME, username));
        }
        Ok(filter)
    }

    /// Active records for `tag`, oldest first
    ///
    /// # Errors
    /// Remote failures after retries; `PoolError::Config` if `only_mine` is
    /// set without a hub username.
    pub async fn find_by_tag(
        &self,
        tag: &str,
        only_mine: bool,
        only_unassigned: bool,
    ) -> Result<Vec<ResourceInfo>, PoolError> {
        let mut filter = self.tag_filter(tag, only_mine)?;
        if only_unassigned {
            filter = filter.and(Condition::not_in(
                field::ALLOCATION,
                [
                    AllocationStatus::Assigned.as_str(),
                    AllocationStatus::InProgress.as_str(),
                ],
            ));
        }

        let query = SoqlQuery::from(schema::RESOURCE_INFO)
            .select(schema::RESOURCE_INFO_FIELDS)
            .filter(filter)
            .order_by(field::CREATED_DATE, Direction::Asc);

        let rows = self.query("find_by_tag", &query).await?;
        Ok(self.parse_infos(&rows))
    }

    /// Number of Active records for `tag`
    ///
    /// # Errors
    /// See [`ResourceRecordRepository::find_by_tag`].
    pub async fn find_active_count_by_tag(
        &self,
        tag: &str,
        only_mine: bool,
    ) -> Result<usize, PoolError> {
        let query = SoqlQuery::from(schema::RESOURCE_INFO)
            .count()
            .filter(self.tag_filter(tag, only_mine)?);
        tracing::trace!(parent: self.log.span(), query = %query, "COUNT");
        self.records
            .execute("count_by_tag", || self.remote.count(&query))
            .await
            .map_err(PoolError::from)
    }

    /// Record by id, if visible
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn find_by_id(&self, id: &RecordId) -> Result<Option<ResourceInfo>, PoolError> {
        let rows = self.query("find_by_id", &by_id(id)).await?;
        Ok(self.parse_infos(&rows).into_iter().next())
    }

    /// Record for a signup username, polling until the environment is live
    ///
    /// The hub fills in the login URL and environment id some time after the
    /// record first becomes queryable; a row without them counts as not yet
    /// visible.
    ///
    /// # Errors
    /// `PoolError::NotYetVisible` if it is still missing or incomplete once the
    /// visibility budget is spent.
    pub async fn await_by_signup_username(&self, username: &str) -> Result<ResourceInfo, PoolError> {
        let query = SoqlQuery::from(schema::RESOURCE_INFO)
            .select(schema::RESOURCE_INFO_FIELDS)
            .filter(Condition::eq(field::SIGNUP_USERNAME, username))
            .limit(1);

        self.visibility
            .execute("await_signup_record", || async {
                let rows = self.remote.query(&query).await?;
                let not_visible = || PoolError::NotYetVisible {
                    object: schema::RESOURCE_INFO.to_string(),
                    key: username.to_string(),
                };
                let info = ResourceInfo::from_record(rows.first().ok_or_else(not_visible)?)?;
                if info.login_url.is_none() || info.remote_resource_id.is_none() {
                    return Err(not_visible());
                }
                Ok(info)
            })
            .await
    }

    /// Expired Active records and Error records for `tag`
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn find_retirable(
        &self,
        tag: &str,
        today: NaiveDate,
    ) -> Result<Vec<ResourceInfo>, PoolError> {
        let expired = Condition::eq(field::STATUS, ResourceStatus::Active.as_str())
            .and(Condition::lt(field::EXPIRATION_DATE, today));
        let failed = Condition::eq(field::STATUS, ResourceStatus::Error.as_str());

        let query = SoqlQuery::from(schema::RESOURCE_INFO)
            .select(schema::RESOURCE_INFO_FIELDS)
            .filter(Condition::eq(field::TAG, tag))
            .filter(expired.or(failed))
            .order_by(field::CREATED_DATE, Direction::Asc);

        let rows = self.query("find_retirable", &query).await?;
        Ok(self.parse_infos(&rows))
    }

    /// Apply `fields` to each record, returning per-id success
    ///
    /// Failures are logged, never raised; the vector lines up with `ids`.
    pub async fn update_allocation(&self, ids: &[RecordId], fields: &Fields) -> Vec<bool> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self
                .records
                .execute("update_allocation", || {
                    self.remote.update(schema::RESOURCE_INFO, id, fields, None)
                })
                .await;
            if let Err(e) = &outcome {
                tracing::warn!(parent: self.log.span(), "failure at setting {id}: {e}");
            }
            results.push(outcome.is_ok());
        }
        results
    }

    /// Conditionally mark `resource` Assigned to `requester`
    ///
    /// A precondition failure means someone wrote the record after it was
    /// read; the record is re-read so that a claim whose response was lost on
    /// an earlier attempt is still recognised as ours. Reads older than that
    /// write are discarded and polled again.
    ///
    /// # Errors
    /// Remote failures other than a lost race.
    pub async fn claim(
        &self,
        resource: &ResourceInfo,
        requester: &str,
    ) -> Result<ClaimOutcome, PoolError> {
        let update = fields([
            (field::ALLOCATION, Value::from(AllocationStatus::Assigned.as_str())),
            (field::ASSIGNEE, Value::from(requester)),
        ]);
        let precondition = resource
            .last_modified
            .map(|ts| Precondition { unmodified_since: ts });

        let outcome = self
            .records
            .execute("claim", || {
                self.remote
                    .update(schema::RESOURCE_INFO, &resource.id, &update, precondition)
            })
            .await;

        match outcome {
            Ok(()) => Ok(ClaimOutcome::Claimed),
            Err(RemoteError::PreconditionFailed(_)) => {
                match self.await_newer(resource).await {
                    Ok(current) => {
                        let ours = current.is_some_and(|r| {
                            r.allocation_status == AllocationStatus::Assigned
                                && r.assignee.as_deref() == Some(requester)
                        });
                        Ok(if ours {
                            ClaimOutcome::Claimed
                        } else {
                            ClaimOutcome::Lost
                        })
                    }
                    Err(PoolError::NotYetVisible { .. }) => {
                        tracing::warn!(
                            parent: self.log.span(),
                            "claim of {} by {requester} could not be confirmed",
                            resource.id
                        );
                        Ok(ClaimOutcome::Unconfirmed)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current state of `resource`, once a read newer than `last_modified`
    /// shows up; `None` if the record is gone
    async fn await_newer(&self, resource: &ResourceInfo) -> Result<Option<ResourceInfo>, PoolError> {
        let query = by_id(&resource.id);
        self.visibility
            .execute("claim_reread", || async {
                let rows = self.remote.query(&query).await?;
                let Some(row) = rows.first() else {
                    return Ok(None);
                };
                let current = ResourceInfo::from_record(row)?;
                if current.last_modified > resource.last_modified {
                    Ok(Some(current))
                } else {
                    Err(PoolError::NotYetVisible {
                        object: schema::RESOURCE_INFO.to_string(),
                        key: resource.id.to_string(),
                    })
                }
            })
            .await
    }

    /// Return an Assigned record to Unassigned
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn release(&self, id: &RecordId) -> Result<(), PoolError> {
        let update = fields([
            (field::ALLOCATION, Value::from(AllocationStatus::Unassigned.as_str())),
            (field::ASSIGNEE, Value::Null),
        ]);
        self.records
            .execute("release", || {
                self.remote.update(schema::RESOURCE_INFO, id, &update, None)
            })
            .await
            .map_err(PoolError::from)
    }

    /// Write a lifecycle status (plus any extra fields) keyed by id
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn set_status(
        &self,
        id: &RecordId,
        status: ResourceStatus,
        extra: Fields,
    ) -> Result<(), PoolError> {
        let mut update = extra;
        update.insert(field::STATUS.to_string(), Value::from(status.as_str()));
        self.records
            .execute("set_status", || {
                self.remote.update(schema::RESOURCE_INFO, id, &update, None)
            })
            .await
            .map_err(PoolError::from)
    }

    /// Map external environment ids (15-char form) to ResourceInfo ids
    ///
    /// # Errors
    /// `PoolError::NotYetVisible` if some ids never show up within the
    /// visibility budget.
    pub async fn resolve_record_ids_by_remote_id(
        &self,
        remote_ids: &[RecordId],
    ) -> Result<HashMap<String, RecordId>, PoolError> {
        if remote_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let shorts: Vec<&str> = remote_ids.iter().map(RecordId::short).collect();
        let query = SoqlQuery::from(schema::RESOURCE_INFO)
            .select(&[field::ID, field::REMOTE_ID])
            .filter(Condition::is_in(field::REMOTE_ID, shorts.iter().copied()));

        self.visibility
            .execute("resolve_record_ids", || async {
                let rows = self.remote.query(&query).await?;
                let mut map = HashMap::new();
                for row in &rows {
                    let id = row.get(field::ID).and_then(Value::as_str);
                    let remote = row.get(field::REMOTE_ID).and_then(Value::as_str);
                    if let (Some(id), Some(remote)) = (id, remote) {
                        let id = RecordId::parse(id).map_err(|raw| {
                            PoolError::malformed(schema::RESOURCE_INFO, format!("bad Id {raw:?}"))
                        })?;
                        let short = remote.get(..15).unwrap_or(remote).to_string();
                        map.insert(short, id);
                    }
                }
                if let Some(missing) = shorts.iter().find(|s| !map.contains_key(**s)) {
                    return Err(PoolError::NotYetVisible {
                        object: schema::RESOURCE_INFO.to_string(),
                        key: (*missing).to_string(),
                    });
                }
                Ok(map)
            })
            .await
    }

    /// Live environments linked to the given ResourceInfo ids
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn find_active_by_info_ids(
        &self,
        info_ids: &[RecordId],
    ) -> Result<Vec<ActiveResource>, PoolError> {
        if info_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = SoqlQuery::from(schema::ACTIVE_RESOURCE)
            .select(&[field::ID, field::INFO_ID, field::SIGNUP_USERNAME, field::SIGNUP_EMAIL])
            .filter(Condition::is_in(
                field::INFO_ID,
                info_ids.iter().map(RecordId::as_str),
            ));
        let rows = self.query("find_active_by_info_ids", &query).await?;
        Ok(self.parse_active(&rows))
    }

    /// All live environments on the hub
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn list_active_resources(&self) -> Result<Vec<ActiveResource>, PoolError> {
        let query = SoqlQuery::from(schema::ACTIVE_RESOURCE).select(&[
            field::ID,
            field::INFO_ID,
            field::SIGNUP_USERNAME,
            field::SIGNUP_EMAIL,
        ]);
        let rows = self.query("list_active_resources", &query).await?;
        Ok(self.parse_active(&rows))
    }

    fn parse_active(&self, rows: &[Record]) -> Vec<ActiveResource> {
        rows.iter()
            .filter_map(|row| match ActiveResource::from_record(row) {
                Ok(active) => Some(active),
                Err(e) => {
                    tracing::warn!(parent: self.log.span(), "skipping record: {e}");
                    None
                }
            })
            .collect()
    }

    /// Delete a live environment; an already-deleted one is a no-op
    ///
    /// Returns whether this call removed it.
    ///
    /// # Errors
    /// Remote failures other than not-found.
    pub async fn delete_active(&self, id: &RecordId) -> Result<bool, PoolError> {
        let outcome = self
            .records
            .execute("delete_active", || {
                self.remote.delete(schema::ACTIVE_RESOURCE, id)
            })
            .await;
        match outcome {
            Ok(()) => Ok(true),
            Err(RemoteError::NotFound(_)) => {
                tracing::debug!(parent: self.log.span(), "{id} already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn by_id(id: &RecordId) -> SoqlQuery {
    SoqlQuery::from(schema::RESOURCE_INFO)
        .select(schema::RESOURCE_INFO_FIELDS)
        .filter(Condition::eq(field::ID, id.as_str()))
        .limit(1)
}
