//! Pool maintenance
//!
//! Bulk operations run independently of allocation: counting, sweeping
//! expired or failed records, reconciling records against live environments,
//! and reporting hub capacity. Every sweep step is keyed by record id and
//! tolerates work already done by an earlier, interrupted run.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::logging::LogContext;
use crate::remote::Fields;
use crate::repository::ResourceRecordRepository;
use crate::types::{ActiveResource, EnvironmentLimits, RecordId, ResourceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Outcome of a reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Active records seen for the tag
    pub infos: usize,
    /// Of those, records with a live environment
    pub live: usize,
    /// Records marked Deleted because their environment is gone
    pub orphaned: Vec<RecordId>,
}

/// Live environments held by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserUsage {
    /// Signup email of the environment admin
    pub email: String,
    /// Live environments
    pub count: usize,
}

/// Runs counting, sweeping and reporting over the pool
pub struct PoolMaintainer {
    repository: ResourceRecordRepository,
    api_version: String,
    reconcile_grace: Duration,
    log: LogContext,
}

impl PoolMaintainer {
    /// Create maintainer
    #[must_use]
    pub fn new(repository: ResourceRecordRepository, config: &PoolConfig, log: &LogContext) -> Self {
        Self {
            repository,
            api_version: config.api_version.clone(),
            reconcile_grace: config.reconcile_grace(),
            log: log.child("maintainer"),
        }
    }

    /// Number of Active records for `tag`
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn count_active(&self, tag: &str, owner_only: bool) -> Result<usize, PoolError> {
        self.repository.find_active_count_by_tag(tag, owner_only).await
    }

    /// Retire expired and failed records for `tag`
    ///
    /// For each retirable record the live environment (if any) is deleted,
    /// then the record is marked Deleted. A record whose environment cannot
    /// be deleted is left as is for the next sweep. Returns the number of
    /// records retired by this call.
    ///
    /// # Errors
    /// Failures of the initial queries; per-record failures are logged.
    pub async fn expire_and_delete(&self, tag: &str, now: DateTime<Utc>) -> Result<usize, PoolError> {
        let retirable = self.repository.find_retirable(tag, now.date_naive()).await?;
        if retirable.is_empty() {
            tracing::info!(parent: self.log.span(), "nothing to retire in pool {tag}");
            return Ok(0);
        }

        let ids: Vec<RecordId> = retirable.iter().map(|r| r.id.clone()).collect();
        let live = group_by_info(self.repository.find_active_by_info_ids(&ids).await?);

        let mut retired = 0;
        'records: for info in &retirable {
            for active in live.get(info.id.short()).into_iter().flatten() {
                match self.repository.delete_active(&active.id).await {
                    Ok(true) => tracing::info!(
                        parent: self.log.span(),
                        "deleted environment {} of {}",
                        active.id,
                        info.id
                    ),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(
                            parent: self.log.span(),
                            "could not delete environment {}: {e}",
                            active.id
                        );
                        continue 'records;
                    }
                }
            }

            match self
                .repository
                .set_status(&info.id, ResourceStatus::Deleted, Fields::new())
                .await
            {
                Ok(()) => retired += 1,
                Err(e) => tracing::warn!(
                    parent: self.log.span(),
                    "could not mark {} Deleted: {e}",
                    info.id
                ),
            }
        }

        tracing::info!(parent: self.log.span(), "retired {retired} of {} records", retirable.len());
        Ok(retired)
    }

    /// Mark Active records whose environment no longer exists as Deleted
    ///
    /// Records younger than the grace period are skipped; their environment
    /// may simply not be visible yet.
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn reconcile(&self, tag: &str, now: DateTime<Utc>) -> Result<ReconcileReport, PoolError> {
        let infos = self.repository.find_by_tag(tag, false, false).await?;
        let ids: Vec<RecordId> = infos.iter().map(|r| r.id.clone()).collect();
        let live = group_by_info(self.repository.find_active_by_info_ids(&ids).await?);

        let mut report = ReconcileReport {
            infos: infos.len(),
            ..ReconcileReport::default()
        };

        for info in &infos {
            if live.contains_key(info.id.short()) {
                report.live += 1;
                continue;
            }
            let age = now.signed_duration_since(info.created_date).to_std();
            if !age.is_ok_and(|age| age >= self.reconcile_grace) {
                continue;
            }
            self.repository
                .set_status(&info.id, ResourceStatus::Deleted, Fields::new())
                .await?;
            tracing::info!(parent: self.log.span(), "{} has no live environment, marked Deleted", info.id);
            report.orphaned.push(info.id.clone());
        }
        Ok(report)
    }

    /// Hub-wide environment limits
    ///
    /// # Errors
    /// Remote failures, or `PoolError::MalformedRecord` if the limits body
    /// lacks the environment counters.
    pub async fn limits(&self) -> Result<EnvironmentLimits, PoolError> {
        let path = format!("/services/data/v{}/limits", self.api_version);
        let body = self.repository.remote().get(&path).await?;
        serde_json::from_value(body).map_err(|e| PoolError::malformed("limits", e.to_string()))
    }

    /// Live environments per signup email, busiest first
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn usage_by_user(&self) -> Result<Vec<UserUsage>, PoolError> {
        let actives = self.repository.list_active_resources().await?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for active in actives {
            let email = active.signup_email.unwrap_or_default();
            *counts.entry(email).or_default() += 1;
        }

        let mut usage: Vec<UserUsage> = counts
            .into_iter()
            .map(|(email, count)| UserUsage { email, count })
            .collect();
        // stable sort keeps emails alphabetical within equal counts
        usage.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(usage)
    }
}

fn group_by_info(actives: Vec<ActiveResource>) -> HashMap<String, Vec<ActiveResource>> {
    let mut map: HashMap<String, Vec<ActiveResource>> = HashMap::new();
    for active in actives {
        let Some(key) = active.info_id.as_ref().map(|id| id.short().to_string()) else {
            continue;
        };
        map.entry(key).or_default().push(active);
    }
    map
}
