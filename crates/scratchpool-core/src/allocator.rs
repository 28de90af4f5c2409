//! Pool allocator
//!
//! Fetch state machine per record:
//! - `Unassigned -> Assigned` on a won claim (terminal for the cycle)
//! - stays `Unassigned` on a lost race; the next candidate is tried
//!
//! Claims are single-record conditional updates against the shared store,
//! so exclusion between concurrent fetchers is as strong as the store's
//! conditional writes. Candidates are claimed one at a time, oldest first.
//! Shortfall environments are provisioned already assigned to the requester
//! and are never visible to other fetchers as Unassigned.

use crate::error::PoolError;
use crate::logging::LogContext;
use crate::provisioning::{EnvironmentTemplate, ProvisionRequest, ProvisioningEngine};
use crate::repository::{ClaimOutcome, ResourceRecordRepository};
use crate::types::{AllocatedHandle, RecordId, RequestId};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Parameters of one fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Pool tag
    pub tag: String,
    /// Environments wanted
    pub count: usize,
    /// Only consider records created by the hub user
    pub only_mine: bool,
    /// Provision fresh environments for any shortfall
    pub allow_provision_fallback: bool,
    /// Identity recorded as assignee; must be unique per caller
    pub requester: String,
}

impl FetchRequest {
    /// Fetch one environment from `tag`
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            count: 1,
            only_mine: false,
            allow_provision_fallback: false,
            requester: format!("fetch-{}", RequestId::new()),
        }
    }

    /// With count
    #[inline]
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Restrict to my pool
    #[inline]
    #[must_use]
    pub fn only_mine(mut self, only_mine: bool) -> Self {
        self.only_mine = only_mine;
        self
    }

    /// Allow provisioning fallback
    #[inline]
    #[must_use]
    pub fn with_fallback(mut self, allow: bool) -> Self {
        self.allow_provision_fallback = allow;
        self
    }

    /// With requester identity
    #[inline]
    #[must_use]
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }
}

/// Result of a fetch; a shortfall is reported, not raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    /// Claimed or freshly provisioned environments
    pub handles: Vec<AllocatedHandle>,
    /// Environments requested
    pub requested: usize,
    /// Environments that could not be supplied
    pub shortfall: usize,
    /// Non-fatal problems (partial provisioning, skipped records)
    pub warnings: Vec<String>,
}

impl FetchOutcome {
    /// Whether the pool could not satisfy the request
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.shortfall > 0
    }
}

/// What to provision when the pool runs dry
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackSettings {
    /// Template for fresh environments
    pub template: EnvironmentTemplate,
    /// Lifetime of fresh environments
    pub expiry_days: u32,
    /// Requester to notify about fresh environments
    pub owner_email: Option<String>,
}

/// Claims pool records for callers
pub struct PoolAllocator {
    repository: ResourceRecordRepository,
    fallback: Option<(Arc<ProvisioningEngine>, FallbackSettings)>,
    log: LogContext,
}

impl PoolAllocator {
    /// Create allocator without provisioning fallback
    #[must_use]
    pub fn new(repository: ResourceRecordRepository, log: &LogContext) -> Self {
        Self {
            repository,
            fallback: None,
            log: log.child("allocator"),
        }
    }

    /// Enable provisioning fallback
    #[must_use]
    pub fn with_fallback(mut self, engine: Arc<ProvisioningEngine>, settings: FallbackSettings) -> Self {
        self.fallback = Some((engine, settings));
        self
    }

    /// Fetch environments as of today
    ///
    /// # Errors
    /// See [`PoolAllocator::fetch_at`].
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, PoolError> {
        self.fetch_at(request, Utc::now().date_naive()).await
    }

    /// Fetch environments, treating records expiring before `today` as unusable
    ///
    /// # Errors
    /// Remote failures that are neither lost races nor per-slot provisioning
    /// failures. Records claimed before such a failure are released first.
    pub async fn fetch_at(
        &self,
        request: &FetchRequest,
        today: NaiveDate,
    ) -> Result<FetchOutcome, PoolError> {
        let mut outcome = FetchOutcome {
            handles: Vec::with_capacity(request.count),
            requested: request.count,
            shortfall: 0,
            warnings: Vec::new(),
        };
        if request.count == 0 {
            return Ok(outcome);
        }

        tracing::info!(
            parent: self.log.span(),
            tag = %request.tag,
            count = request.count,
            "fetching from pool"
        );

        if let Err(e) = self.claim_from_pool(request, today, &mut outcome).await {
            self.release_all(&outcome.handles).await;
            return Err(e);
        }

        if outcome.handles.len() < request.count && request.allow_provision_fallback {
            if let Err(e) = self.provision_shortfall(request, &mut outcome).await {
                self.release_all(&outcome.handles).await;
                return Err(e);
            }
        }

        outcome.shortfall = request.count - outcome.handles.len();
        if outcome.is_exhausted() {
            tracing::warn!(
                parent: self.log.span(),
                "pool {} exhausted: supplied {} of {}",
                request.tag,
                outcome.handles.len(),
                request.count
            );
        }
        Ok(outcome)
    }

    async fn claim_from_pool(
        &self,
        request: &FetchRequest,
        today: NaiveDate,
        outcome: &mut FetchOutcome,
    ) -> Result<(), PoolError> {
        let candidates = self
            .repository
            .find_by_tag(&request.tag, request.only_mine, true)
            .await?;
        tracing::debug!(parent: self.log.span(), "{} candidates", candidates.len());

        for candidate in candidates {
            if outcome.handles.len() >= request.count {
                break;
            }
            if !candidate.is_claimable(today) {
                continue;
            }
            let handle = match AllocatedHandle::from_resource(&candidate) {
                Ok(handle) => handle,
                Err(e) => {
                    outcome.warnings.push(e.to_string());
                    continue;
                }
            };

            match self.repository.claim(&candidate, &request.requester).await? {
                ClaimOutcome::Claimed => {
                    tracing::info!(parent: self.log.span(), "claimed {}", candidate.id);
                    outcome.handles.push(handle);
                }
                ClaimOutcome::Lost => {
                    tracing::debug!(parent: self.log.span(), "lost race for {}", candidate.id);
                }
                ClaimOutcome::Unconfirmed => {
                    outcome
                        .warnings
                        .push(format!("claim of {} could not be confirmed; skipped", candidate.id));
                }
            }
        }
        Ok(())
    }

    async fn provision_shortfall(
        &self,
        request: &FetchRequest,
        outcome: &mut FetchOutcome,
    ) -> Result<(), PoolError> {
        let Some((engine, settings)) = &self.fallback else {
            outcome
                .warnings
                .push("provisioning fallback requested but not configured".to_string());
            return Ok(());
        };

        let missing = request.count - outcome.handles.len();
        for _ in 0..missing {
            let mut provision = ProvisionRequest::new(settings.template.clone(), settings.expiry_days)
                .with_tag(request.tag.clone())
                .with_assignee(request.requester.clone());
            if let Some(email) = &settings.owner_email {
                provision = provision.with_owner_email(email.clone());
            }

            // assigned by the same write that activates it; never claimable by others
            let fresh = match engine.provision(&provision).await {
                Ok(info) => info,
                Err(e @ (PoolError::PartialProvisioning { .. } | PoolError::ProvisioningFailed { .. })) => {
                    tracing::warn!(parent: self.log.span(), "{e}");
                    outcome.warnings.push(e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            };

            match AllocatedHandle::from_resource(&fresh) {
                Ok(handle) => {
                    tracing::info!(parent: self.log.span(), "provisioned {} for fetch", fresh.id);
                    outcome.handles.push(handle);
                }
                Err(e) => {
                    outcome.warnings.push(e.to_string());
                    self.release_all_ids(std::slice::from_ref(&fresh.id)).await;
                }
            }
        }
        Ok(())
    }

    async fn release_all(&self, handles: &[AllocatedHandle]) {
        let ids: Vec<RecordId> = handles.iter().map(|h| h.record_id.clone()).collect();
        self.release_all_ids(&ids).await;
    }

    async fn release_all_ids(&self, ids: &[RecordId]) {
        for id in ids {
            if let Err(e) = self.repository.release(id).await {
                tracing::error!(
                    parent: self.log.span(),
                    "could not release {id} after failed fetch: {e}"
                );
            }
        }
    }

    /// Return an assigned record to the pool
    ///
    /// # Errors
    /// Remote failures after retries.
    pub async fn release(&self, record_id: &RecordId) -> Result<(), PoolError> {
        tracing::info!(parent: self.log.span(), "releasing {record_id}");
        self.repository.release(record_id).await
    }
}
