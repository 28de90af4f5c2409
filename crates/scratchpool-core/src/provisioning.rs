//! Provisioning engine
//!
//! Creates a new remote environment and brings its pool record to Active:
//! 1. Create the environment (bounded retry, transient failures only)
//! 2. Wait for its signup record to become queryable and read the login URL
//! 3. Generate an access credential
//! 4. Mark the record Active
//! 5. Optionally notify the requester (best effort)
//!
//! A failure in step 1 means no usable resource exists. A failure in steps
//! 2-4 leaves the environment marked `Error` so it is never handed out.
//!
//! A request with an assignee never passes through a claimable state: the
//! record is created `In Progress` and the Active write assigns it.

use crate::config::{PoolConfig, RetrySettings};
use crate::error::{PoolError, ProvisioningStage, RemoteError};
use crate::logging::LogContext;
use crate::notify::Notifier;
use crate::query::{Condition, SoqlQuery};
use crate::remote::{Fields, RemoteClient};
use crate::repository::ResourceRecordRepository;
use crate::retry::RetryExecutor;
use crate::schema::{self, field};
use crate::types::{
    AllocatedHandle, AllocationStatus, RecordId, RequestId, ResourceInfo, ResourceStatus,
};
use async_trait::async_trait;
use rand::distr::{Alphanumeric, SampleString};
use serde_json::Value;
use std::sync::Arc;

/// Template the environment is created from
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvironmentTemplate {
    /// Template reference (e.g. definition file path)
    pub name: String,
    /// Fields copied onto the create call
    pub fields: Fields,
}

impl EnvironmentTemplate {
    /// Build from a scratch definition document
    ///
    /// Known keys map onto create fields; `features` lists are joined with `;`.
    /// Keys with no create-time counterpart (e.g. `settings`) are ignored.
    ///
    /// # Errors
    /// `PoolError::Config` if the document is not a JSON object.
    pub fn from_definition(name: impl Into<String>, definition: &Value) -> Result<Self, PoolError> {
        let name = name.into();
        let object = definition
            .as_object()
            .ok_or_else(|| PoolError::Config(format!("{name}: definition must be a JSON object")))?;

        let mut fields = Fields::new();
        for (key, value) in object {
            let target = match key.as_str() {
                "edition" => "Edition",
                "orgName" => "OrgName",
                "country" => "Country",
                "language" => "Language",
                "description" => "Description",
                "hasSampleData" => "HasSampleData",
                "release" => "Release",
                "features" => {
                    let joined = match value {
                        Value::Array(items) => items
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(";"),
                        Value::String(s) => s.clone(),
                        _ => continue,
                    };
                    fields.insert("Features".to_string(), Value::from(joined));
                    continue;
                }
                _ => continue,
            };
            fields.insert(target.to_string(), value.clone());
        }

        Ok(Self { name, fields })
    }
}

/// One environment to provision
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    /// Request id; also seeds the signup username, so retried creates dedupe
    pub request_id: RequestId,
    /// Local alias
    pub alias: String,
    /// Pool tag to attach
    pub tag: Option<String>,
    /// Requester to notify
    pub owner_email: Option<String>,
    /// Caller the environment is provisioned for, if it skips the pool
    pub assignee: Option<String>,
    /// Template
    pub template: EnvironmentTemplate,
    /// Lifetime in days
    pub expiry_days: u32,
}

impl ProvisionRequest {
    /// Create request with a fresh id
    #[must_use]
    pub fn new(template: EnvironmentTemplate, expiry_days: u32) -> Self {
        let request_id = RequestId::new();
        let id = request_id.to_string();
        Self {
            request_id,
            alias: format!("SO-{}", &id[id.len() - 6..]),
            tag: None,
            owner_email: None,
            assignee: None,
            template,
            expiry_days,
        }
    }

    /// With pool tag
    #[inline]
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// With owner email
    #[inline]
    #[must_use]
    pub fn with_owner_email(mut self, email: impl Into<String>) -> Self {
        self.owner_email = Some(email.into());
        self
    }

    /// Provision directly for `requester`
    #[inline]
    #[must_use]
    pub fn with_assignee(mut self, requester: impl Into<String>) -> Self {
        self.assignee = Some(requester.into());
        self
    }

    /// With alias
    #[inline]
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }
}

/// Environment acknowledged by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEnvironment {
    /// ResourceInfo record id, taken from the create response
    pub record_id: RecordId,
    /// Signup username
    pub signup_username: String,
}

/// Creates environments and their credentials
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Issue the create call; must be safe to re-issue for the same request
    async fn create_environment(
        &self,
        request: &ProvisionRequest,
    ) -> Result<CreatedEnvironment, PoolError>;

    /// Generate and persist an access credential, returning it
    async fn generate_credential(&self, env: &CreatedEnvironment) -> Result<String, PoolError>;
}

const CREDENTIAL_LEN: usize = 16;

/// Backend that provisions through the hub's ResourceInfo object
pub struct HubBackend {
    remote: Arc<dyn RemoteClient>,
    username_domain: String,
    log: LogContext,
}

impl HubBackend {
    /// Create backend
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteClient>, config: &PoolConfig, log: &LogContext) -> Self {
        Self {
            remote,
            username_domain: config.username_domain.clone(),
            log: log.child("hub-backend"),
        }
    }

    /// Signup username for a request
    #[must_use]
    pub fn signup_username(&self, request: &ProvisionRequest) -> String {
        format!("{}.{}@{}", request.alias, request.request_id, self.username_domain).to_lowercase()
    }

    async fn find_existing(&self, username: &str) -> Result<Option<RecordId>, PoolError> {
        let query = SoqlQuery::from(schema::RESOURCE_INFO)
            .select(&[field::ID])
            .filter(Condition::eq(field::SIGNUP_USERNAME, username))
            .limit(1);
        let rows = self.remote.query(&query).await?;
        rows.first()
            .and_then(|r| r.get(field::ID))
            .and_then(Value::as_str)
            .map(|raw| {
                RecordId::parse(raw).map_err(|raw| {
                    PoolError::malformed(schema::RESOURCE_INFO, format!("bad Id {raw:?}"))
                })
            })
            .transpose()
    }
}

#[async_trait]
impl EnvironmentBackend for HubBackend {
    async fn create_environment(
        &self,
        request: &ProvisionRequest,
    ) -> Result<CreatedEnvironment, PoolError> {
        let username = self.signup_username(request);

        let mut fields = request.template.fields.clone();
        fields.insert("Username".into(), Value::from(username.clone()));
        fields.insert(field::DURATION_DAYS.into(), Value::from(request.expiry_days));
        fields.insert(field::CONNECTION_ALIAS.into(), Value::from(request.alias.clone()));
        fields.insert(field::STATUS.into(), Value::from(ResourceStatus::New.as_str()));
        if let Some(tag) = &request.tag {
            fields.insert(field::TAG.into(), Value::from(tag.clone()));
        }
        if let Some(email) = &request.owner_email {
            fields.insert(field::ADMIN_EMAIL.into(), Value::from(email.clone()));
        }
        if request.assignee.is_some() {
            fields.insert(
                field::ALLOCATION.into(),
                Value::from(AllocationStatus::InProgress.as_str()),
            );
        }

        tracing::info!(parent: self.log.span(), "Creating scratch org {}..", request.alias);

        match self.remote.create(schema::RESOURCE_INFO, &fields).await {
            Ok(record_id) => Ok(CreatedEnvironment {
                record_id,
                signup_username: username,
            }),
            Err(RemoteError::Validation { code, .. }) if code == "DUPLICATE_USERNAME" => {
                // an earlier attempt went through but its response was lost
                let record_id = self.find_existing(&username).await?.ok_or_else(|| {
                    PoolError::NotYetVisible {
                        object: schema::RESOURCE_INFO.to_string(),
                        key: username.clone(),
                    }
                })?;
                tracing::debug!(parent: self.log.span(), "reusing {record_id} for {username}");
                Ok(CreatedEnvironment {
                    record_id,
                    signup_username: username,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn generate_credential(&self, env: &CreatedEnvironment) -> Result<String, PoolError> {
        let password = Alphanumeric.sample_string(&mut rand::rng(), CREDENTIAL_LEN);
        let mut update = Fields::new();
        update.insert(field::PASSWORD.into(), Value::from(password.clone()));
        self.remote
            .update(schema::RESOURCE_INFO, &env.record_id, &update, None)
            .await?;
        Ok(password)
    }
}

/// Drives environment creation through to an Active record
pub struct ProvisioningEngine {
    backend: Arc<dyn EnvironmentBackend>,
    repository: ResourceRecordRepository,
    notifier: Option<Arc<dyn Notifier>>,
    create_retry: RetryExecutor,
    step_retry: RetryExecutor,
    notify_retry: RetryExecutor,
    log: LogContext,
}

impl ProvisioningEngine {
    /// Create engine
    #[must_use]
    pub fn new(
        backend: Arc<dyn EnvironmentBackend>,
        repository: ResourceRecordRepository,
        retry: &RetrySettings,
        log: &LogContext,
    ) -> Self {
        let log = log.child("provisioning");
        Self {
            backend,
            repository,
            notifier: None,
            create_retry: RetryExecutor::new(retry.provision, log.clone()),
            step_retry: RetryExecutor::new(retry.records, log.clone()),
            notify_retry: RetryExecutor::new(retry.notify, log.clone()),
            log,
        }
    }

    /// With notifier for requesters that supply an email
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Provision one environment
    ///
    /// # Errors
    /// - `PoolError::ProvisioningFailed` if the create step exhausts its budget
    ///   (no resource exists)
    /// - `PoolError::PartialProvisioning` if a later step fails (the resource
    ///   exists and is marked Error)
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ResourceInfo, PoolError> {
        tracing::info!(
            parent: self.log.span(),
            request = %request.request_id,
            alias = %request.alias,
            "provisioning environment"
        );

        let created = self
            .create_retry
            .execute("create_environment", || self.backend.create_environment(request))
            .await
            .map_err(|e| PoolError::ProvisioningFailed {
                alias: request.alias.clone(),
                source: Box::new(e),
            })?;

        let mut info = match self
            .repository
            .await_by_signup_username(&created.signup_username)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                return Err(self
                    .mark_failed(&created, ProvisioningStage::LoginUrl, &e.to_string())
                    .await)
            }
        };

        let credential = match self
            .step_retry
            .execute("generate_credential", || {
                self.backend.generate_credential(&created)
            })
            .await
        {
            Ok(credential) => credential,
            Err(e) => {
                return Err(self
                    .mark_failed(&created, ProvisioningStage::Credential, &e.to_string())
                    .await)
            }
        };

        let mut activation = Fields::new();
        if let Some(requester) = &request.assignee {
            activation.insert(
                field::ALLOCATION.into(),
                Value::from(AllocationStatus::Assigned.as_str()),
            );
            activation.insert(field::ASSIGNEE.into(), Value::from(requester.clone()));
        }
        if let Err(e) = self
            .repository
            .set_status(&created.record_id, ResourceStatus::Active, activation)
            .await
        {
            return Err(self
                .mark_failed(&created, ProvisioningStage::Activation, &e.to_string())
                .await);
        }

        info.status = ResourceStatus::Active;
        info.generated_credential = Some(credential);
        if let Some(requester) = &request.assignee {
            info.allocation_status = AllocationStatus::Assigned;
            info.assignee = Some(requester.clone());
        }
        if info.tag.is_none() {
            info.tag.clone_from(&request.tag);
        }
        if info.alias.is_none() {
            info.alias = Some(request.alias.clone());
        }

        tracing::info!(parent: self.log.span(), "provisioned {} as {}", request.alias, info.id);

        if let Some(email) = &request.owner_email {
            self.notify(email, &info).await;
        }

        Ok(info)
    }

    async fn notify(&self, email: &str, info: &ResourceInfo) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let handle = match AllocatedHandle::from_resource(info) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(parent: self.log.span(), "not notifying {email}: {e}");
                return;
            }
        };
        if let Err(e) = self
            .notify_retry
            .execute("notify", || notifier.notify(email, &handle))
            .await
        {
            tracing::warn!(parent: self.log.span(), "failed to notify {email}: {e}");
        }
    }

    async fn mark_failed(
        &self,
        created: &CreatedEnvironment,
        stage: ProvisioningStage,
        reason: &str,
    ) -> PoolError {
        tracing::error!(
            parent: self.log.span(),
            "environment {} failed at {stage}: {reason}",
            created.record_id
        );
        if let Err(e) = self
            .repository
            .set_status(&created.record_id, ResourceStatus::Error, Fields::new())
            .await
        {
            tracing::error!(
                parent: self.log.span(),
                "could not mark {} as Error: {e}",
                created.record_id
            );
        }
        PoolError::PartialProvisioning {
            record_id: created.record_id.clone(),
            stage,
            reason: reason.to_string(),
        }
    }
}
