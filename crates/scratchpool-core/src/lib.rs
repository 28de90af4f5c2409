//! Scratchpool Core - shared pool of ephemeral scratch environments
//!
//! Allocates pre-provisioned environments to callers and keeps the pool
//! healthy:
//! - Claims unassigned, unexpired records oldest-first with conditional updates
//! - Provisions fresh environments when the pool runs short
//! - Retires expired and failed environments idempotently
//! - Tolerates read-after-write lag of the remote record store
//!
//! # Example
//!
//! ```rust,ignore
//! use scratchpool_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PoolConfig::new();
//! let log = LogContext::root("fetch");
//! let conn = HubConnection::new("https://hub.my.salesforce.com", "token", &config.api_version);
//! let remote: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(conn, log.clone())?);
//!
//! let repository = ResourceRecordRepository::new(remote, &config.retry, &log);
//! let allocator = PoolAllocator::new(repository, &log);
//! let outcome = allocator.fetch(&FetchRequest::new("core").with_count(2)).await?;
//!
//! println!("got {} environments, short by {}", outcome.handles.len(), outcome.shortfall);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod allocator;
pub mod config;
pub mod error;
pub mod logging;
pub mod maintainer;
pub mod notify;
pub mod provisioning;
pub mod query;
pub mod remote;
pub mod repository;
pub mod retry;
pub mod sandbox;
pub mod schema;
pub mod types;

// Re-exports for convenience
pub use allocator::{FallbackSettings, FetchOutcome, FetchRequest, PoolAllocator};
pub use config::{PoolConfig, RetrySettings};
pub use error::{PoolError, ProvisioningStage, RemoteError, Retryable};
pub use logging::LogContext;
pub use maintainer::{PoolMaintainer, ReconcileReport, UserUsage};
pub use notify::{EmailNotifier, Notifier};
pub use provisioning::{
    CreatedEnvironment, EnvironmentBackend, EnvironmentTemplate, HubBackend, ProvisionRequest,
    ProvisioningEngine,
};
pub use query::{Condition, Direction, SoqlQuery};
pub use remote::{HttpRemoteClient, HubConnection, Precondition, RemoteClient};
pub use repository::{ClaimOutcome, ResourceRecordRepository};
pub use retry::{Backoff, RetryExecutor, RetryPolicy};
pub use sandbox::{SandboxInspector, SandboxProcess};
pub use types::{
    ActiveResource, AllocatedHandle, AllocationStatus, EnvironmentLimits, LimitCounter, RecordId,
    RequestId, ResourceInfo, ResourceStatus,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the pool
    pub use crate::{
        AllocatedHandle, FetchOutcome, FetchRequest, HttpRemoteClient, HubConnection, LogContext,
        PoolAllocator, PoolConfig, PoolError, PoolMaintainer, ProvisioningEngine, RemoteClient,
        ResourceRecordRepository,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
