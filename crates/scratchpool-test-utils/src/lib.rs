//! Testing utilities for scratchpool workspace
//!
//! Shared test helpers, fixtures, and an in-memory remote store.

#![allow(missing_docs)]

mod store;

pub use store::{InMemoryRemote, RemoteOp, SeedRecord, HUB_USER};

use async_trait::async_trait;
use parking_lot::Mutex;
use scratchpool_core::{
    AllocatedHandle, EnvironmentTemplate, HubBackend, LogContext, Notifier, PoolConfig, PoolError,
    ProvisioningEngine, RemoteClient, ResourceRecordRepository, RetryPolicy, RetrySettings,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Short retry policies so failing paths finish quickly
pub fn fast_retry() -> RetrySettings {
    let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
    RetrySettings {
        provision: policy,
        records: policy,
        visibility: policy,
        notify: policy,
    }
}

pub fn test_config() -> PoolConfig {
    PoolConfig::new().with_retry(fast_retry())
}

pub fn as_remote(remote: &Arc<InMemoryRemote>) -> Arc<dyn RemoteClient> {
    remote.clone()
}

pub fn setup_repository(remote: &Arc<InMemoryRemote>) -> ResourceRecordRepository {
    ResourceRecordRepository::new(as_remote(remote), &fast_retry(), &LogContext::disabled())
        .with_hub_username(HUB_USER)
}

pub fn setup_engine(remote: &Arc<InMemoryRemote>) -> ProvisioningEngine {
    let log = LogContext::disabled();
    let backend = Arc::new(HubBackend::new(as_remote(remote), &test_config(), &log));
    ProvisioningEngine::new(backend, setup_repository(remote), &fast_retry(), &log)
}

pub fn test_template() -> EnvironmentTemplate {
    EnvironmentTemplate::from_definition(
        "config/project-scratch-def.json",
        &json!({"orgName": "Pool", "edition": "Developer"}),
    )
    .expect("template is an object")
}

/// Route tracing output through the test harness; honours `RUST_LOG`
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Notifier that records what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, AllocatedHandle)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, AllocatedHandle)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, handle: &AllocatedHandle) -> Result<(), PoolError> {
        self.sent
            .lock()
            .push((recipient.to_string(), handle.clone()));
        Ok(())
    }
}
