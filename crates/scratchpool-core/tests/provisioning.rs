//! Provisioning pipeline against the in-memory hub

use async_trait::async_trait;
use mockall::mock;
use scratchpool_core::schema::{field, RESOURCE_INFO};
use scratchpool_core::{
    AllocatedHandle, AllocationStatus, HubBackend, LogContext, Notifier, PoolError, ProvisionRequest,
    ProvisioningEngine, ProvisioningStage, RemoteError, ResourceStatus,
};
use scratchpool_test_utils::{
    as_remote, setup_engine, setup_repository, test_config, test_template,
    InMemoryRemote, RecordingNotifier, RemoteOp,
};
use serde_json::{json, Value};
use std::sync::Arc;

mock! {
    pub Mailer {}

    #[async_trait]
    impl Notifier for Mailer {
        async fn notify(&self, recipient: &str, handle: &AllocatedHandle) -> Result<(), PoolError>;
    }
}

fn request() -> ProvisionRequest {
    ProvisionRequest::new(test_template(), 1).with_tag("core")
}

fn engine_with_notifier(remote: &Arc<InMemoryRemote>, notifier: Arc<dyn Notifier>) -> ProvisioningEngine {
    setup_engine(remote).with_notifier(notifier)
}

fn status_of(remote: &InMemoryRemote, id: &scratchpool_core::RecordId) -> Option<String> {
    remote
        .record(RESOURCE_INFO, id)
        .and_then(|row| row.get(field::STATUS).and_then(Value::as_str).map(str::to_string))
}

#[tokio::test(start_paused = true)]
async fn provisions_active_record() {
    let remote = Arc::new(InMemoryRemote::new());
    let request = request();

    let info = setup_engine(&remote).provision(&request).await.unwrap();

    assert_eq!(info.status, ResourceStatus::Active);
    assert_eq!(info.tag.as_deref(), Some("core"));
    assert_eq!(info.alias.as_deref(), Some(request.alias.as_str()));
    assert!(info.login_url.is_some());
    assert_eq!(status_of(&remote, &info.id).as_deref(), Some("Active"));

    let credential = info.generated_credential.clone().unwrap();
    let stored = remote.record(RESOURCE_INFO, &info.id).unwrap();
    assert_eq!(stored.get(field::PASSWORD), Some(&json!(credential)));

    let pool = setup_repository(&remote).find_by_tag("core", false, true).await.unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].id, info.id);
}

#[tokio::test(start_paused = true)]
async fn credential_failure_marks_record_error() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.fail_next(
        RemoteOp::Update,
        RemoteError::Validation {
            code: "INVALID_OPERATION".into(),
            message: "password policy".into(),
        },
    );

    let err = setup_engine(&remote).provision(&request()).await.unwrap_err();

    let (record_id, stage) = match err {
        PoolError::PartialProvisioning { record_id, stage, .. } => (record_id, stage),
        other => panic!("expected partial provisioning, got {other}"),
    };
    assert_eq!(stage, ProvisioningStage::Credential);
    assert_eq!(status_of(&remote, &record_id).as_deref(), Some("Error"));

    let pool = setup_repository(&remote).find_by_tag("core", false, false).await.unwrap();
    assert!(pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_create_failure_is_retried() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.fail_next(RemoteOp::Create, RemoteError::RateLimited("REQUEST_LIMIT_EXCEEDED".into()));

    let info = setup_engine(&remote).provision(&request()).await.unwrap();

    assert_eq!(remote.calls(RemoteOp::Create), 2);
    assert_eq!(remote.records(RESOURCE_INFO).len(), 1);
    assert_eq!(info.status, ResourceStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn exhausted_create_budget_fails_without_record() {
    let remote = Arc::new(InMemoryRemote::new());
    for _ in 0..3 {
        remote.fail_next(RemoteOp::Create, RemoteError::Transport("timeout".into()));
    }

    let err = setup_engine(&remote).provision(&request()).await.unwrap_err();

    assert!(matches!(err, PoolError::ProvisioningFailed { .. }));
    assert_eq!(remote.calls(RemoteOp::Create), 3);
    assert!(remote.records(RESOURCE_INFO).is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_create_response_reuses_existing_record() {
    let remote = Arc::new(InMemoryRemote::new());
    let request = request();
    let backend = HubBackend::new(as_remote(&remote), &test_config(), &LogContext::disabled());
    let username = backend.signup_username(&request);

    // the first create went through before its response was lost
    let existing = remote.insert(
        RESOURCE_INFO,
        json!({
            "SignupUsername": username,
            "Status": "New",
            "Pooltag__c": "core",
            "ScratchOrg": "00D000000000777",
            "LoginUrl": "https://existing.scratch.example.com",
        }),
    );

    let info = setup_engine(&remote).provision(&request).await.unwrap();

    assert_eq!(info.id, existing);
    assert_eq!(remote.records(RESOURCE_INFO).len(), 1);
    assert_eq!(status_of(&remote, &existing).as_deref(), Some("Active"));
}

#[tokio::test(start_paused = true)]
async fn waits_for_record_to_become_visible() {
    let remote = Arc::new(InMemoryRemote::new().with_visibility_lag(2));

    let info = setup_engine(&remote).provision(&request()).await.unwrap();

    assert_eq!(info.status, ResourceStatus::Active);
    assert!(info.signup_username.is_some());
}

#[tokio::test(start_paused = true)]
async fn waits_for_login_url() {
    let remote = Arc::new(InMemoryRemote::new().with_login_url_lag(2));

    let info = setup_engine(&remote).provision(&request()).await.unwrap();

    assert_eq!(info.status, ResourceStatus::Active);
    assert!(info.login_url.is_some());
    assert!(info.remote_resource_id.is_some());
    assert_eq!(remote.calls(RemoteOp::Query), 3);
}

#[tokio::test(start_paused = true)]
async fn missing_login_url_marks_record_error() {
    let remote = Arc::new(InMemoryRemote::new().with_login_url_lag(10));

    let err = setup_engine(&remote)
        .provision(&request().with_assignee("ci"))
        .await
        .unwrap_err();

    let (record_id, stage) = match err {
        PoolError::PartialProvisioning { record_id, stage, .. } => (record_id, stage),
        other => panic!("expected partial provisioning, got {other}"),
    };
    assert_eq!(stage, ProvisioningStage::LoginUrl);
    assert_eq!(remote.calls(RemoteOp::Query), 3);
    assert_eq!(status_of(&remote, &record_id).as_deref(), Some("Error"));
    // reserved at creation, so it was never claimable
    let row = remote.record(RESOURCE_INFO, &record_id).unwrap();
    assert_eq!(row.get(field::ALLOCATION), Some(&json!("In Progress")));
}

#[tokio::test(start_paused = true)]
async fn provisioning_for_a_caller_assigns_on_activation() {
    let remote = Arc::new(InMemoryRemote::new());

    let info = setup_engine(&remote)
        .provision(&request().with_assignee("ci"))
        .await
        .unwrap();

    assert_eq!(info.allocation_status, AllocationStatus::Assigned);
    assert_eq!(info.assignee.as_deref(), Some("ci"));
    let row = remote.record(RESOURCE_INFO, &info.id).unwrap();
    assert_eq!(row.get(field::ALLOCATION), Some(&json!("Assigned")));
    assert_eq!(row.get(field::ASSIGNEE), Some(&json!("ci")));

    let free = setup_repository(&remote).find_by_tag("core", false, true).await.unwrap();
    assert!(free.is_empty());
}

#[tokio::test(start_paused = true)]
async fn notifies_requester_with_handle() {
    let remote = Arc::new(InMemoryRemote::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine_with_notifier(&remote, notifier.clone());

    let info = engine
        .provision(&request().with_owner_email("dev@example.com"))
        .await
        .unwrap();

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "dev@example.com");
    assert_eq!(sent[0].1.record_id, info.id);
    assert_eq!(Some(&sent[0].1.password), info.generated_credential.as_ref());
}

#[tokio::test(start_paused = true)]
async fn notification_failure_is_not_fatal() {
    let remote = Arc::new(InMemoryRemote::new());
    let mut mailer = MockMailer::new();
    mailer
        .expect_notify()
        .times(3)
        .returning(|_, _| Err(PoolError::Remote(RemoteError::Transport("smtp down".into()))));

    let info = engine_with_notifier(&remote, Arc::new(mailer))
        .provision(&request().with_owner_email("dev@example.com"))
        .await
        .unwrap();

    assert_eq!(info.status, ResourceStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn no_notification_without_email() {
    let remote = Arc::new(InMemoryRemote::new());
    let mut mailer = MockMailer::new();
    mailer.expect_notify().never();

    engine_with_notifier(&remote, Arc::new(mailer))
        .provision(&request())
        .await
        .unwrap();
}
