//! REST client against a mock hub

use chrono::{TimeZone, Utc};
use scratchpool_core::remote::{fields, Precondition};
use scratchpool_core::schema::{RESOURCE_INFO, SANDBOX_PROCESS};
use scratchpool_core::{
    ClaimOutcome, Condition, HttpRemoteClient, HubConnection, LogContext, RecordId, RemoteClient,
    RemoteError, ResourceInfo, ResourceRecordRepository, SoqlQuery,
};
use scratchpool_test_utils::fast_retry;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{bearer_token, body_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "00Dx0000000TOKEN";

fn client(server: &MockServer) -> HttpRemoteClient {
    let conn = HubConnection::new(server.uri(), TOKEN, "58.0");
    HttpRemoteClient::new(conn, LogContext::disabled()).unwrap()
}

fn record_id(raw: &str) -> RecordId {
    RecordId::parse(raw).unwrap()
}

#[tokio::test]
async fn query_follows_pagination() {
    let server = MockServer::start().await;
    let query = SoqlQuery::from(RESOURCE_INFO).filter(Condition::eq("Pooltag__c", "core"));

    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/query"))
        .and(query_param("q", query.to_soql().as_str()))
        .and(bearer_token(TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 3,
            "done": false,
            "nextRecordsUrl": "/services/data/v58.0/query/01gD0000002HU6KIAW-2000",
            "records": [{"Id": "2SR000000000001AAA"}, {"Id": "2SR000000000002AAA"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/query/01gD0000002HU6KIAW-2000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 3,
            "done": true,
            "records": [{"Id": "2SR000000000003AAA"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rows = client(&server).query(&query).await.unwrap();

    let ids: Vec<&str> = rows.iter().filter_map(|r| r["Id"].as_str()).collect();
    assert_eq!(ids, ["2SR000000000001AAA", "2SR000000000002AAA", "2SR000000000003AAA"]);
}

#[tokio::test]
async fn count_reads_total_size() {
    let server = MockServer::start().await;
    let query = SoqlQuery::from(RESOURCE_INFO)
        .count()
        .filter(Condition::eq("Pooltag__c", "core"));

    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/query"))
        .and(query_param(
            "q",
            "SELECT COUNT() FROM ScratchOrgInfo WHERE Pooltag__c = 'core'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 7,
            "done": true,
            "records": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(client(&server).count(&query).await.unwrap(), 7);
}

#[tokio::test]
async fn tooling_queries_use_tooling_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/tooling/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"records": []})))
        .expect(1)
        .mount(&server)
        .await;

    let query = SoqlQuery::from(SANDBOX_PROCESS).tooling();
    assert!(client(&server).query(&query).await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_session_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!([
            {"errorCode": "INVALID_SESSION_ID", "message": "Session expired or invalid"}
        ])))
        .mount(&server)
        .await;

    let err = client(&server)
        .query(&SoqlQuery::from(RESOURCE_INFO))
        .await
        .unwrap_err();

    assert_eq!(err, RemoteError::Unauthorized("Session expired or invalid".into()));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn create_returns_record_id() {
    let server = MockServer::start().await;
    let body = fields([("Username", Value::from("alias.01h@pool.example.com"))]);
    Mock::given(method("POST"))
        .and(path("/services/data/v58.0/sobjects/ScratchOrgInfo"))
        .and(body_json(&body))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "2SR000000000042AAA",
            "success": true,
            "errors": []
        })))
        .mount(&server)
        .await;

    let id = client(&server).create(RESOURCE_INFO, &body).await.unwrap();
    assert_eq!(id, record_id("2SR000000000042AAA"));
}

#[tokio::test]
async fn duplicate_username_is_a_validation_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!([
            {"errorCode": "DUPLICATE_USERNAME", "message": "Duplicate Username"}
        ])))
        .mount(&server)
        .await;

    let err = client(&server)
        .create(RESOURCE_INFO, &fields([("Username", "taken@pool.example.com")]))
        .await
        .unwrap_err();

    assert_eq!(err.validation_code(), Some("DUPLICATE_USERNAME"));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn conditional_update_sends_precondition() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/services/data/v58.0/sobjects/ScratchOrgInfo/2SR000000000001AAA"))
        .and(header_exists("If-Unmodified-Since"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let precondition = Precondition {
        unmodified_since: Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap(),
    };
    client(&server)
        .update(
            RESOURCE_INFO,
            &record_id("2SR000000000001AAA"),
            &fields([("Allocation_status__c", "Assigned")]),
            Some(precondition),
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let sent = requests[0].headers.get("if-unmodified-since").unwrap();
    assert_eq!(sent.to_str().unwrap(), "Wed, 01 May 2024 10:05:00 GMT");
}

#[tokio::test]
async fn stale_update_fails_precondition() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!([
            {"errorCode": "PRECONDITION_FAILED", "message": "record modified"}
        ])))
        .mount(&server)
        .await;

    let err = client(&server)
        .update(
            RESOURCE_INFO,
            &record_id("2SR000000000001AAA"),
            &fields([("Allocation_status__c", "Assigned")]),
            Some(Precondition { unmodified_since: Utc::now() }),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::PreconditionFailed(_)));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&server)
        .await;

    let err = client(&server)
        .delete("ActiveScratchOrg", &record_id("2AS000000000001AAA"))
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::Unavailable { status: 503, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn missing_record_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!([
            {"errorCode": "ENTITY_IS_DELETED", "message": "entity is deleted"}
        ])))
        .mount(&server)
        .await;

    let err = client(&server)
        .delete("ActiveScratchOrg", &record_id("2AS000000000001AAA"))
        .await
        .unwrap_err();

    assert_eq!(err, RemoteError::NotFound("entity is deleted".into()));
}

#[tokio::test]
async fn get_resolves_relative_paths() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/limits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ActiveScratchOrgs": {"Max": 40, "Remaining": 40}
        })))
        .mount(&server)
        .await;

    let body = client(&server).get("/services/data/v58.0/limits").await.unwrap();
    assert_eq!(body["ActiveScratchOrgs"]["Max"], json!(40));
}

#[tokio::test]
async fn lost_claim_is_detected_by_re_read() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(412))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{
                "Id": "2SR000000000001AAA",
                "Status": "Active",
                "Allocation_status__c": "Assigned",
                "Assignee__c": "someone-else",
                "CreatedDate": "2024-05-01T10:00:00.000+0000",
                "LastModifiedDate": "2024-05-01T10:06:00.000+0000"
            }]
        })))
        .mount(&server)
        .await;

    let remote: Arc<dyn RemoteClient> = Arc::new(client(&server));
    let repository = ResourceRecordRepository::new(remote, &fast_retry(), &LogContext::disabled());
    let candidate = ResourceInfo::from_record(
        json!({
            "Id": "2SR000000000001AAA",
            "Status": "Active",
            "CreatedDate": "2024-05-01T10:00:00.000+0000",
            "LastModifiedDate": "2024-05-01T10:05:00.000+0000"
        })
        .as_object()
        .unwrap(),
    )
    .unwrap();

    let outcome = repository.claim(&candidate, "me").await.unwrap();
    assert_eq!(outcome, ClaimOutcome::Lost);
}
