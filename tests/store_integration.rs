use std::sync::Arc;

use chrono::{Duration, Utc};
use delegauth::store::{BlobBackend, FileBackend};
use delegauth::{DelegatedTokenStore, TokenBackend};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;

fn blob_for(server: &MockServer) -> BlobBackend {
    BlobBackend::new(
        format!("{}/tokens/{{subject}}.json?sig=secret-sas", server.uri()),
        reqwest::Client::new(),
    )
}

#[tokio::test]
async fn missing_object_loads_as_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tokens/me.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backend = blob_for(&server);
    assert!(backend.load("me").await.unwrap().is_none());
}

#[tokio::test]
async fn save_puts_block_blob() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/tokens/me.json"))
        .and(header("x-ms-blob-type", "BlockBlob"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let backend = blob_for(&server);
    let token = common::delegated_token("acc", Duration::hours(1), Some("ref"));
    backend.save("me", &token).await.unwrap();
}

#[tokio::test]
async fn record_written_by_another_process_is_readable() {
    let server = MockServer::start().await;
    let expires = (Utc::now() + Duration::hours(1)).timestamp() as f64 + 0.25;
    Mock::given(method("GET"))
        .and(path("/tokens/me.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "hosted-access",
            "refresh_token": "",
            "expires_at": expires,
            "scopes": ["https://graph.microsoft.com/Calendars.Read"]
        })))
        .mount(&server)
        .await;

    let backend = blob_for(&server);
    let token = backend.load("me").await.unwrap().unwrap();
    assert_eq!(token.access_token, "hosted-access");
    assert!(token.refresh_token.is_none());
    assert!(token.is_usable());
}

#[tokio::test]
async fn delete_of_missing_object_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/tokens/me.json"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let backend = blob_for(&server);
    backend.delete("me").await.unwrap();
}

#[tokio::test]
async fn server_error_is_storage_unavailable_without_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend = blob_for(&server);
    let err = backend.load("me").await.unwrap_err();
    assert_eq!(err.code(), "storage_unavailable");
    assert!(!err.to_string().contains("secret-sas"));
}

#[tokio::test]
async fn connection_failure_does_not_leak_query_credentials() {
    let port = common::free_port();
    let backend = BlobBackend::new(
        format!("http://127.0.0.1:{port}/c/{{subject}}.json?sv=1&sig=TOPSECRET"),
        reqwest::Client::new(),
    );
    let token = common::delegated_token("acc", Duration::hours(1), None);

    let errors = [
        backend.load("me").await.unwrap_err(),
        backend.save("me", &token).await.unwrap_err(),
        backend.delete("me").await.unwrap_err(),
    ];
    for err in errors {
        assert_eq!(err.code(), "storage_unavailable");
        let text = err.to_string();
        assert!(!text.contains("TOPSECRET"), "{text}");
        assert!(!text.contains("sig="), "{text}");
    }
}

#[tokio::test]
async fn unparsable_record_does_not_leak_query_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = blob_for(&server).load("me").await.unwrap_err();
    assert_eq!(err.code(), "storage_unavailable");
    assert!(!err.to_string().contains("secret-sas"));
}

#[tokio::test]
async fn store_treats_unreadable_remote_as_absent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = DelegatedTokenStore::new(Arc::new(blob_for(&server)));
    assert!(store.get("me").await.unwrap().is_none());
    assert!(!store.has_valid_token("me").await);
}

#[tokio::test]
async fn store_refreshes_expired_remote_record_and_writes_back() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let expired = (Utc::now() - Duration::minutes(5)).timestamp();
    Mock::given(method("GET"))
        .and(path("/tokens/me.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "old",
            "refresh_token": "r1",
            "expires_at": expired,
            "scopes": ["https://graph.microsoft.com/Calendars.Read"],
            "subject": "me"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tokens/me.json"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    common::http_mock::token_request(&["grant_type=refresh_token", "refresh_token=r1"])
        .respond_with(common::http_mock::token_ok_with_refresh("new", "r2", 3600))
        .expect(1)
        .mount(&server)
        .await;

    let config = Arc::new(common::config_from(common::legacy_json(&server.uri(), dir.path())));
    let engine = Arc::new(common::engine_for(&config));
    let store = DelegatedTokenStore::new(Arc::new(blob_for(&server))).with_refresher(engine);

    let token = store.get("me").await.unwrap().unwrap();
    assert_eq!(token.access_token, "new");
    assert_eq!(token.refresh_token.as_deref(), Some("r2"));
}

#[tokio::test]
async fn failed_write_back_after_refresh_is_reported() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let expired = (Utc::now() - Duration::minutes(5)).timestamp();
    Mock::given(method("GET"))
        .and(path("/tokens/me.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "old",
            "refresh_token": "r1",
            "expires_at": expired
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    common::http_mock::token_request(&["grant_type=refresh_token"])
        .respond_with(common::http_mock::token_ok("new", 3600))
        .mount(&server)
        .await;

    let config = Arc::new(common::config_from(common::legacy_json(&server.uri(), dir.path())));
    let engine = Arc::new(common::engine_for(&config));
    let store = DelegatedTokenStore::new(Arc::new(blob_for(&server))).with_refresher(engine);

    let err = store.get("me").await.unwrap_err();
    assert_eq!(err.code(), "storage_unavailable");
}

#[tokio::test]
async fn lookalike_subjects_do_not_share_local_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = DelegatedTokenStore::new(Arc::new(FileBackend::new(dir.path().to_path_buf())));
    let token = common::delegated_token("alice-access", Duration::hours(1), Some("r"));
    store.put("team/alice", &token).await.unwrap();

    assert!(store.get("team_alice").await.unwrap().is_none());
    assert!(!store.has_valid_token("team_alice").await);
    assert!(store.has_valid_token("team/alice").await);
}
