//! SiteClient tests against an in-process fake of the remote device API.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use regsync::client::{ClientError, RemoteApi, SiteClient};
use regsync::config::{CrawlConfig, SiteConfig};

#[derive(Default)]
struct FakeSite {
    logins: usize,
    valid_token: Option<String>,
    reject_login: bool,
    records_failures_left: usize,
    records_requests: usize,
}

type Shared = Arc<Mutex<FakeSite>>;

async fn login(State(state): State<Shared>) -> impl IntoResponse {
    let mut site = state.lock().unwrap();
    if site.reject_login {
        return (StatusCode::FORBIDDEN, "no").into_response();
    }
    site.logins += 1;
    let token = format!("tok-{}", site.logins);
    site.valid_token = Some(token.clone());
    Json(json!({ "Token": token })).into_response()
}

fn authorized(state: &Shared, headers: &HeaderMap) -> bool {
    let site = state.lock().unwrap();
    match (&site.valid_token, headers.get("API-token")) {
        (Some(valid), Some(sent)) => sent.to_str().map(|s| s == valid).unwrap_or(false),
        _ => false,
    }
}

async fn patients(State(state): State<Shared>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "Patients": [
            { "PatientRef": 200, "FirstName": "ANA", "LastName": "SOUZA" },
            { "PatientRef": 201, "FirstName": "BIA", "LastName": "PRADO" }
        ]
    }))
    .into_response()
}

async fn cases(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    assert_eq!(params.get("PatientRef").map(String::as_str), Some("200"));
    Json(json!({ "Cases": [ { "CaseName": "D2024.01" } ] })).into_response()
}

async fn records(State(state): State<Shared>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    {
        let mut site = state.lock().unwrap();
        site.records_requests += 1;
        if site.records_failures_left > 0 {
            site.records_failures_left -= 1;
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    Json(json!({
        "Records": [
            { "Well": 1, "Grade": "4AA" },
            { "Well": 2, "Grade": "3BB" }
        ]
    }))
    .into_response()
}

async fn media(State(state): State<Shared>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (StatusCode::OK, vec![0x89u8, 0x50, 0x4e, 0x47]).into_response()
}

async fn spawn_site(state: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/LOGIN", get(login))
        .route("/patients", get(patients))
        .route("/cases", get(cases))
        .route("/records", get(records))
        .route("/media", get(media))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client_for(addr: SocketAddr) -> SiteClient {
    let site_config = SiteConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        username: "svc".to_string(),
        password: "secret".to_string(),
        enabled: true,
        accept_invalid_certs: false,
        scheme: "http".to_string(),
    };
    let crawl_config = CrawlConfig {
        rate_limit_ms: 1,
        max_retries: 3,
        backoff_base_ms: 1,
        timeout_secs: 5,
    };
    SiteClient::new("lab1", &site_config, &crawl_config).unwrap()
}

#[tokio::test]
async fn test_login_and_list_patients() {
    let state: Shared = Arc::default();
    let addr = spawn_site(state.clone()).await;
    let client = client_for(addr);

    let patients = client.list_patients().await.unwrap();
    assert_eq!(patients.len(), 2);
    assert_eq!(patients[0].patient_ref, 200);
    assert_eq!(patients[0].first_name.as_deref(), Some("ANA"));

    // The token is cached: a second call must not log in again.
    client.list_cases(200).await.unwrap();
    assert_eq!(state.lock().unwrap().logins, 1);
}

#[tokio::test]
async fn test_revoked_token_triggers_single_reauth() {
    let state: Shared = Arc::default();
    let addr = spawn_site(state.clone()).await;
    let client = client_for(addr);

    client.list_patients().await.unwrap();

    // Device revokes the token between requests.
    state.lock().unwrap().valid_token = None;

    let cases = client.list_cases(200).await.unwrap();
    assert_eq!(cases, vec!["D2024.01".to_string()]);
    assert_eq!(state.lock().unwrap().logins, 2);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let state: Shared = Arc::default();
    state.lock().unwrap().records_failures_left = 2;
    let addr = spawn_site(state.clone()).await;
    let client = client_for(addr);

    let records = client.fetch_case_records(200, "D2024.01").await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].patient_ref, Some(200));
    assert_eq!(records[0].case_name.as_deref(), Some("D2024.01"));
    assert_eq!(state.lock().unwrap().records_requests, 3);
}

#[tokio::test]
async fn test_retry_exhaustion_reports_attempts() {
    let state: Shared = Arc::default();
    state.lock().unwrap().records_failures_left = 10;
    let addr = spawn_site(state.clone()).await;
    let client = client_for(addr);

    let err = client.fetch_case_records(200, "D2024.01").await.unwrap_err();
    match err {
        ClientError::RequestFailed {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("500"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(state.lock().unwrap().records_requests, 3);
}

#[tokio::test]
async fn test_rejected_login_is_auth_failure() {
    let state: Shared = Arc::default();
    state.lock().unwrap().reject_login = true;
    let addr = spawn_site(state.clone()).await;
    let client = client_for(addr);

    let err = client.list_patients().await.unwrap_err();
    assert!(matches!(err, ClientError::AuthFailed { .. }));
}

#[tokio::test]
async fn test_fetch_media_returns_bytes() {
    let state: Shared = Arc::default();
    let addr = spawn_site(state.clone()).await;
    let client = client_for(addr);

    let bytes = client.fetch_media(200, "D2024.01", "WELL01").await.unwrap();
    assert_eq!(bytes, vec![0x89u8, 0x50, 0x4e, 0x47]);
}
