// Tests for the HTTP API

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use friendgraph::server::router;
use friendgraph_core::crawl::{CrawlOptions, CrawlService};
use friendgraph_crawler::crawler::RetryPolicy;
use friendgraph_crawler::error::SourceError;
use friendgraph_crawler::model::{
    AccountDetails, ContentItem, CrawlJob, FetchedProfile, JobState, OwnedContent, ProfileRecord,
};
use friendgraph_crawler::source::ProfileSource;
use friendgraph_crawler::store::{JobStore, MemoryStore};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tracing::Span;

const ALICE: &str = "76561197960265728";
const BOB: &str = "76561197960265729";

/// Alice and Bob are friends with each other and nobody else.
struct PairSource;

#[async_trait]
impl ProfileSource for PairSource {
    async fn fetch_profile(&self, profile_id: &str) -> Result<FetchedProfile, SourceError> {
        let friend = if profile_id == ALICE { BOB } else { ALICE };
        Ok(FetchedProfile {
            record: ProfileRecord {
                details: AccountDetails {
                    steam_id: profile_id.to_string(),
                    persona_name: format!("player-{}", &profile_id[14..]),
                    profile_url: String::new(),
                    avatar: String::new(),
                    time_created: 0,
                    country_code: None,
                },
                friend_ids: vec![friend.to_string()],
                owned: vec![OwnedContent {
                    content_id: 570,
                    usage_minutes: 120,
                }],
            },
            content: vec![ContentItem::placeholder(570)],
        })
    }
}

fn setup() -> (Router, Arc<CrawlService<MemoryStore>>) {
    let options = CrawlOptions {
        workers: 2,
        retry: RetryPolicy::new(1, Duration::from_millis(1)),
        ..Default::default()
    };
    let service = Arc::new(CrawlService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(PairSource),
        options,
    ));
    (router(service.clone(), Span::none()), service)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn finished_job(app: &Router, service: &CrawlService<MemoryStore>) -> String {
    let (status, body) = send(app, post_json("/crawl", json!({"originA": ALICE, "depth": 1}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["jobId"].as_str().unwrap().to_string();
    service
        .wait_for(&job_id, Duration::from_millis(5))
        .await
        .unwrap();
    job_id
}

// ============================================================================
// /crawl
// ============================================================================

#[tokio::test]
async fn test_crawl_accepts_then_reuses() {
    let (app, service) = setup();
    let job_id = finished_job(&app, &service).await;

    let (status, body) = send(&app, post_json("/crawl", json!({"originA": ALICE, "depth": 1}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobId"], job_id);

    let (status, body) = send(
        &app,
        post_json("/crawl", json!({"originA": ALICE, "depth": 1, "force": true})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_ne!(body["jobId"], job_id);
}

#[tokio::test]
async fn test_crawl_with_two_origins_and_named_job() {
    let (app, service) = setup();
    let (status, body) = send(
        &app,
        post_json(
            "/crawl",
            json!({"originA": ALICE, "originB": BOB, "depth": 2, "jobId": "pair_crawl"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["jobId"], "pair_crawl");

    let job = service
        .wait_for("pair_crawl", Duration::from_millis(5))
        .await
        .unwrap();
    assert_eq!(job.origins, vec![ALICE.to_string(), BOB.to_string()]);
    assert_eq!(job.total_discovered, 2);
}

#[tokio::test]
async fn test_crawl_rejects_invalid_input() {
    let (app, service) = setup();

    for body in [
        json!({"originA": "1234", "depth": 1}),
        json!({"originA": ALICE, "originB": "7656119796026572x", "depth": 1}),
        json!({"originA": ALICE, "depth": 0}),
        json!({"originA": ALICE, "depth": 9}),
        json!({"originA": ALICE, "depth": 1, "jobId": "no spaces"}),
        json!({"originA": ALICE, "depth": -1}),
        json!({"depth": 1}),
    ] {
        let (status, response) = send(&app, post_json("/crawl", body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {}", body);
        assert!(response["error"].is_string(), "body {}", body);
    }

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/crawl")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(service.store().unfinished_jobs().await.unwrap().is_empty());
    assert_eq!(service.running_jobs(), 0);
}

// ============================================================================
// /crawlstatus
// ============================================================================

#[tokio::test]
async fn test_crawl_status() {
    let (app, service) = setup();
    let job_id = finished_job(&app, &service).await;

    let (status, body) = send(&app, get(&format!("/crawlstatus/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobId"], job_id);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["totalDiscovered"], 2);
    assert_eq!(body["completed"], 2);
    assert_eq!(body["failed"], 0);
    assert_eq!(body["maxDepth"], 1);
    assert_eq!(body["origins"], json!([ALICE]));
}

#[tokio::test]
async fn test_crawl_status_errors() {
    let (app, _service) = setup();

    let (status, body) = send(&app, get("/crawlstatus/unknown-job")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("unknown-job"));

    let (status, _) = send(&app, get("/crawlstatus/bad.id")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// /crawl/{jobID}/cancel
// ============================================================================

#[tokio::test]
async fn test_cancel_pending_job() {
    let (app, service) = setup();
    service
        .store()
        .create_job(&CrawlJob::new("waiting", vec![ALICE.to_string()], 1))
        .await
        .unwrap();

    let (status, body) = send(&app, post_json("/crawl/waiting/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");

    let (status, _) = send(&app, post_json("/crawl/waiting/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, post_json("/crawl/nobody/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// /creategraph and /graph
// ============================================================================

#[tokio::test]
async fn test_create_and_fetch_graph() {
    let (app, service) = setup();
    let job_id = finished_job(&app, &service).await;

    let (status, _) = send(&app, get(&format!("/graph/{}", job_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, post_json("/creategraph", json!({"jobId": job_id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "created");
    assert_eq!(body["jobId"], job_id);

    let (status, graph) = send(&app, get(&format!("/graph/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(graph["job_id"], job_id);
    assert_eq!(graph["origin"]["depth"], 0);
    assert_eq!(graph["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(graph["top_content"][0]["total_usage"], 240);

    // aggregation is idempotent
    let (status, _) = send(&app, post_json("/creategraph", json!({"jobId": job_id}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, again) = send(&app, get(&format!("/graph/{}", job_id))).await;
    assert_eq!(graph, again);
}

#[tokio::test]
async fn test_create_graph_for_unfinished_job() {
    let (app, service) = setup();
    let mut job = CrawlJob::new("in-flight", vec![ALICE.to_string()], 1);
    job.transition(JobState::Running).unwrap();
    service.store().create_job(&job).await.unwrap();

    let (status, body) = send(&app, post_json("/creategraph", json!({"jobId": "in-flight"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("in-flight"));

    let (status, _) = send(&app, post_json("/creategraph", json!({"jobId": "ghost"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, post_json("/creategraph", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health() {
    let (app, _service) = setup();
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["uptime"].is_u64());
    assert!(body["uptime"].as_u64().unwrap() < 60);
}
