mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use common::{build_zip, sample_repo, TestPipeline};
use provis_pipeline::api::{build_router, AppState};
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt;

const BOUNDARY: &str = "provis-test-boundary";

fn app(pipeline: &TestPipeline) -> Router {
    build_router(AppState::new(pipeline.orchestrator.clone()))
}

fn multipart_request(field: &str, file_name: Option<&str>, bytes: &[u8]) -> Request<Body> {
    let disposition = match file_name {
        Some(name) => format!("form-data; name=\"{}\"; filename=\"{}\"", field, name),
        None => format!("form-data; name=\"{}\"", field),
    };
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Disposition: {}\r\n", disposition).as_bytes());
    body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/ingest")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health() {
    let pipeline = TestPipeline::start().await;
    let (status, body) = send_json(&app(&pipeline), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["uptime_seconds"].is_u64());
}

#[tokio::test]
async fn test_upload_to_graph() {
    let pipeline = TestPipeline::start().await;
    let app = app(&pipeline);

    let (status, body) = send_json(&app, multipart_request("file", Some("repo.zip"), &sample_repo())).await;
    assert_eq!(status, StatusCode::CREATED);
    let repo_id = body["repoId"].as_str().unwrap().to_string();
    let job_id = body["jobId"].as_str().unwrap().to_string();

    // Poll status until done; pct never goes down
    let mut last_pct = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let (status, body) = send_json(&app, get(&format!("/status/{}", job_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repoId"], repo_id.as_str());
        assert!(body.get("error").is_none());

        let pct = body["pct"].as_u64().unwrap();
        assert!(pct >= last_pct);
        last_pct = pct;
        if body["phase"] == "done" {
            assert_eq!(pct, 100);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (status, graph) = send_json(&app, get(&format!("/repo/{}/graph", repo_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(graph["repoId"], repo_id.as_str());
    assert!(graph["edges"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["from"] == "src/index.ts" && e["resolved"] == "src/util.ts"));

    let (status, detail) = send_json(&app, get(&format!("/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot_id = detail["job"]["snapshot_id"].as_str().unwrap().to_string();
    assert!(detail["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .all(|t| t["state"] == "succeeded"));

    let (status, listing) = send_json(
        &app,
        get(&format!("/repos/{}/snapshots/{}/artifacts", repo_id, snapshot_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["snapshotId"], snapshot_id.as_str());
    let graph_entry = listing["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["kind"] == "graph")
        .unwrap();
    assert_eq!(graph_entry["latestVersion"], 1);

    for kind in ["tree", "files", "summaries", "capabilities", "metrics"] {
        let (status, _) = send(&app, get(&format!("/repo/{}/{}", repo_id, kind))).await;
        assert_eq!(status, StatusCode::OK, "{}", kind);
    }

    // Finished jobs cannot be cancelled
    let cancel = Request::builder()
        .method("POST")
        .uri(format!("/jobs/{}/cancel", job_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, cancel).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_STATE_TRANSITION");
}

#[tokio::test]
async fn test_event_stream_replays_and_resumes() {
    let pipeline = TestPipeline::start().await;
    let app = app(&pipeline);
    let submission = pipeline.orchestrator.submit_job(sample_repo()).await.unwrap();
    pipeline.wait_for_terminal(submission.job_id).await;
    let total = pipeline.events(submission.job_id).await.len();

    let (status, body) = send(&app, get(&format!("/jobs/{}/events", submission.job_id))).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("id: 1\n"));
    assert!(text.contains("event: phase\n"));
    assert!(text.contains("event: done\n"));
    assert_eq!(text.matches("data: ").count(), total);

    let resume = Request::builder()
        .uri(format!("/jobs/{}/events", submission.job_id))
        .header("Last-Event-ID", (total - 1).to_string())
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, resume).await;
    let text = String::from_utf8(body).unwrap();
    assert_eq!(text.matches("data: ").count(), 1);
    assert!(text.contains("event: done\n"));
    assert!(!text.contains("id: 1\n"));
}

#[tokio::test]
async fn test_zip_bomb_rejected_before_queueing() {
    let pipeline = TestPipeline::start_with(|config| {
        config.ingest.zip_max_ratio = 5.0;
    })
    .await;
    let app = app(&pipeline);

    let bomb = build_zip(&[("big.txt", &"a".repeat(200_000))]);
    let (status, body) = send_json(&app, multipart_request("file", Some("bomb.zip"), &bomb)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "zip_ratio");
    assert_eq!(body["error"]["status"], 400);

    assert!(pipeline.ctx().ledger.list_jobs().await.unwrap().is_empty());
    assert_eq!(pipeline.ctx().queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_upload_validation_errors() {
    let pipeline = TestPipeline::start().await;
    let app = app(&pipeline);

    let (status, body) = send_json(&app, multipart_request("file", Some("junk.zip"), b"not a zip")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "zip_invalid");

    let (status, body) = send_json(&app, multipart_request("notes", None, b"hello")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "missing_file");

    // Any field carrying a filename is accepted as the upload
    let (status, _) = send_json(&app, multipart_request("archive", Some("repo.zip"), &sample_repo())).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_upload_over_size_limit() {
    let pipeline = TestPipeline::start_with(|config| {
        config.ingest.max_upload_bytes = 256;
    })
    .await;
    let app = app(&pipeline);

    let (status, body) = send_json(&app, multipart_request("file", Some("repo.zip"), &[0u8; 1024])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "upload_too_large");
}

#[tokio::test]
async fn test_not_found_responses() {
    let pipeline = TestPipeline::start().await;
    let app = app(&pipeline);
    let missing = uuid::Uuid::new_v4();

    for uri in [
        format!("/status/{}", missing),
        format!("/jobs/{}", missing),
        format!("/jobs/{}/events", missing),
        "/repo/unknown-repo/graph".to_string(),
    ] {
        let (status, body) = send_json(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    let submission = pipeline.orchestrator.submit_job(sample_repo()).await.unwrap();
    let (status, _) = send_json(&app, get(&format!("/repo/{}/bogus", submission.repo_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let _ = provis_pipeline::metrics::init_metrics();
    let pipeline = TestPipeline::start().await;
    let app = app(&pipeline);

    // /health is excluded from request metrics
    send(&app, get(&format!("/status/{}", uuid::Uuid::new_v4()))).await;
    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("provis_http_requests_total"));
}
