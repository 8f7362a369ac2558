//! End-to-end HTTP surface tests: the axum `Router` is built directly and
//! driven with `tower::ServiceExt::oneshot`, without binding a real socket.
//! No worker pool is spawned here — these exercise the admission pipeline,
//! auth, and read endpoints in isolation from remote execution.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dispatch_core::config::{Config, LimiterConfig, RemotePaths, SshConfig, VetterConfig};
use dispatch_core::kernel::jobs::{CodeVetter, InMemoryJobStore, QueueManager};
use dispatch_core::kernel::{InMemoryTokenStore, Limiter, TokenStore};
use dispatch_core::server::{build_app, AppState};
use tower::ServiceExt;

fn test_config(node_count: usize) -> Config {
    Config {
        database_url: String::new(),
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        jobs_dir: std::env::temp_dir().join("dispatch-test-jobs").to_string_lossy().into_owned(),
        nodes: (0..node_count)
            .map(|node_id| dispatch_core::config::NodeAddress {
                node_id,
                ip: format!("10.0.0.{}", 10 + node_id),
            })
            .collect(),
        ssh: SshConfig {
            bastion_host: "bastion.test".to_string(),
            bastion_user: "ci".to_string(),
            bastion_key_path: None,
            node_port: 22,
            node_username: "gpu".to_string(),
            node_password: "unused".to_string(),
            connect_timeout: Duration::from_secs(1),
            retry_attempts: 1,
            keepalive_interval: Duration::from_secs(60),
        },
        remote_paths: RemotePaths {
            work_dir: "/tmp/work".to_string(),
            script_name: "solution.py".to_string(),
            results_name: "results.jsonl".to_string(),
            stdout_template: "/tmp/job_{job_id}.out".to_string(),
            stderr_template: "/tmp/job_{job_id}.err".to_string(),
            grading_interpreter: "/usr/bin/python3".to_string(),
            grading_script: "/opt/grade.py".to_string(),
        },
        vetter: VetterConfig {
            enabled: false,
            quick_mode: false,
            api_key: None,
            api_url: String::new(),
            model: String::new(),
            request_timeout: Duration::from_secs(1),
        },
        limiter: LimiterConfig::default(),
        timeout_multiplier: 2,
        worker_poll_interval: Duration::from_millis(50),
        supervision_poll_interval: Duration::from_millis(50),
        output_fetch_max_retries: 1,
        submit_wait_timeout: Duration::from_millis(100),
        container_restart_between_jobs: false,
        container_name_prefix: "node".to_string(),
        container_restart_warmup: Duration::from_secs(1),
    }
}

async fn test_state(node_count: usize) -> AppState {
    std::fs::create_dir_all(std::env::temp_dir().join("dispatch-test-jobs")).unwrap();
    AppState {
        config: Arc::new(test_config(node_count)),
        tokens: Arc::new(InMemoryTokenStore::new()),
        limiter: Arc::new(Limiter::new()),
        vetter: Arc::new(CodeVetter::new(test_config(node_count).vetter)),
        queue: Arc::new(QueueManager::new(node_count)),
        jobs: Arc::new(InMemoryJobStore::new()),
        executors: Arc::new(Vec::new()),
    }
}

fn multipart_body(boundary: &str, code: &str, config_yaml: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"code\"; filename=\"solution.py\"\r\n\r\n{code}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"config_file\"; filename=\"config.yaml\"\r\n\r\n{config_yaml}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn submit_with_unknown_token_is_unauthorized() {
    let state = test_state(4).await;
    let app = build_app(state);

    let boundary = "X-TEST-BOUNDARY";
    let config_yaml =
        "competition_id: comp-1\nproject_id: proj-1\nuser_id: alice\nexpected_time: 10\ntoken: not-a-real-token\n";
    let body = multipart_body(boundary, "print('hi')", config_yaml);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/submit")
                .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                .extension(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_requires_auth() {
    let state = test_state(4).await;
    let app = build_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/status/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn nodes_endpoint_is_unauthenticated() {
    let state = test_state(4).await;
    let app = build_app(state);

    let response = app
        .oneshot(Request::builder().uri("/nodes").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["nodes"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn submit_then_wait_expires_without_a_worker() {
    let state = test_state(4).await;
    state.tokens.issue("alice", "alice-token", 30, false).await.unwrap();
    let app = build_app(state);

    let boundary = "X-TEST-BOUNDARY";
    let config_yaml = "competition_id: comp-1\nproject_id: proj-1\nuser_id: alice\nexpected_time: 10\ntoken: alice-token\n";
    let body = multipart_body(boundary, "print('hi')", config_yaml);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/submit")
                .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                .extension(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "pending");
    assert!(json["message"].as_str().unwrap().contains("Timeout"));
}

#[tokio::test]
async fn submit_with_mismatched_user_id_is_forbidden() {
    let state = test_state(4).await;
    state.tokens.issue("alice", "alice-token", 30, false).await.unwrap();
    let app = build_app(state);

    let boundary = "X-TEST-BOUNDARY";
    let config_yaml =
        "competition_id: comp-1\nproject_id: proj-1\nuser_id: bob\nexpected_time: 10\ntoken: alice-token\n";
    let body = multipart_body(boundary, "print('hi')", config_yaml);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/submit")
                .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                .extension(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn jobs_list_forces_non_admin_to_own_jobs() {
    let state = test_state(4).await;
    state.tokens.issue("alice", "alice-token", 30, false).await.unwrap();
    let alice_job = dispatch_core::kernel::jobs::Job::builder()
        .owner_user_id("alice")
        .competition_id("c")
        .project_id("p")
        .expected_time_seconds(10)
        .token_fingerprint("fp")
        .code_path("x")
        .config_path("y")
        .build();
    let bob_job = dispatch_core::kernel::jobs::Job::builder()
        .owner_user_id("bob")
        .competition_id("c")
        .project_id("p")
        .expected_time_seconds(10)
        .token_fingerprint("fp")
        .code_path("x")
        .config_path("y")
        .build();
    state.jobs.insert(alice_job).await.unwrap();
    state.jobs.insert(bob_job).await.unwrap();

    let app = build_app(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/jobs?user_id=bob")
                .header("authorization", "Bearer alice-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let jobs = json["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["user_id"], "alice");
}

#[tokio::test]
async fn cancel_pending_job_removes_it_from_queue() {
    // No worker pool runs in this state, so a submitted job sits pending in
    // the queue indefinitely — this drives the real /submit -> /cancel path
    // rather than forging a job row, so it actually exercises assign()'s
    // persisted assigned_node_id (§3) and the queue-removal branch in
    // cancel.rs.
    let state = test_state(4).await;
    state.tokens.issue("alice", "alice-token", 30, false).await.unwrap();
    let app = build_app(state);

    let boundary = "X-TEST-BOUNDARY";
    let config_yaml =
        "competition_id: comp-1\nproject_id: proj-1\nuser_id: alice\nexpected_time: 10\ntoken: alice-token\n";
    let body = multipart_body(boundary, "print('hi')", config_yaml);

    let submit_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/submit")
                .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                .extension(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(submit_response.status(), StatusCode::OK);
    let submit_json = body_json(submit_response).await;
    assert_eq!(submit_json["status"], "pending");
    let job_id = submit_json["job_id"].as_str().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/cancel/{job_id}"))
                .header("authorization", "Bearer alice-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "cancelled");
    assert_eq!(json["message"], "Job cancelled successfully");
}

