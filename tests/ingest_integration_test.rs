//! End-to-end tests of the ingestion service
//!
//! Each test builds a full `AppState` in a temp directory and drives
//! `handle_request` directly, without binding a socket.

use std::net::SocketAddr;
use std::sync::Arc;

use aegis_log_ingest::config::{Config, Paths};
use aegis_log_ingest::export::PageData;
use aegis_log_ingest::server::{handle_request, AppState};
use hyper::body::to_bytes;
use hyper::{Body, Request, Response, StatusCode};
use tempfile::TempDir;

struct Node {
    dir: TempDir,
    state: Arc<AppState>,
}

fn server_toml(export_dir: &std::path::Path, requests: u64) -> String {
    format!(
        r#"
        [server]
        server_name = "ingest-test"

        [server.headers]
        X-Content-Type-Options = "nosniff"

        [rate_limit]
        requests = {requests}
        window_secs = 60

        [streams.web]
        host = "127.0.0.1"
        port = 9090
        file = "web.log"

        [streams.web.export]
        kind = "directory"
        target = "{}"
        "#,
        export_dir.display()
    )
}

async fn start_node(system_json: &str, requests: u64) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("configs");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("system.json"), system_json).unwrap();

    let config = Config::from_toml(&server_toml(&dir.path().join("export"), requests)).unwrap();
    config.validate().unwrap();
    let paths = Paths::new(&config_dir);
    let state = AppState::build(&config, &paths, "web").await.unwrap();

    Node {
        dir,
        state: Arc::new(state),
    }
}

fn client(ip: &str) -> SocketAddr {
    format!("{}:40000", ip).parse().unwrap()
}

async fn send(node: &Node, ip: &str, req: Request<Body>) -> Response<Body> {
    handle_request(Arc::clone(&node.state), req, client(ip))
        .await
        .unwrap()
}

async fn get(node: &Node, ip: &str, uri: &str) -> Response<Body> {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(node, ip, req).await
}

async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(to_bytes(response.into_body()).await.unwrap().to_vec()).unwrap()
}

#[tokio::test]
async fn test_save_log_and_read_back() {
    let node = start_node(r#"{"root_pass": "hunter2"}"#, 100).await;

    let response = get(&node, "198.51.100.1", "/aegis/log/save-log?level=2&msg=first").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("server").unwrap(), "ingest-test");
    assert_eq!(response.headers().get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(body_text(response).await, "success.");

    let req = Request::builder()
        .method("POST")
        .uri("/aegis/log/save-log")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("message=second"))
        .unwrap();
    assert_eq!(send(&node, "198.51.100.1", req).await.status(), StatusCode::OK);

    let response = get(
        &node,
        "198.51.100.1",
        "/aegis/log/get-latest-logs?root_pass=hunter2",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let lines: Vec<String> = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("[INFO] second"));
    assert!(lines[1].ends_with("[WARNING] first"));

    let response = get(&node, "198.51.100.1", "/aegis/log/get-logs?root_pass=wrong").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalid_input_is_forbidden() {
    let node = start_node("{}", 100).await;

    let response = get(&node, "198.51.100.2", "/aegis/log/save-log?level=7&msg=x").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = get(&node, "198.51.100.2", "/aegis/log/save-log").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let req = Request::builder()
        .method("POST")
        .uri("/aegis/log/save-log")
        .header("content-type", "application/json")
        .body(Body::from("not json"))
        .unwrap();
    assert_eq!(send(&node, "198.51.100.2", req).await.status(), StatusCode::FORBIDDEN);

    assert_eq!(node.state.log_file.byte_size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_path_and_maintenance() {
    let node = start_node("{}", 100).await;

    let response = get(&node, "198.51.100.3", "/aegis/log/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = get(&node, "198.51.100.3", "/favicon.ico").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    std::fs::write(
        node.dir.path().join("configs/system.json"),
        r#"{"maintenance_mode": true}"#,
    )
    .unwrap();
    assert_eq!(node.state.stores.reload_all().await, 0);

    let response = get(&node, "198.51.100.3", "/aegis/log/save-log?msg=x").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_rate_limit_returns_retry_after() {
    let node = start_node("{}", 2).await;

    for _ in 0..2 {
        let response = get(&node, "198.51.100.4", "/aegis/log/save-log?msg=x").await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = get(&node, "198.51.100.4", "/aegis/log/save-log?msg=x").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("retry-after").is_some());
    assert!(response.headers().get("access-control-allow-origin").is_some());

    // Other origins have their own window
    let response = get(&node, "198.51.100.5", "/aegis/log/save-log?msg=x").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_abuse_sweep_blacklists_origin() {
    let node = start_node(r#"{"dos_detect": 3}"#, 1000).await;

    for _ in 0..4 {
        get(&node, "203.0.113.9", "/aegis/log/save-log?msg=flood").await;
    }
    get(&node, "203.0.113.10", "/aegis/log/save-log?msg=calm").await;

    let added = node.state.detector.sweep().await;
    assert_eq!(added, vec!["203.0.113.9".to_string()]);

    let response = get(&node, "203.0.113.9", "/aegis/log/save-log?msg=again").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = get(&node, "203.0.113.10", "/aegis/log/save-log?msg=fine").await;
    assert_eq!(response.status(), StatusCode::OK);

    let persisted = std::fs::read_to_string(node.dir.path().join("configs/ip_blacklist.json")).unwrap();
    assert!(persisted.contains("203.0.113.9"));
    let audit = std::fs::read_to_string(node.dir.path().join("logs/secure.log")).unwrap();
    assert!(audit.contains("Add 203.0.113.9 to the blacklist. <dos_detection>"));
}

#[tokio::test]
async fn test_api_key_from_json_body() {
    let node = start_node("{}", 100).await;
    std::fs::write(node.dir.path().join("configs/api_key.json"), r#"["k-123"]"#).unwrap();
    node.state.stores.reload_all().await;

    let response = get(&node, "198.51.100.6", "/aegis/log/save-log?msg=x").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let req = Request::builder()
        .method("POST")
        .uri("/aegis/log/save-logs")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"api_key": "k-123", "logs": [{"level": 3, "msg": "a"}, {"message": "b"}]}"#,
        ))
        .unwrap();
    assert_eq!(send(&node, "198.51.100.6", req).await.status(), StatusCode::OK);

    let req = Request::builder()
        .uri("/aegis/log/save-log?msg=y")
        .header("x-api-key", "k-123")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&node, "198.51.100.6", req).await.status(), StatusCode::OK);

    assert_eq!(node.state.log_file.line_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_accepted_records_are_exported() {
    let node = start_node("{}", 100).await;

    let req = Request::builder()
        .method("POST")
        .uri("/aegis/log/save-logs")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"logs": [{"level": 0, "msg": "one"}, {"level": 4, "msg": "two"}]}"#,
        ))
        .unwrap();
    assert_eq!(send(&node, "198.51.100.7", req).await.status(), StatusCode::OK);

    let exporter = node.state.exporter.as_ref().unwrap();
    let outcome = exporter.run_cycle().await.unwrap().unwrap();
    assert_eq!(outcome.exported, 2);

    let page: PageData = serde_json::from_slice(
        &std::fs::read(node.dir.path().join("export/0-2.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(page.rows[0], vec!["Level", "Timestamp", "Message"]);
    assert_eq!(page.rows[1][0], "0");
    assert_eq!(page.rows[2][2], "two");

    assert!(exporter.run_cycle().await.unwrap().is_none());
}

#[tokio::test]
async fn test_doomed_requests_are_rejected_before_body_read() {
    let node = start_node("{}", 100).await;
    node.state.stores.blacklist.append("203.0.113.20").await.unwrap();

    // The body never completes; answering at all means it was not read
    let (_sender, body) = Body::channel();
    let req = Request::builder()
        .method("POST")
        .uri("/aegis/log/save-log")
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        send(&node, "203.0.113.20", req),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    std::fs::write(
        node.dir.path().join("configs/system.json"),
        r#"{"maintenance_mode": true}"#,
    )
    .unwrap();
    node.state.stores.reload_all().await;

    let (_sender, body) = Body::channel();
    let req = Request::builder()
        .method("POST")
        .uri("/aegis/log/save-log")
        .body(body)
        .unwrap();
    let response = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        send(&node, "198.51.100.8", req),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_records() {
    let node = start_node("{}", 100).await;
    let tasks = node.state.spawn_background_tasks();

    for i in 0..3 {
        let uri = format!("/aegis/log/save-log?msg=late-{}", i);
        assert_eq!(get(&node, "198.51.100.9", &uri).await.status(), StatusCode::OK);
    }
    node.state.shutdown(tasks).await;

    let page: PageData = serde_json::from_slice(
        &std::fs::read(node.dir.path().join("export/0-3.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(page.rows.len(), 4);
    assert_eq!(page.rows[3][2], "late-2");
}
