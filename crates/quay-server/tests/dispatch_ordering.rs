//! End-to-end dispatch ordering contracts.
//!
//! Proxy before API before static, and client-before-global within the
//! proxy and router stages, are load-bearing; these tests drive the full
//! axum application in-process.

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use quay_server::config::{ClientMount, ProxyRule, ServerConfig};
use quay_server::router::{ApiResponse, Router};
use quay_server::server::DevServer;
use std::fs;
use std::net::SocketAddr;
use tempfile::TempDir;
use tower::ServiceExt;

fn config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap())
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_string(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Upstream that answers every request with a fixed marker.
async fn spawn_upstream(marker: &'static str) -> SocketAddr {
    let app = axum::Router::new().fallback(move || async move { marker });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn proxy_is_tried_before_the_api_router() {
    let upstream = spawn_upstream("from-proxy").await;
    let temp = TempDir::new().unwrap();

    let api = Router::new().get("/api/echo", |_req| async { Ok(ApiResponse::text("from-api")) });
    let config = config().mount(
        ClientMount::new(temp.path())
            .api(api)
            .proxy_rule(ProxyRule::new("/api", &format!("http://{}", upstream)).unwrap()),
    );
    let app = DevServer::new(config).unwrap().build_app();

    let resp = app.oneshot(get("/api/echo")).await.unwrap();
    assert_eq!(body_string(resp).await, "from-proxy");
}

#[tokio::test]
async fn api_is_tried_before_static_files() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("hello.txt"), "from-disk").unwrap();

    let api =
        Router::new().get("/hello.txt", |_req| async { Ok(ApiResponse::text("from-api")) });
    let config = config().mount(ClientMount::new(temp.path()).api(api));
    let app = DevServer::new(config).unwrap().build_app();

    let resp = app.clone().oneshot(get("/hello.txt")).await.unwrap();
    assert_eq!(body_string(resp).await, "from-api");

    // Unrouted paths still reach the disk.
    fs::write(temp.path().join("other.txt"), "from-disk").unwrap();
    let resp = app.oneshot(get("/other.txt")).await.unwrap();
    assert_eq!(body_string(resp).await, "from-disk");
}

#[tokio::test]
async fn mount_proxy_rules_beat_global_rules() {
    let mount_upstream = spawn_upstream("mount-rule").await;
    let global_upstream = spawn_upstream("global-rule").await;
    let temp = TempDir::new().unwrap();

    let config = config()
        .mount(
            ClientMount::new(temp.path())
                .proxy_rule(ProxyRule::new("/svc", &format!("http://{}", mount_upstream)).unwrap()),
        )
        .proxy_rule(ProxyRule::new("/svc", &format!("http://{}", global_upstream)).unwrap());
    let app = DevServer::new(config).unwrap().build_app();

    let resp = app.oneshot(get("/svc/x")).await.unwrap();
    assert_eq!(body_string(resp).await, "mount-rule");
}

#[tokio::test]
async fn global_proxy_applies_when_mount_has_no_match() {
    let global_upstream = spawn_upstream("global-rule").await;
    let temp = TempDir::new().unwrap();

    let config = config()
        .mount(ClientMount::new(temp.path()))
        .proxy_rule(ProxyRule::new("/svc", &format!("http://{}", global_upstream)).unwrap());
    let app = DevServer::new(config).unwrap().build_app();

    let resp = app.oneshot(get("/svc/x")).await.unwrap();
    assert_eq!(body_string(resp).await, "global-rule");
}

#[tokio::test]
async fn dead_upstream_is_a_502_with_bad_gateway_body() {
    // A port with nothing behind it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let temp = TempDir::new().unwrap();
    let config = config()
        .mount(ClientMount::new(temp.path()))
        .proxy_rule(ProxyRule::new("/api", &format!("http://{}", dead)).unwrap());
    let app = DevServer::new(config).unwrap().build_app();

    let resp = app.oneshot(get("/api/x")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert!(body_string(resp).await.contains("Bad Gateway"));
}

#[tokio::test]
async fn global_api_router_matches_original_path() {
    let temp = TempDir::new().unwrap();

    let global_api = Router::new().get("/app/version", |_req| async {
        Ok(ApiResponse::json(&serde_json::json!({"version": "0.2.0"})))
    });
    let config = config()
        .mount(ClientMount::new(temp.path()).base_path("/app"))
        .api(global_api);
    let app = DevServer::new(config).unwrap().build_app();

    // The global router sees "/app/version", not the stripped "/version".
    let resp = app.oneshot(get("/app/version")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_string(resp).await.contains("0.2.0"));
}

#[tokio::test]
async fn mutating_miss_is_405_but_only_with_a_router() {
    let temp = TempDir::new().unwrap();

    // With an API router configured:
    let api = Router::new().get("/known", |_req| async { Ok(ApiResponse::text("ok")) });
    let with_api = config().mount(ClientMount::new(temp.path()).api(api));
    let app = DevServer::new(with_api).unwrap().build_app();

    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/unknown")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    // Without one, a mutating miss is a plain 404.
    let without_api = config().mount(ClientMount::new(temp.path()));
    let app = DevServer::new(without_api).unwrap().build_app();

    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/unknown")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn base_path_is_stripped_before_resolution() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("assets")).unwrap();
    fs::write(temp.path().join("assets/app.css"), ".x{}").unwrap();

    let config = config().mount(ClientMount::new(temp.path()).base_path("/site"));
    let app = DevServer::new(config).unwrap().build_app();

    let resp = app.clone().oneshot(get("/site/assets/app.css")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, ".x{}");

    // The unprefixed path must not reach this mount.
    let resp = app.oneshot(get("/assets/app.css")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn traversal_and_nul_requests_are_403() {
    let temp = TempDir::new().unwrap();
    let config = config().mount(ClientMount::new(temp.path()));
    let app = DevServer::new(config).unwrap().build_app();

    for path in ["/..%2f..%2fetc/passwd", "/%2e%2e/secret", "/file%00.html"] {
        let resp = app.clone().oneshot(get(path)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{} must be rejected", path);
    }
}

#[tokio::test]
async fn cors_preflight_is_answered() {
    let temp = TempDir::new().unwrap();
    let config = config().mount(ClientMount::new(temp.path()));
    let app = DevServer::new(config).unwrap().build_app();

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/anything")
        .header(header::ORIGIN, "http://evil.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert!(resp.status().is_success());
    assert!(resp
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}
