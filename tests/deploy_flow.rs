//! End-to-end deploy and static-serving flows, exercised in-process against
//! the full application router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cartridge::utils::sha256_hex;
use cartridge::{create_app, AppConfig, AppState, Store};
use std::io::{Cursor, Write};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;

const BOUNDARY: &str = "cartridge-test-boundary";

fn test_state(dir: &TempDir) -> AppState {
    let config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    };
    let store = Arc::new(Store::open(config.database_path()).unwrap());
    AppState::new(config, store)
}

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        for (name, content) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

fn multipart_body(site_name: &str, archive: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    write!(
        body,
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"site_name\"\r\n\r\n{site_name}\r\n"
    )
    .unwrap();
    write!(
        body,
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"bundle.zip\"\r\n\
         Content-Type: application/zip\r\n\r\n"
    )
    .unwrap();
    body.extend_from_slice(archive);
    write!(body, "\r\n--{BOUNDARY}--\r\n").unwrap();
    body
}

fn deploy_request(site_name: &str, archive: &[u8], secret: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/deploy")
        .header("host", "localhost:4698")
        .header("authorization", format!("Bearer {}", secret))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(site_name, archive)))
        .unwrap()
}

fn site_get(host: &str, path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_static_deploy_and_fetch() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state.clone());
    let secret = state.tokens.issue("ci", None).unwrap().secret;

    let archive = build_zip(&[
        ("index.html", b"<h1>Hi</h1>".as_slice()),
        ("style.css", b"body{}".as_slice()),
    ]);
    let response = app
        .clone()
        .oneshot(deploy_request("demo", &archive, &secret))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let deploy: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(deploy["success"], true);
    assert_eq!(deploy["site"], "demo");
    assert_eq!(deploy["file_count"], 2);

    // Root maps to index.html with the strong ETag
    let response = app
        .clone()
        .oneshot(site_get("demo.localhost:4698", "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/html; charset=utf-8"
    );
    let expected_etag = format!("\"{}\"", sha256_hex("<h1>Hi</h1>"));
    assert_eq!(response.headers()["etag"], expected_etag.as_str());
    assert_eq!(body_bytes(response).await, b"<h1>Hi</h1>");

    // Conditional re-request returns 304 with an empty body
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header("host", "demo.localhost:4698")
        .header("if-none-match", expected_etag)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(response).await.is_empty());

    // The second file is reachable under its own path
    let response = app
        .clone()
        .oneshot(site_get("demo.localhost:4698", "/style.css"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"body{}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deploy_requires_bearer() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state);

    let archive = build_zip(&[("index.html", b"x".as_slice())]);

    // No Authorization header at all
    let request = Request::builder()
        .method("POST")
        .uri("/api/deploy")
        .header("host", "localhost")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body("demo", &archive)))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "Bearer");

    // Unknown token
    let response = app
        .clone()
        .oneshot(deploy_request("demo", &archive, "0badsecret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reserved_subdomain_rejected() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state.clone());
    let secret = state.tokens.issue("ci", None).unwrap().secret;

    let archive = build_zip(&[("index.html", b"x".as_slice())]);
    let response = app
        .clone()
        .oneshot(deploy_request("admin", &archive, &secret))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_traversal_entries_never_stored() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state.clone());
    let secret = state.tokens.issue("ci", None).unwrap().secret;

    let archive = build_zip(&[
        ("a.html", b"safe".as_slice()),
        ("../../etc/passwd", b"root:x".as_slice()),
    ]);
    let response = app
        .clone()
        .oneshot(deploy_request("demo", &archive, &secret))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let deploy: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(deploy["file_count"], 1);

    // Nothing escaped onto the host filesystem
    assert!(!dir.path().join("etc/passwd").exists());
    assert!(!std::path::Path::new("/etc/passwd_cartridge_test").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redeploy_removes_stale_files() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state.clone());
    let secret = state.tokens.issue("ci", None).unwrap().secret;

    let first = build_zip(&[
        ("a.html", b"a".as_slice()),
        ("b.html", b"b".as_slice()),
    ]);
    app.clone()
        .oneshot(deploy_request("site", &first, &secret))
        .await
        .unwrap();

    let second = build_zip(&[("a.html", b"a2".as_slice())]);
    app.clone()
        .oneshot(deploy_request("site", &second, &secret))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(site_get("site.localhost", "/b.html"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(site_get("site.localhost", "/a.html"))
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await, b"a2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_site_gets_named_404() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state);

    let response = app
        .oneshot(site_get("ghost.localhost:4698", "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("ghost"), "404 page must name the subdomain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_surface() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state.clone());
    let secret = state.tokens.issue("ci", None).unwrap().secret;

    let archive = build_zip(&[("index.html", b"x".as_slice())]);
    app.clone()
        .oneshot(deploy_request("demo", &archive, &secret))
        .await
        .unwrap();

    // Site summaries
    let request = Request::builder()
        .uri("/api/sites")
        .header("host", "localhost")
        .header("authorization", format!("Bearer {}", secret))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let sites: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(sites[0]["site_id"], "demo");
    assert_eq!(sites[0]["file_count"], 1);

    // Deployment ledger
    let request = Request::builder()
        .uri("/api/deployments")
        .header("host", "localhost")
        .header("authorization", format!("Bearer {}", secret))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let ledger: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(ledger[0]["site_id"], "demo");
    assert_eq!(ledger[0]["deployed_by"], "ci");

    // Delete the site, then its subdomain 404s
    let request = Request::builder()
        .method("DELETE")
        .uri("/api/sites/demo")
        .header("host", "localhost")
        .header("authorization", format!("Bearer {}", secret))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(site_get("demo.localhost", "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_and_security_headers() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state);

    let request = Request::builder()
        .uri("/health")
        .header("host", "localhost")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(response.headers()["referrer-policy"], "no-referrer");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_bytes(response).await, b"OK");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_id_propagation() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let app = create_app(state);

    let request = Request::builder()
        .uri("/health")
        .header("host", "localhost")
        .header("x-request-id", "deadbeefdeadbeef")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "deadbeefdeadbeef");
}
