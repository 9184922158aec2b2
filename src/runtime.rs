use crate::hub::HubHandle;
use crate::kv::KvStore;
use crate::outbound::{FetchOptions, OutboundClient};
use crate::{PlatformError, SCRIPT_BODY_LIMIT, SCRIPT_DEADLINE};
use log::{debug, info};
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Map, Scope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Request view bound into the script as the `req` global
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub method: String,
    pub path: String,
    /// Raw query string, not parsed
    pub query: String,
    /// First value per header, lower-cased names
    pub headers: HashMap<String, String>,
    /// UTF-8 body, truncated to [`SCRIPT_BODY_LIMIT`]
    pub body: String,
}

impl ScriptRequest {
    /// Truncate a raw body to the script-visible cap, respecting UTF-8
    pub fn clamp_body(raw: &[u8]) -> String {
        let clamped = if raw.len() > SCRIPT_BODY_LIMIT {
            &raw[..SCRIPT_BODY_LIMIT]
        } else {
            raw
        };
        String::from_utf8_lossy(clamped).into_owned()
    }
}

/// Response assembled by a script through the `res` capability
#[derive(Debug, Clone)]
pub struct ScriptResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Set once `send`/`json` has written; later writes are ignored
    pub flushed: bool,
}

impl Default for ScriptResponse {
    fn default() -> Self {
        ScriptResponse {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            flushed: false,
        }
    }
}

impl ScriptResponse {
    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    fn timeout() -> Self {
        ScriptResponse {
            status: 500,
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: PlatformError::ScriptTimeout.to_string().into_bytes(),
            flushed: true,
        }
    }

    fn script_error(message: &str) -> Self {
        ScriptResponse {
            status: 500,
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: format!("Script error: {}", message).into_bytes(),
            flushed: true,
        }
    }
}

/// One-shot writer handed to scripts as `res`
#[derive(Clone)]
struct ResponseCap {
    state: Arc<Mutex<ScriptResponse>>,
}

impl ResponseCap {
    fn send(&self, body: &str) {
        let mut state = self.state.lock();
        if state.flushed {
            return;
        }
        if !state.has_header("content-type") {
            state.headers.push((
                "Content-Type".to_string(),
                "text/html; charset=utf-8".to_string(),
            ));
        }
        state.body = body.as_bytes().to_vec();
        state.flushed = true;
    }

    fn json(&self, value: serde_json::Value) {
        let mut state = self.state.lock();
        if state.flushed {
            return;
        }
        if !state.has_header("content-type") {
            state
                .headers
                .push(("Content-Type".to_string(), "application/json".to_string()));
        }
        state.body = value.to_string().into_bytes();
        state.flushed = true;
    }

    fn status(&self, code: i64) {
        let mut state = self.state.lock();
        if state.flushed || !(100..=599).contains(&code) {
            return;
        }
        state.status = code as u16;
    }

    fn header(&self, name: &str, value: &str) {
        let mut state = self.state.lock();
        if state.flushed {
            return;
        }
        state
            .headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        state.headers.push((name.to_string(), value.to_string()));
    }
}

/// Site-scoped KV capability (`db`)
#[derive(Clone)]
struct DbCap {
    kv: KvStore,
    site_id: String,
}

/// WebSocket fan-out capability (`socket`)
#[derive(Clone)]
struct SocketCap {
    hub: HubHandle,
}

/// Host-log capability (`console`)
#[derive(Clone)]
struct ConsoleCap {
    site_id: String,
}

impl ConsoleCap {
    fn write(&self, args: &[Dynamic]) {
        let line = args
            .iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        info!("[{}] {}", self.site_id, line);
    }
}

fn dynamic_to_stored(value: Dynamic) -> Result<String, Box<rhai::EvalAltResult>> {
    if value.is_string() {
        return value.into_string().map_err(|t| {
            Box::<rhai::EvalAltResult>::from(format!("unexpected value type {}", t))
        });
    }
    let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
    Ok(json.to_string())
}

fn stored_to_dynamic(raw: String) -> Dynamic {
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(json) => rhai::serde::to_dynamic(&json).unwrap_or_else(|_| Dynamic::from(raw)),
        Err(_) => Dynamic::from(raw),
    }
}

fn fetch_result_to_map(result: Result<crate::outbound::FetchResponse, String>) -> Map {
    let mut map = Map::new();
    match result {
        Ok(response) => {
            map.insert("status".into(), Dynamic::from(response.status as i64));
            let mut headers = Map::new();
            for (name, value) in response.headers {
                headers.insert(name.into(), Dynamic::from(value));
            }
            map.insert("headers".into(), Dynamic::from_map(headers));
            map.insert("body".into(), Dynamic::from(response.body));
        }
        Err(message) => {
            map.insert("error".into(), Dynamic::from(message));
        }
    }
    map
}

fn options_from_map(options: Map) -> FetchOptions {
    let mut parsed = FetchOptions::default();
    if let Some(method) = options.get("method") {
        if let Ok(method) = method.clone().into_string() {
            parsed.method = Some(method);
        }
    }
    if let Some(body) = options.get("body") {
        if let Ok(body) = body.clone().into_string() {
            parsed.body = Some(body);
        }
    }
    if let Some(headers) = options.get("headers") {
        if let Some(headers) = headers.read_lock::<Map>() {
            for (name, value) in headers.iter() {
                if let Ok(value) = value.clone().into_string() {
                    parsed.headers.insert(name.to_string(), value);
                }
            }
        }
    }
    parsed
}

/// Per-request sandboxed script runtime.
///
/// Every execution gets a fresh engine and scope; scripts share nothing but
/// the persistent stores and the site's hub. The wall-clock deadline is
/// enforced through the engine's progress interrupt.
#[derive(Clone)]
pub struct ScriptRuntime {
    kv: KvStore,
    outbound: OutboundClient,
}

impl ScriptRuntime {
    pub fn new(kv: KvStore, outbound: OutboundClient) -> Self {
        ScriptRuntime { kv, outbound }
    }

    /// Execute a site's main script against one request.
    ///
    /// Never fails: timeouts and script errors are rendered into the
    /// returned response, and the host keeps running.
    ///
    /// Must be called from a blocking-capable thread; the script and its
    /// capabilities run synchronously.
    pub fn execute(
        &self,
        site_id: &str,
        source: &str,
        request: ScriptRequest,
        env_vars: HashMap<String, String>,
        hub: HubHandle,
    ) -> ScriptResponse {
        let state = Arc::new(Mutex::new(ScriptResponse::default()));
        let started = Instant::now();
        let deadline = started + SCRIPT_DEADLINE;

        let mut engine = Engine::new();
        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
        self.bind_capabilities(&mut engine);

        let mut scope = Scope::new();
        scope.push("req", request_to_map(&request));
        scope.push("process", process_map(env_vars));
        scope.push("res", ResponseCap { state: state.clone() });
        scope.push(
            "db",
            DbCap {
                kv: self.kv.clone(),
                site_id: site_id.to_string(),
            },
        );
        scope.push("socket", SocketCap { hub });
        scope.push("console", ConsoleCap {
            site_id: site_id.to_string(),
        });

        let outcome = engine.eval_with_scope::<Dynamic>(&mut scope, source);
        let elapsed = started.elapsed();

        match outcome {
            Ok(_) => {
                debug!("Script for '{}' completed in {:?}", site_id, elapsed);
                let finished = state.lock().clone();
                // A script that never wrote still answers: empty 200
                finished
            }
            Err(err) => match *err {
                rhai::EvalAltResult::ErrorTerminated(_, _) => {
                    info!("Script for '{}' hit the deadline after {:?}", site_id, elapsed);
                    let current = state.lock().clone();
                    if current.flushed {
                        current
                    } else {
                        ScriptResponse::timeout()
                    }
                }
                other => {
                    info!("Script for '{}' failed: {}", site_id, other);
                    let current = state.lock().clone();
                    if current.flushed {
                        current
                    } else {
                        ScriptResponse::script_error(&other.to_string())
                    }
                }
            },
        }
    }

    /// Register each capability individually; scripts get typed host
    /// closures, never name-based dispatch
    fn bind_capabilities(&self, engine: &mut Engine) {
        engine.register_type_with_name::<ResponseCap>("Response");
        engine.register_fn("send", |res: &mut ResponseCap, body: &str| res.send(body));
        engine.register_fn("send", |res: &mut ResponseCap, body: Dynamic| {
            res.send(&body.to_string())
        });
        engine.register_fn(
            "json",
            |res: &mut ResponseCap, value: Dynamic| -> Result<(), Box<rhai::EvalAltResult>> {
                let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
                res.json(json);
                Ok(())
            },
        );
        engine.register_fn("status", |res: &mut ResponseCap, code: i64| res.status(code));
        engine.register_fn("header", |res: &mut ResponseCap, name: &str, value: &str| {
            res.header(name, value)
        });

        engine.register_type_with_name::<DbCap>("Db");
        engine.register_fn(
            "get",
            |db: &mut DbCap, key: &str| -> Result<Dynamic, Box<rhai::EvalAltResult>> {
                match db.kv.get(&db.site_id, key) {
                    Ok(Some(raw)) => Ok(stored_to_dynamic(raw)),
                    Ok(None) => Ok(Dynamic::UNIT),
                    Err(e) => Err(e.to_string().into()),
                }
            },
        );
        engine.register_fn(
            "set",
            |db: &mut DbCap, key: &str, value: Dynamic| -> Result<(), Box<rhai::EvalAltResult>> {
                let stored = dynamic_to_stored(value)?;
                db.kv
                    .set(&db.site_id, key, &stored)
                    .map_err(|e| e.to_string().into())
            },
        );
        engine.register_fn(
            "delete",
            |db: &mut DbCap, key: &str| -> Result<(), Box<rhai::EvalAltResult>> {
                db.kv
                    .delete(&db.site_id, key)
                    .map_err(|e| e.to_string().into())
            },
        );

        engine.register_type_with_name::<SocketCap>("Socket");
        engine.register_fn("broadcast", |socket: &mut SocketCap, message: Dynamic| {
            let text = if message.is_string() {
                message.to_string()
            } else {
                rhai::serde::from_dynamic::<serde_json::Value>(&message)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| message.to_string())
            };
            socket.hub.broadcast(text);
        });
        engine.register_fn("clients", |socket: &mut SocketCap| socket.hub.clients() as i64);

        engine.register_type_with_name::<ConsoleCap>("Console");
        engine.register_fn("log", |c: &mut ConsoleCap, a: Dynamic| c.write(&[a]));
        engine.register_fn("log", |c: &mut ConsoleCap, a: Dynamic, b: Dynamic| {
            c.write(&[a, b])
        });
        engine.register_fn(
            "log",
            |c: &mut ConsoleCap, a: Dynamic, b: Dynamic, d: Dynamic| c.write(&[a, b, d]),
        );
        engine.register_fn(
            "log",
            |c: &mut ConsoleCap, a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic| {
                c.write(&[a, b, d, e])
            },
        );
        engine.register_fn(
            "log",
            |c: &mut ConsoleCap, a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic, f: Dynamic| {
                c.write(&[a, b, d, e, f])
            },
        );

        let outbound = self.outbound.clone();
        engine.register_fn("fetch", move |url: &str| -> Map {
            fetch_result_to_map(outbound.fetch_blocking(url, FetchOptions::default()))
        });
        let outbound = self.outbound.clone();
        engine.register_fn("fetch", move |url: &str, options: Map| -> Map {
            fetch_result_to_map(outbound.fetch_blocking(url, options_from_map(options)))
        });
    }
}

fn request_to_map(request: &ScriptRequest) -> Map {
    let mut headers = Map::new();
    for (name, value) in &request.headers {
        headers.insert(name.as_str().into(), Dynamic::from(value.clone()));
    }

    let mut map = Map::new();
    map.insert("method".into(), Dynamic::from(request.method.clone()));
    map.insert("path".into(), Dynamic::from(request.path.clone()));
    map.insert("query".into(), Dynamic::from(request.query.clone()));
    map.insert("headers".into(), Dynamic::from_map(headers));
    map.insert("body".into(), Dynamic::from(request.body.clone()));
    map
}

fn process_map(env_vars: HashMap<String, String>) -> Map {
    let mut env = Map::new();
    for (name, value) in env_vars {
        env.insert(name.into(), Dynamic::from(value));
    }
    let mut process = Map::new();
    process.insert("env".into(), Dynamic::from_map(env));
    process
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubRegistry;
    use crate::store::Store;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        runtime: ScriptRuntime,
        registry: HubRegistry,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("test.db")).unwrap());
        let kv = KvStore::new(store);
        let outbound = OutboundClient::new(tokio::runtime::Handle::current());
        Harness {
            _dir: dir,
            runtime: ScriptRuntime::new(kv, outbound),
            registry: HubRegistry::new(),
        }
    }

    fn plain_request() -> ScriptRequest {
        ScriptRequest {
            method: "GET".to_string(),
            path: "/".to_string(),
            query: String::new(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    async fn run(harness: &Harness, source: &str) -> ScriptResponse {
        run_with(harness, source, plain_request(), HashMap::new()).await
    }

    async fn run_with(
        harness: &Harness,
        source: &str,
        request: ScriptRequest,
        env_vars: HashMap<String, String>,
    ) -> ScriptResponse {
        let runtime = harness.runtime.clone();
        let hub = harness.registry.handle("test-site");
        let source = source.to_string();
        tokio::task::spawn_blocking(move || {
            runtime.execute("test-site", &source, request, env_vars, hub)
        })
        .await
        .unwrap()
    }

    fn header<'a>(response: &'a ScriptResponse, name: &str) -> Option<&'a str> {
        response
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_with_default_content_type() {
        let h = harness();
        let response = run(&h, r#"res.send("hello")"#).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
        assert_eq!(
            header(&response, "content-type"),
            Some("text/html; charset=utf-8")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_response_write_is_one_shot() {
        let h = harness();
        let response = run(&h, r#"res.send("a"); res.send("b");"#).await;
        assert_eq!(response.body, b"a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_script_yields_empty_200() {
        let h = harness();
        let response = run(&h, "let x = 1 + 1;").await;
        assert_eq!(response.status, 200);
        assert!(response.body.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_and_headers_before_flush() {
        let h = harness();
        let response = run(
            &h,
            r#"res.status(201); res.header("X-Custom", "yes"); res.send("ok");"#,
        )
        .await;
        assert_eq!(response.status, 201);
        assert_eq!(header(&response, "x-custom"), Some("yes"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_after_flush_ignored() {
        let h = harness();
        let response = run(&h, r#"res.send("a"); res.status(500);"#).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_json_response() {
        let h = harness();
        let response = run(&h, r#"res.json(#{n: 1});"#).await;
        assert_eq!(response.body, br#"{"n":1}"#);
        assert_eq!(header(&response, "content-type"), Some("application/json"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_counter_increments_across_requests() {
        let h = harness();
        let script = r#"
            let n = db.get("n");
            if n == () { n = 0 }
            n += 1;
            db.set("n", n);
            res.json(#{n: n});
        "#;

        for expected in 1..=3 {
            let response = run(&h, script).await;
            assert_eq!(
                String::from_utf8_lossy(&response.body),
                format!("{{\"n\":{}}}", expected)
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_kv_json_round_trip() {
        let h = harness();
        run(&h, r#"db.set("obj", #{a: [1, 2], b: "x"});"#).await;
        let response = run(&h, r#"res.json(db.get("obj"));"#).await;
        let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(value, serde_json::json!({"a": [1, 2], "b": "x"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_infinite_loop_times_out() {
        let h = harness();
        let started = Instant::now();
        let response = run(&h, "while true {}").await;
        let elapsed = started.elapsed();

        assert_eq!(response.status, 500);
        assert!(String::from_utf8_lossy(&response.body).contains("timed out"));
        assert!(
            elapsed < std::time::Duration::from_millis(250),
            "took {:?}",
            elapsed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_script_error_maps_to_500() {
        let h = harness();
        let response = run(&h, r#"throw "boom";"#).await;
        assert_eq!(response.status, 500);
        assert!(String::from_utf8_lossy(&response.body).contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flushed_output_survives_later_error() {
        let h = harness();
        let response = run(&h, r#"res.send("done"); throw "late";"#).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"done");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_bindings() {
        let h = harness();
        let mut request = plain_request();
        request.method = "POST".to_string();
        request.path = "/submit".to_string();
        request.query = "a=1&b=2".to_string();
        request
            .headers
            .insert("x-token".to_string(), "t123".to_string());
        request.body = "payload".to_string();

        let response = run_with(
            &h,
            r#"res.send(req.method + " " + req.path + "?" + req.query + " " + req.headers["x-token"] + " " + req.body);"#,
            request,
            HashMap::new(),
        )
        .await;
        assert_eq!(
            String::from_utf8_lossy(&response.body),
            "POST /submit?a=1&b=2 t123 payload"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_env_snapshot() {
        let h = harness();
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi there".to_string());

        let response = run_with(
            &h,
            "res.send(process.env.GREETING);",
            plain_request(),
            env,
        )
        .await;
        assert_eq!(response.body, b"hi there");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetch_internal_target_blocked() {
        let h = harness();
        let response = run(
            &h,
            r#"let r = fetch("http://127.0.0.1:22"); res.json(r);"#,
        )
        .await;
        let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        let error = value["error"].as_str().unwrap();
        assert!(error.contains("Blocked"), "got {}", error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetch_invalid_url_is_in_band() {
        let h = harness();
        let response = run(&h, r#"res.json(fetch("::nope::"));"#).await;
        let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert!(value["error"].as_str().unwrap().starts_with("Invalid URL"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_socket_broadcast_and_clients() {
        let h = harness();
        let hub = h.registry.handle("test-site");
        let (_id, mut rx) = hub.register();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let response = run(
            &h,
            r#"socket.broadcast("hi"); res.send(socket.clients().to_string());"#,
        )
        .await;
        assert_eq!(response.body, b"1");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        match rx.try_recv().unwrap() {
            axum::extract::ws::Message::Text(text) => assert_eq!(text, "hi"),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
