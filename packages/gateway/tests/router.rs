use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use fngate::FunctionsRouter;
use fngate_code_store::{digest, CodeStore, InMemoryCodeStore};
use fngate_http::HttpRequest;
use fngate_metrics::MetricEmitter;
use fngate_sandbox::{ExecutionError, FunctionResponse, RunOptions, Sandbox, SyntaxError};

/// Treats code as plain text: `boom` fails at run time, anything
/// containing `syntax error` fails the syntax check, and `slow` ties up a
/// blocking thread while it compiles.
#[derive(Default)]
struct FakeSandbox {
    compiles: AtomicUsize,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    type Script = String;

    async fn test_syntax_error(
        &self,
        filename: &str,
        code: &str,
        _options: &RunOptions,
    ) -> Option<SyntaxError> {
        code.contains("syntax error")
            .then(|| SyntaxError::new(filename, "unexpected token"))
    }

    async fn compile_code(&self, _filename: &str, code: &str) -> Result<String, ExecutionError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if code == "slow" {
            tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(400)))
                .await
                .map_err(|e| ExecutionError::new(e.to_string()))?;
        } else {
            // Widen the window for concurrent cold reads.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(code.to_string())
    }

    async fn run_script(
        &self,
        script: Arc<String>,
        request: HttpRequest,
        options: &RunOptions,
    ) -> Result<FunctionResponse, ExecutionError> {
        if script.as_str() == "boom" {
            return Err(ExecutionError::with_status(504, "upstream timed out"));
        }
        Ok(FunctionResponse {
            status: 200,
            headers: [("x-prefix".to_string(), options.prefix.clone())]
                .into_iter()
                .collect(),
            body: json!({
                "code": *script,
                "method": request.method,
                "body": request.body,
            }),
        })
    }
}

struct Harness {
    app: Router,
    sandbox: Arc<FakeSandbox>,
    store: Arc<InMemoryCodeStore>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryCodeStore::new());
        let sandbox = Arc::new(FakeSandbox::default());
        let app = FunctionsRouter::new(
            store.clone() as Arc<dyn CodeStore>,
            sandbox.clone(),
            Arc::new(MetricEmitter::disabled()),
        )
        .unwrap()
        .into_router();

        Self {
            app,
            sandbox,
            store,
        }
    }

    fn compiles(&self) -> usize {
        self.sandbox.compiles.load(Ordering::SeqCst)
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, headers, value)
    }
}

#[tokio::test]
async fn test_create_then_read() {
    let harness = Harness::new();

    let (status, headers, body) = harness
        .send("POST", "/ns/fn", Some(json!({"code": "hello"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ETAG], digest("hello").as_str());
    assert_eq!(body, json!({"id": "fn", "code": "hello", "hash": digest("hello")}));

    let (status, headers, read) = harness.send("GET", "/ns/fn", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ETAG], digest("hello").as_str());
    assert_eq!(read, body);
}

#[tokio::test]
async fn test_second_create_conflicts() {
    let harness = Harness::new();

    harness
        .send("POST", "/ns/fn", Some(json!({"code": "first"})))
        .await;
    let (status, _, body) = harness
        .send("POST", "/ns/fn", Some(json!({"code": "second"})))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "The key ns:fn already exists"}));

    let (_, _, read) = harness.send("GET", "/ns/fn", None).await;
    assert_eq!(read["code"], "first");
}

#[tokio::test]
async fn test_invalid_instance_touches_nothing() {
    let harness = Harness::new();

    let (status, _, body) = harness
        .send("POST", "/ns/fn", Some(json!({"source": "x"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid instance");
    assert!(!body["details"].as_array().unwrap().is_empty());

    let (status, _, body) = harness
        .send("PUT", "/ns/fn", Some(json!({"code": 7})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid instance");

    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_non_json_body_is_invalid_instance() {
    let harness = Harness::new();

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ns/fn")
                .body(Body::from("code=1"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_syntax_error_touches_nothing() {
    let harness = Harness::new();

    let (status, _, body) = harness
        .send("POST", "/ns/fn", Some(json!({"code": "a syntax error"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"error": "Syntax error in ns/fn.js", "details": ["unexpected token"]})
    );

    let (status, _, _) = harness
        .send("PUT", "/ns/fn", Some(json!({"code": "a syntax error"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_update_replaces_without_conflict() {
    let harness = Harness::new();

    let (status, _, _) = harness
        .send("PUT", "/ns/fn", Some(json!({"code": "one"})))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = harness
        .send("PUT", "/ns/fn", Some(json!({"code": "two"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ETAG], digest("two").as_str());
    assert_eq!(body["hash"], digest("two"));

    let (_, _, read) = harness.send("GET", "/ns/fn", None).await;
    assert_eq!(read["code"], "two");
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let harness = Harness::new();

    let (status, _, body) = harness.send("DELETE", "/ns/missing", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    harness
        .send("POST", "/ns/fn", Some(json!({"code": "x"})))
        .await;
    let (status, _, _) = harness.send("DELETE", "/ns/fn", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) = harness.send("GET", "/ns/fn", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Code not found"}));
}

#[tokio::test]
async fn test_list_paginates() {
    let harness = Harness::new();
    for (namespace, id) in [("b", "1"), ("a", "2"), ("a", "1")] {
        harness
            .send("POST", &format!("/{}/{}", namespace, id), Some(json!({"code": "x"})))
            .await;
    }

    let (status, _, body) = harness.send("GET", "/?page=1&perPage=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "items": [{"namespace": "a", "id": "1"}, {"namespace": "a", "id": "2"}],
            "page": 1,
            "perPage": 2,
            "total": 3
        })
    );

    let (_, _, body) = harness.send("GET", "/?page=2&perPage=2", None).await;
    assert_eq!(body["items"], json!([{"namespace": "b", "id": "1"}]));

    let (_, _, body) = harness.send("GET", "/", None).await;
    assert_eq!(body["page"], 1);
    assert_eq!(body["perPage"], 10);
}

#[tokio::test]
async fn test_list_query_validation() {
    let harness = Harness::new();

    let (status, _, body) = harness.send("GET", "/?perPage=lots", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "perPage must be an integer");

    let (status, _, body) = harness.send("GET", "/?page=-3&perPage=1000", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["page"], 1);
    assert_eq!(body["perPage"], 100);
}

#[tokio::test]
async fn test_invalid_key_is_a_client_error() {
    let harness = Harness::new();

    // Dot-prefixed names are reserved for the disk store's own files.
    let (status, _, _) = harness.send("GET", "/ns/.hidden", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = harness
        .send("POST", "/.config/fn", Some(json!({"code": "x"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_run_missing_function() {
    let harness = Harness::new();

    let (status, _, body) = harness.send("PUT", "/ns/missing/run", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Code 'ns/missing' is not found"}));
    assert_eq!(harness.compiles(), 0);
}

#[tokio::test]
async fn test_run_passes_request_and_prefix() {
    let harness = Harness::new();
    harness
        .send("POST", "/ns/fn", Some(json!({"code": "echo"})))
        .await;

    let (status, headers, body) = harness
        .send("PUT", "/ns/fn/run", Some(json!({"name": "world"})))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-prefix"], "namespace:ns, id:fn");
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(
        body,
        json!({"code": "echo", "method": "PUT", "body": {"name": "world"}})
    );
}

#[tokio::test]
async fn test_run_compiles_once_until_updated() {
    let harness = Harness::new();
    harness
        .send("POST", "/ns/fn", Some(json!({"code": "v1"})))
        .await;

    for _ in 0..3 {
        let (_, _, body) = harness.send("PUT", "/ns/fn/run", None).await;
        assert_eq!(body["code"], "v1");
    }
    assert_eq!(harness.compiles(), 1);

    harness
        .send("PUT", "/ns/fn", Some(json!({"code": "v2"})))
        .await;
    let (_, _, body) = harness.send("PUT", "/ns/fn/run", None).await;
    assert_eq!(body["code"], "v2");
    assert_eq!(harness.compiles(), 2);
}

#[tokio::test]
async fn test_run_rejects_binary_body() {
    let harness = Harness::new();
    harness
        .send("POST", "/ns/fn", Some(json!({"code": "echo"})))
        .await;

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/ns/fn/run")
                .body(Body::from(vec![0x7b, 0xff, 0xfe, 0x7d]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({"error": "Request body must be UTF-8 text"}));
    assert_eq!(harness.compiles(), 0);
}

#[tokio::test]
async fn test_slow_compile_does_not_stall_other_requests() {
    let harness = Arc::new(Harness::new());
    harness
        .send("POST", "/ns/slow", Some(json!({"code": "slow"})))
        .await;
    harness
        .send("POST", "/ns/other", Some(json!({"code": "other"})))
        .await;

    let slow = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.send("PUT", "/ns/slow/run", None).await.0 })
    };
    // Give the run time to reach its compile.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let (status, _, body) = harness.send("GET", "/ns/other", None).await;
    let elapsed = started.elapsed();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "other");
    assert!(elapsed < Duration::from_millis(200), "read took {:?}", elapsed);
    assert_eq!(slow.await.unwrap(), StatusCode::OK);
}

#[tokio::test]
async fn test_run_failure_carries_status() {
    let harness = Harness::new();
    harness
        .send("POST", "/ns/fn", Some(json!({"code": "boom"})))
        .await;

    let (status, _, body) = harness.send("PUT", "/ns/fn/run", None).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body, json!({"error": "upstream timed out"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_runs_compile_once() {
    let harness = Arc::new(Harness::new());
    harness
        .send("POST", "/ns/fn", Some(json!({"code": "shared"})))
        .await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let harness = harness.clone();
        tasks.spawn(async move { harness.send("PUT", "/ns/fn/run", None).await.0 });
    }
    while let Some(status) = tasks.join_next().await {
        assert_eq!(status.unwrap(), StatusCode::OK);
    }

    assert_eq!(harness.compiles(), 1);
}
