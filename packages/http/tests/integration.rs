use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fngate_http::{ClientDefaults, HttpExecutor, HttpRequest, HttpResponse, ReqwestExecutor};

/// Run a request on a blocking thread, as the sandbox does.
async fn execute(request: HttpRequest) -> HttpResponse {
    tokio::task::spawn_blocking(move || {
        let executor = ReqwestExecutor::with_default_timeout().unwrap();
        executor.execute(&request).unwrap()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_get_parses_json_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users/123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 123})))
        .mount(&server)
        .await;

    let response = execute(HttpRequest::get(format!("{}/users/123", server.uri()))).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.body, json!({"id": 123}));
}

#[tokio::test]
async fn test_post_sends_json_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/items"))
        .and(body_json(json!({"name": "widget"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let request =
        HttpRequest::post(format!("{}/items", server.uri())).with_json_body(json!({"name": "widget"}));
    let response = execute(request).await;

    assert_eq!(response.status, 201);
    assert!(response.is_success());
}

#[tokio::test]
async fn test_headers_and_query_are_forwarded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(header("authorization", "Bearer token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("found"))
        .expect(1)
        .mount(&server)
        .await;

    let request = HttpRequest::get(format!("{}/search", server.uri()))
        .with_query("q", "rust")
        .with_header("Authorization", "Bearer token");
    let response = execute(request).await;

    assert_eq!(response.status, 200);
    // Non-JSON bodies only show up as text.
    assert_eq!(response.body, serde_json::Value::Null);
    assert_eq!(response.body_text.as_deref(), Some("found"));
}

#[tokio::test]
async fn test_user_agent_comes_from_defaults() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(header("user-agent", "fngate-test/1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let response = tokio::task::spawn_blocking(move || {
        let defaults = ClientDefaults {
            user_agent: "fngate-test/1".to_string(),
            ..ClientDefaults::default()
        };
        ReqwestExecutor::new(&defaults)
            .unwrap()
            .execute(&HttpRequest::get(uri))
            .unwrap()
    })
    .await
    .unwrap();

    assert_eq!(response.status, 204);
}

#[tokio::test]
async fn test_error_status_is_a_response() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Not found"})))
        .mount(&server)
        .await;

    let response = execute(HttpRequest::delete(format!("{}/gone", server.uri()))).await;

    assert_eq!(response.status, 404);
    assert!(response.is_client_error());
    assert_eq!(response.body["error"], "Not found");
}

#[tokio::test]
async fn test_timeout_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(2)))
        .mount(&server)
        .await;

    let uri = server.uri();
    let result = tokio::task::spawn_blocking(move || {
        let defaults =
            ClientDefaults::default().with_timeout(std::time::Duration::from_millis(100));
        ReqwestExecutor::new(&defaults)
            .unwrap()
            .execute(&HttpRequest::get(uri))
    })
    .await
    .unwrap();

    assert!(matches!(result, Err(fngate_http::Error::Http(_))));
}
