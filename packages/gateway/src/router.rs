//! HTTP surface for managing and running functions.
//!
//! ## Endpoints
//!
//! - `GET /` - List namespaces and their functions, paginated
//! - `POST /:namespace/:id` - Create a function; conflicts if it exists
//! - `PUT /:namespace/:id` - Create or replace a function
//! - `GET /:namespace/:id` - Read a function
//! - `DELETE /:namespace/:id` - Delete a function
//! - `PUT /:namespace/:id/run` - Run a function against the request
//!
//! Create and update share one pipeline: schema check, then syntax check,
//! then the store. Nothing is written unless both checks pass.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use fngate_code_store::{CodeStore, Function, FunctionPage, ScriptCache};
use fngate_http::HttpRequest;
use fngate_metrics::MetricEmitter;
use fngate_sandbox::{FunctionResponse, RunOptions, Sandbox};
use serde_json::Value;

use crate::error::{ApiError, Error};
use crate::schema::CodeItemValidator;

const DEFAULT_PAGE: usize = 1;
const DEFAULT_PER_PAGE: usize = 10;
const MAX_PER_PAGE: usize = 100;

/// Source name handed to the sandbox for a function.
pub fn code_filename(namespace: &str, id: &str) -> String {
    format!("{}/{}.js", namespace, id)
}

/// Context prefix for everything logged about a function.
pub fn log_prefix(namespace: &str, id: &str) -> String {
    format!("namespace:{}, id:{}", namespace, id)
}

/// Router state: the store, the sandbox and what sits between them.
pub struct FunctionsRouter<S: Sandbox> {
    store: Arc<dyn CodeStore>,
    cache: ScriptCache<S::Script>,
    sandbox: Arc<S>,
    metrics: Arc<MetricEmitter>,
    validator: CodeItemValidator,
}

impl<S: Sandbox> FunctionsRouter<S> {
    pub fn new(
        store: Arc<dyn CodeStore>,
        sandbox: Arc<S>,
        metrics: Arc<MetricEmitter>,
    ) -> Result<Self, Error> {
        Ok(Self {
            store,
            cache: ScriptCache::new(),
            sandbox,
            metrics,
            validator: CodeItemValidator::new()?,
        })
    }

    /// Build the axum router serving this state.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/", get(list_functions::<S>))
            .route(
                "/:namespace/:id",
                get(get_function::<S>)
                    .post(create_function::<S>)
                    .put(update_function::<S>)
                    .delete(delete_function::<S>),
            )
            .route("/:namespace/:id/run", put(run_function::<S>))
            .with_state(Arc::new(self))
    }

    /// Schema check, syntax check, then the function to store.
    async fn checked_function(
        &self,
        namespace: &str,
        id: &str,
        body: &[u8],
    ) -> Result<Function, ApiError> {
        let instance: Value = serde_json::from_slice(body).map_err(|e| ApiError::Validation {
            details: vec![format!("body is not valid JSON: {}", e)],
        })?;
        self.validator
            .validate(&instance)
            .map_err(|details| ApiError::Validation { details })?;

        // The schema guarantees a string here.
        let code = instance["code"].as_str().unwrap_or_default();
        let options = RunOptions::with_prefix(log_prefix(namespace, id));
        if let Some(invalid) = self
            .sandbox
            .test_syntax_error(&code_filename(namespace, id), code, &options)
            .await
        {
            return Err(ApiError::Syntax(invalid));
        }

        Ok(Function::new(id, code))
    }

    /// Cache-aside read, then run.
    pub async fn run(
        &self,
        namespace: &str,
        id: &str,
        request: HttpRequest,
    ) -> Result<FunctionResponse, ApiError> {
        let filename = code_filename(namespace, id);
        let sandbox = self.sandbox.clone();

        let cached = self
            .cache
            .get_code_by_cache(&*self.store, namespace, id, move |function| async move {
                sandbox
                    .compile_code(&filename, &function.code)
                    .await
                    .map_err(ApiError::from)
            })
            .await?;

        let Some(cached) = cached else {
            return Err(ApiError::NotFound(format!(
                "Code '{}/{}' is not found",
                namespace, id
            )));
        };

        let options = RunOptions::with_prefix(log_prefix(namespace, id));
        Ok(self
            .sandbox
            .run_script(cached.script, request, &options)
            .await?)
    }
}

type RouterState<S> = State<Arc<FunctionsRouter<S>>>;

fn parse_positive(
    params: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ApiError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(|n| n.max(1) as usize)
            .map_err(|_| ApiError::InvalidQuery(format!("{} must be an integer", name))),
    }
}

async fn list_functions<S: Sandbox>(
    State(router): RouterState<S>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<FunctionPage>, ApiError> {
    let page = parse_positive(&params, "page", DEFAULT_PAGE)?;
    let per_page = parse_positive(&params, "perPage", DEFAULT_PER_PAGE)?.min(MAX_PER_PAGE);

    let list = router
        .store
        .list_functions(page, per_page)
        .await
        .map_err(ApiError::from)
        .inspect_err(|e| e.log("", "Error listing namespaces and their functions"))?;
    Ok(Json(list))
}

async fn create_function<S: Sandbox>(
    State(router): RouterState<S>,
    Path((namespace, id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let prefix = log_prefix(&namespace, &id);
    let result = async {
        let function = router.checked_function(&namespace, &id, &body).await?;
        let outcome = router.store.post_code(&namespace, &id, &function).await?;
        if !outcome.is_created() {
            return Err(ApiError::Conflict {
                namespace: namespace.clone(),
                id: id.clone(),
            });
        }
        Ok::<_, ApiError>(function)
    }
    .await
    .inspect_err(|e| e.log(&prefix, "Failed to post code"))?;

    tracing::info!(prefix = %prefix, hash = %result.hash, "Function created");
    Ok(item_response(result))
}

async fn update_function<S: Sandbox>(
    State(router): RouterState<S>,
    Path((namespace, id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let prefix = log_prefix(&namespace, &id);
    let result = async {
        let function = router.checked_function(&namespace, &id, &body).await?;
        router.store.put_code(&namespace, &id, &function).await?;
        router.cache.invalidate(&namespace, &id)?;
        Ok::<_, ApiError>(function)
    }
    .await
    .inspect_err(|e| e.log(&prefix, "Failed to put code"))?;

    tracing::info!(prefix = %prefix, hash = %result.hash, "Function updated");
    Ok(item_response(result))
}

async fn get_function<S: Sandbox>(
    State(router): RouterState<S>,
    Path((namespace, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let prefix = log_prefix(&namespace, &id);
    let function = router
        .store
        .get_code(&namespace, &id)
        .await
        .map_err(ApiError::from)
        .and_then(|found| found.ok_or_else(|| ApiError::NotFound("Code not found".to_string())))
        .inspect_err(|e| e.log(&prefix, "Failed to get code"))?;

    Ok(item_response(function))
}

async fn delete_function<S: Sandbox>(
    State(router): RouterState<S>,
    Path((namespace, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let prefix = log_prefix(&namespace, &id);
    async {
        router.store.delete_code(&namespace, &id).await?;
        router.cache.invalidate(&namespace, &id)?;
        Ok::<_, ApiError>(())
    }
    .await
    .inspect_err(|e| e.log(&prefix, "Failed to delete code"))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn run_function<S: Sandbox>(
    State(router): RouterState<S>,
    Path((namespace, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let prefix = log_prefix(&namespace, &id);
    let request = match inbound_request(&method, &uri, query, &headers, &body) {
        Ok(request) => request,
        Err(e) => {
            e.log(&prefix, "Failed to run function");
            return e.into_response();
        }
    };

    let metric = router.metrics.start("function-run");
    let result = router.run(&namespace, &id, request).await;

    let status = match &result {
        Ok(response) => response.status,
        Err(e) => e.status().as_u16(),
    };
    let mut extra = serde_json::Map::new();
    extra.insert("namespace".to_string(), Value::from(namespace.as_str()));
    extra.insert("id".to_string(), Value::from(id.as_str()));
    extra.insert("status".to_string(), Value::from(status));
    metric.finish(Some(extra));

    match result {
        Ok(response) => function_response(&prefix, response),
        Err(e) => {
            e.log(&prefix, "Failed to run function");
            e.into_response()
        }
    }
}

fn inbound_request(
    method: &Method,
    uri: &Uri,
    query: HashMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<HttpRequest, ApiError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| ApiError::InvalidBody("Request body must be UTF-8 text".to_string()))?;

    let mut request = HttpRequest {
        method: method.into(),
        path: uri.path().to_string(),
        query,
        ..HttpRequest::default()
    };
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request.headers.insert(name.to_string(), value.to_string());
        }
    }
    Ok(request.with_raw_body(text))
}

fn item_response(function: Function) -> Response {
    (
        StatusCode::OK,
        [(header::ETAG, function.hash.clone())],
        Json(function),
    )
        .into_response()
}

/// Turn a function's result into the HTTP response, the way a string,
/// `null` or any other JSON body would be sent.
fn function_response(prefix: &str, response: FunctionResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        tracing::warn!(prefix, status = response.status, "Function returned an invalid status");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        let parsed = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        );
        match parsed {
            // Framing belongs to the server.
            (Ok(name), _) if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING => {}
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(prefix, header = %name, "Skipping invalid header from function"),
        }
    }

    let (body, content_type) = match response.body {
        Value::Null => (Body::empty(), None),
        Value::String(text) => (Body::from(text), Some("text/html; charset=utf-8")),
        other => (Body::from(other.to_string()), Some("application/json")),
    };
    if let Some(content_type) = content_type {
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
    }

    (status, headers, body).into_response()
}
