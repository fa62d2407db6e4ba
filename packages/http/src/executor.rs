//! Outbound HTTP execution.
//!
//! Functions never talk to the network directly. They hand an
//! [`HttpRequest`] to an [`HttpExecutor`], which the sandbox can swap for a
//! fake in tests.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::Error;
use crate::types::{HttpRequest, HttpResponse};

/// Trait for executing HTTP requests.
pub trait HttpExecutor: Send + Sync {
    /// Execute an HTTP request and return the response.
    ///
    /// Non-2xx statuses are responses, not errors. `Err` means the request
    /// could not be built or sent.
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, Error>;
}

/// Client-wide settings every outbound request inherits.
#[derive(Debug, Clone)]
pub struct ClientDefaults {
    pub timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: concat!("fngate/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientDefaults {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Production HTTP executor using reqwest.
///
/// Construct it outside of any async runtime; the blocking client owns a
/// runtime of its own.
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    pub fn new(defaults: &ClientDefaults) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(defaults.timeout)
            .pool_idle_timeout(defaults.pool_idle_timeout)
            .user_agent(defaults.user_agent.clone())
            .build()?;

        Ok(Self { client })
    }

    /// Create with default settings (30 second timeout).
    pub fn with_default_timeout() -> Result<Self, Error> {
        Self::new(&ClientDefaults::default())
    }
}

impl HttpExecutor for ReqwestExecutor {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let url = url::Url::parse(&request.path)?;
        let method: http::Method = request.method.into();

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            headers.insert(
                HeaderName::try_from(name.as_str())?,
                HeaderValue::try_from(value.as_str())?,
            );
        }

        let mut req_builder = self.client.request(method, url).headers(headers);

        if !request.query.is_empty() {
            req_builder = req_builder.query(&request.query);
        }

        if let Some(body) = &request.body {
            req_builder = req_builder.json(body);
        }

        let response = req_builder.send()?;

        let status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string();

        let mut resp_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                resp_headers.insert(name.to_string(), v.to_string());
            }
        }

        let body_text = response.text()?;
        let body = serde_json::from_str(&body_text).unwrap_or(serde_json::Value::Null);

        Ok(HttpResponse {
            status,
            status_text,
            headers: resp_headers,
            body,
            body_text: Some(body_text),
        })
    }
}
