use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::GET => http::Method::GET,
            Method::POST => http::Method::POST,
            Method::PUT => http::Method::PUT,
            Method::DELETE => http::Method::DELETE,
            Method::PATCH => http::Method::PATCH,
            Method::HEAD => http::Method::HEAD,
            Method::OPTIONS => http::Method::OPTIONS,
        }
    }
}

impl From<&http::Method> for Method {
    fn from(method: &http::Method) -> Self {
        match *method {
            http::Method::POST => Method::POST,
            http::Method::PUT => Method::PUT,
            http::Method::DELETE => Method::DELETE,
            http::Method::PATCH => Method::PATCH,
            http::Method::HEAD => Method::HEAD,
            http::Method::OPTIONS => Method::OPTIONS,
            // CONNECT, TRACE and extensions are never routed to functions.
            _ => Method::GET,
        }
    }
}

/// An HTTP request as seen by a function.
///
/// The router hands one of these to every invocation, and functions build
/// one when they call out through `fetch`. For outbound requests `path`
/// must be an absolute URL.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HttpRequest {
    #[serde(default)]
    pub method: Method,

    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Parsed JSON body. Inbound bodies that are not JSON arrive as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self {
            method: Method::PUT,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach a raw body, keeping it as JSON when it parses and as a string
    /// otherwise. An empty body is no body.
    pub fn with_raw_body(mut self, raw: &str) -> Self {
        if raw.is_empty() {
            self.body = None;
            return self;
        }
        self.body = Some(
            serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        );
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }
}

/// HTTP response returned by the outbound client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpResponse {
    pub status: u16,

    /// Status text (e.g., "OK", "Not Found")
    pub status_text: String,

    pub headers: HashMap<String, String>,

    /// Response body as JSON value.
    /// Null if the body was empty or not valid JSON.
    pub body: serde_json::Value,

    /// Raw body, for responses that aren't JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
}

impl HttpResponse {
    /// Check if the response status indicates success (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_body_prefers_json() {
        let request = HttpRequest::post("/").with_raw_body(r#"{"a":1}"#);
        assert_eq!(request.body, Some(json!({"a": 1})));

        let request = HttpRequest::post("/").with_raw_body("plain text");
        assert_eq!(request.body, Some(json!("plain text")));

        let request = HttpRequest::post("/").with_raw_body("");
        assert_eq!(request.body, None);
    }

    #[test]
    fn request_omits_empty_fields() {
        let json = serde_json::to_value(HttpRequest::get("/x")).unwrap();
        assert_eq!(json, json!({"method": "GET", "path": "/x"}));
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: HttpRequest = serde_json::from_value(json!({"path": "http://h/"})).unwrap();
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.is_empty());
        assert!(request.body.is_none());
    }

    #[test]
    fn methods_convert_from_http() {
        assert_eq!(Method::from(&http::Method::PUT), Method::PUT);
        assert_eq!(Method::from(&http::Method::TRACE), Method::GET);
        assert_eq!(http::Method::from(Method::PATCH), http::Method::PATCH);
    }

    #[test]
    fn status_classes() {
        let mut response = HttpResponse {
            status: 204,
            status_text: "No Content".to_string(),
            headers: HashMap::new(),
            body: serde_json::Value::Null,
            body_text: None,
        };
        assert!(response.is_success());
        response.status = 404;
        assert!(response.is_client_error());
        response.status = 503;
        assert!(response.is_server_error());
    }
}
