//! The sandbox interface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fngate_http::HttpRequest;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, SyntaxError};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Context prefix for anything the function logs, e.g.
    /// `namespace:ns, id:fn`.
    pub prefix: String,
}

impl RunOptions {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

/// What a function returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub body: serde_json::Value,
}

fn default_status() -> u16 {
    200
}

impl Default for FunctionResponse {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: serde_json::Value::Null,
        }
    }
}

/// Compiles and runs function code.
///
/// `Script` is the compiled artifact. It is cached by the router and shared
/// between concurrent runs, so it must be cheap to share across threads.
///
/// Every method that does real work is async. Callers run on a
/// single-threaded loop, so implementations move parsing, compiling and
/// execution off that thread.
#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    type Script: Send + Sync + 'static;

    /// Check `code` without executing it.
    ///
    /// # Returns
    ///
    /// * `None` - The code compiles.
    /// * `Some(err)` - Why it does not.
    async fn test_syntax_error(
        &self,
        filename: &str,
        code: &str,
        options: &RunOptions,
    ) -> Option<SyntaxError>;

    /// Compile `code` into a reusable artifact.
    async fn compile_code(&self, filename: &str, code: &str)
        -> Result<Self::Script, ExecutionError>;

    /// Run a compiled artifact against a request.
    async fn run_script(
        &self,
        script: Arc<Self::Script>,
        request: HttpRequest,
        options: &RunOptions,
    ) -> Result<FunctionResponse, ExecutionError>;
}
