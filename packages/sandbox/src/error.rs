use serde::{Deserialize, Serialize};

/// Failure to set up the sandbox itself.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to configure engine: {message}")]
    Engine { message: String },

    #[error("Failed to register host function '{name}': {message}")]
    HostFunction { name: String, message: String },
}

/// Submitted code does not compile.
///
/// Serializes to the same `{error, details}` shape as schema validation
/// failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxError {
    pub error: String,
    pub details: Vec<String>,
}

impl SyntaxError {
    pub fn new(filename: &str, message: impl Into<String>) -> Self {
        Self {
            error: format!("Syntax error in {}", filename),
            details: vec![message.into()],
        }
    }
}

/// A compile or run failure.
///
/// `status` is the HTTP status the failure should surface as; `None` means
/// a plain internal error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub status: Option<u16>,
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Status to answer with, defaulting to 500.
    pub fn status_or_default(&self) -> u16 {
        self.status.unwrap_or(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_shape() {
        let err = SyntaxError::new("ns/fn.js", "unexpected token");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "Syntax error in ns/fn.js");
        assert_eq!(json["details"][0], "unexpected token");
    }

    #[test]
    fn execution_error_status_defaults_to_500() {
        assert_eq!(ExecutionError::new("boom").status_or_default(), 500);
        assert_eq!(
            ExecutionError::with_status(408, "slow").status_or_default(),
            408
        );
        assert_eq!(ExecutionError::new("boom").to_string(), "boom");
    }
}
