//! # fngate-http
//!
//! HTTP value types shared by the gateway and its sandbox, plus the
//! outbound client functions reach through their `fetch` capability.
//!
//! Each worker builds one [`ReqwestExecutor`] at startup from
//! [`ClientDefaults`] and shares it with every invocation, so connection
//! pooling and timeouts are configured in one place:
//!
//! ```ignore
//! use fngate_http::{ClientDefaults, HttpExecutor, HttpRequest, ReqwestExecutor};
//!
//! let executor = ReqwestExecutor::new(&ClientDefaults::default())?;
//! let response = executor.execute(&HttpRequest::get("https://example.com/status"))?;
//! assert!(response.is_success());
//! ```
//!
//! The executor is blocking: it is meant to be called from the sandbox's
//! blocking threads, never from an async task.

pub mod error;
pub mod executor;
pub mod types;

pub use error::Error;
pub use executor::{ClientDefaults, HttpExecutor, ReqwestExecutor};
pub use types::{HttpRequest, HttpResponse, Method};
