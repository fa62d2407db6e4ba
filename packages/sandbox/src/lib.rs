//! # fngate-sandbox
//!
//! Compiles function source into an executable unit and runs it against a
//! request, in isolation from the worker that hosts it.
//!
//! The [`Sandbox`] trait is what the router depends on; [`WasmSandbox`] is
//! the production implementation, running WebAssembly text modules under
//! wasmtime with per-invocation fuel and memory limits.
//!
//! ## Guest interface
//!
//! A function is a WAT module that exports:
//!
//! - `memory`
//! - `alloc(len: i32) -> i32`, returning a buffer the host may write into
//! - `handle(ptr: i32, len: i32) -> i64`, taking the request JSON and
//!   returning the response JSON as `(ptr << 32) | len`
//!
//! and may import from `env`:
//!
//! - `log(ptr: i32, len: i32)`, written to the worker log with the run prefix
//! - `fetch(ptr: i32, len: i32) -> i64`, an outbound HTTP request; returns
//!   the packed response JSON, or `0` on failure
//!
//! The response JSON is `{"status": 200, "headers": {}, "body": null}`, every
//! field optional.

pub mod error;
pub mod traits;
pub mod wasm;

pub use error::{Error, ExecutionError, SyntaxError};
pub use traits::{FunctionResponse, RunOptions, Sandbox};
pub use wasm::{SandboxConfig, WasmSandbox, WasmScript};
