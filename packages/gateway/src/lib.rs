//! # fngate
//!
//! HTTP gateway that stores, updates and runs sandboxed functions.
//!
//! The binary starts as a [`supervisor`] that keeps a pool of [`worker`]
//! processes alive. Every worker serves the same [`router`] on a shared
//! port, backed by a code store, a compiled-script cache and a sandbox.

pub mod config;
pub mod error;
pub mod router;
pub mod schema;
pub mod signal;
pub mod supervisor;
pub mod worker;

pub use config::{Settings, StorageKind};
pub use error::{ApiError, Error};
pub use router::FunctionsRouter;
