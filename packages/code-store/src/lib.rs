//! # fngate-code-store
//!
//! Storage for function code, keyed by namespace and id.
//!
//! Every stored function lives under two keys: its source code and the
//! SHA-1 digest of that code. Creating a function sets both keys or neither,
//! which gives callers an idempotent, conflict-aware create even when several
//! processes race on the same key.
//!
//! ## Store Types
//!
//! ### InMemoryCodeStore
//!
//! Process-local store, mostly useful for tests and single-process setups:
//!
//! ```ignore
//! use fngate_code_store::{CodeStore, Function, InMemoryCodeStore};
//!
//! let store = InMemoryCodeStore::new();
//! let function = Function::new("hello", "(module)");
//! let outcome = store.post_code("demo", "hello", &function).await?;
//! assert!(outcome.is_created());
//! ```
//!
//! ### LocalDiskCodeStore
//!
//! Directory-backed store. Its create and replace primitives are atomic at
//! the filesystem level, so every worker process can share one directory.
//!
//! ### ScriptCache
//!
//! Cache-aside layer that keeps one compiled artifact per function and
//! recompiles only when the stored hash moves:
//!
//! ```ignore
//! let cache = ScriptCache::new();
//! let cached = cache
//!     .get_code_by_cache(&store, "demo", "hello", |function| async move {
//!         compile(&function.code).await
//!     })
//!     .await?;
//! ```

pub mod cache;
pub mod error;
pub mod function;
pub mod in_memory;
pub mod local_disk;
pub mod traits;

pub use cache::{CachedFunction, ScriptCache};
pub use error::StoreError;
pub use function::{digest, validate_key, Function, FunctionPage, FunctionSummary};
pub use in_memory::InMemoryCodeStore;
pub use local_disk::LocalDiskCodeStore;
pub use traits::{CodeStore, PostOutcome};
