//! The code store interface.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::function::{Function, FunctionPage};

/// Result of an idempotent create.
///
/// A create is genuine only when both the code key and the hash key were
/// newly set. Stores leave existing data untouched whenever either key was
/// already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostOutcome {
    pub code_created: bool,
    pub hash_created: bool,
}

impl PostOutcome {
    pub fn created() -> Self {
        Self {
            code_created: true,
            hash_created: true,
        }
    }

    pub fn is_created(&self) -> bool {
        self.code_created && self.hash_created
    }
}

/// Namespaced storage for function code.
///
/// Implementations must be safe for unsynchronized concurrent use from many
/// in-flight requests.
///
/// # Object Safety
///
/// This trait is object-safe: you can use `Arc<dyn CodeStore>`.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// List every `(namespace, id)` pair, sorted, sliced to one page.
    async fn list_functions(&self, page: usize, per_page: usize)
        -> Result<FunctionPage, StoreError>;

    /// Create code and hash under their two keys, only if neither exists.
    async fn post_code(
        &self,
        namespace: &str,
        id: &str,
        function: &Function,
    ) -> Result<PostOutcome, StoreError>;

    /// Replace code and hash, whether or not they existed.
    async fn put_code(
        &self,
        namespace: &str,
        id: &str,
        function: &Function,
    ) -> Result<(), StoreError>;

    /// Fetch a function.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - No function under this key.
    /// * `Ok(Some(function))` - The stored function.
    async fn get_code(&self, namespace: &str, id: &str) -> Result<Option<Function>, StoreError>;

    /// Remove a function. Removing a missing key succeeds.
    async fn delete_code(&self, namespace: &str, id: &str) -> Result<(), StoreError>;
}
