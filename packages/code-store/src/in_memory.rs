//! In-memory code store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::function::{validate_key, Function, FunctionPage, FunctionSummary};
use crate::traits::{CodeStore, PostOutcome};

type Key = (String, String);

#[derive(Default)]
struct Keys {
    code: BTreeMap<Key, Function>,
    hash: BTreeMap<Key, String>,
}

/// A process-local code store.
///
/// Code and hash are kept under separate keys, mirroring the layout of the
/// shared stores, and every operation runs under a single lock so a create
/// is atomic with respect to concurrent callers.
///
/// # Example
///
/// ```ignore
/// use fngate_code_store::{CodeStore, Function, InMemoryCodeStore};
///
/// let store = InMemoryCodeStore::new();
/// let function = Function::new("hello", "(module)");
/// assert!(store.post_code("demo", "hello", &function).await?.is_created());
/// assert!(!store.post_code("demo", "hello", &function).await?.is_created());
/// ```
#[derive(Default)]
pub struct InMemoryCodeStore {
    keys: Mutex<Keys>,
}

impl InMemoryCodeStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored functions.
    pub fn len(&self) -> usize {
        self.keys.lock().map(|keys| keys.code.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(namespace: &str, id: &str) -> Result<Key, StoreError> {
        validate_key(namespace)?;
        validate_key(id)?;
        Ok((namespace.to_string(), id.to_string()))
    }
}

#[async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn list_functions(
        &self,
        page: usize,
        per_page: usize,
    ) -> Result<FunctionPage, StoreError> {
        let keys = self.keys.lock().map_err(|_| StoreError::Poisoned)?;
        let all = keys
            .code
            .keys()
            .map(|(namespace, id)| FunctionSummary {
                namespace: namespace.clone(),
                id: id.clone(),
            })
            .collect();
        Ok(FunctionPage::paginate(all, page, per_page))
    }

    async fn post_code(
        &self,
        namespace: &str,
        id: &str,
        function: &Function,
    ) -> Result<PostOutcome, StoreError> {
        let key = Self::key(namespace, id)?;
        let mut keys = self.keys.lock().map_err(|_| StoreError::Poisoned)?;

        let outcome = PostOutcome {
            code_created: !keys.code.contains_key(&key),
            hash_created: !keys.hash.contains_key(&key),
        };

        if outcome.is_created() {
            keys.hash.insert(key.clone(), function.hash.clone());
            keys.code.insert(key, function.clone());
        }
        Ok(outcome)
    }

    async fn put_code(
        &self,
        namespace: &str,
        id: &str,
        function: &Function,
    ) -> Result<(), StoreError> {
        let key = Self::key(namespace, id)?;
        let mut keys = self.keys.lock().map_err(|_| StoreError::Poisoned)?;
        keys.hash.insert(key.clone(), function.hash.clone());
        keys.code.insert(key, function.clone());
        Ok(())
    }

    async fn get_code(&self, namespace: &str, id: &str) -> Result<Option<Function>, StoreError> {
        let key = Self::key(namespace, id)?;
        let keys = self.keys.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(keys.code.get(&key).cloned())
    }

    async fn delete_code(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let key = Self::key(namespace, id)?;
        let mut keys = self.keys.lock().map_err(|_| StoreError::Poisoned)?;
        keys.code.remove(&key);
        keys.hash.remove(&key);
        Ok(())
    }
}
