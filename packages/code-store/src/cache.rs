//! Cache-aside layer for compiled scripts.
//!
//! Compiling a function is far more expensive than reading it, so each
//! process keeps the compiled artifact next to the hash it was built from.
//! A read goes to the store first (the store stays the source of truth, and
//! other processes may have replaced the code), then reuses the artifact if
//! the hash still matches. A miss compiles through a per-entry `OnceCell`,
//! which makes concurrent callers on a cold entry share a single compile.
//! The compile is awaited, so a slow one never holds up other tasks on the
//! same thread.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::StoreError;
use crate::function::Function;
use crate::traits::CodeStore;

type Key = (String, String);

struct Slot<A> {
    hash: String,
    script: OnceCell<Arc<A>>,
}

/// A function together with its compiled artifact.
pub struct CachedFunction<A> {
    pub function: Function,
    pub script: Arc<A>,
}

/// Per-process cache of compiled artifacts keyed by `(namespace, id)`.
pub struct ScriptCache<A> {
    slots: Mutex<HashMap<Key, Arc<Slot<A>>>>,
}

impl<A> Default for ScriptCache<A> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<A: Send + Sync + 'static> ScriptCache<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a function through the cache.
    ///
    /// `pre_cache` runs at most once per stored hash in this process, and
    /// only when the function exists. It is handed a copy of the function
    /// and returns the future that builds the artifact.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - The function does not exist; `pre_cache` was not called.
    /// * `Ok(Some(cached))` - The function and its (possibly fresh) artifact.
    /// * `Err(e)` - The store failed, or `pre_cache` returned an error.
    pub async fn get_code_by_cache<S, F, Fut, E>(
        &self,
        store: &S,
        namespace: &str,
        id: &str,
        pre_cache: F,
    ) -> Result<Option<CachedFunction<A>>, E>
    where
        S: CodeStore + ?Sized,
        F: FnOnce(Function) -> Fut + Send,
        Fut: Future<Output = Result<A, E>> + Send,
        E: From<StoreError> + Send,
    {
        let Some(function) = store.get_code(namespace, id).await? else {
            self.invalidate(namespace, id)?;
            return Ok(None);
        };

        let slot = self.slot_for(namespace, id, &function.hash)?;
        let source = function.clone();
        let script = slot
            .script
            .get_or_try_init(move || async move { pre_cache(source).await.map(Arc::new) })
            .await?
            .clone();

        Ok(Some(CachedFunction { function, script }))
    }

    /// Drop the cached artifact for a key.
    pub fn invalidate(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().map_err(|_| StoreError::Poisoned)?;
        slots.remove(&(namespace.to_string(), id.to_string()));
        Ok(())
    }

    /// Number of keys with a cache slot.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_for(&self, namespace: &str, id: &str, hash: &str) -> Result<Arc<Slot<A>>, StoreError> {
        let mut slots = self.slots.lock().map_err(|_| StoreError::Poisoned)?;
        let key = (namespace.to_string(), id.to_string());

        match slots.get(&key) {
            Some(slot) if slot.hash == hash => Ok(slot.clone()),
            _ => {
                let slot = Arc::new(Slot {
                    hash: hash.to_string(),
                    script: OnceCell::new(),
                });
                slots.insert(key, slot.clone());
                Ok(slot)
            }
        }
    }
}
