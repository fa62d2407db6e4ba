//! The stored function record and its key rules.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::StoreError;

/// Lowercase hex SHA-1 digest of a piece of code.
pub fn digest(code: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// A unit of stored code.
///
/// `hash` is always the digest of `code`; the only constructor recomputes
/// it, and stores hand out records built through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub code: String,
    pub hash: String,
}

impl Function {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        let code = code.into();
        let hash = digest(&code);
        Self {
            id: id.into(),
            code,
            hash,
        }
    }
}

/// A `(namespace, id)` pair as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub namespace: String,
    pub id: String,
}

/// One page of the namespace/function listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionPage {
    pub items: Vec<FunctionSummary>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl FunctionPage {
    /// Slice a sorted listing into the requested 1-based page.
    pub fn paginate(all: Vec<FunctionSummary>, page: usize, per_page: usize) -> Self {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        Self {
            items,
            page,
            per_page,
            total,
        }
    }
}

/// Check that a namespace or id is usable as a key component.
///
/// Besides empty names, `.`, `..` and separators, names starting with `.`
/// are rejected: the disk store keeps its temp files under dotted names and
/// leaves them out of listings.
pub fn validate_key(component: &str) -> Result<(), StoreError> {
    let invalid = |message: &str| StoreError::InvalidKey {
        component: component.to_string(),
        message: message.to_string(),
    };

    if component.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if component == "." || component == ".." {
        return Err(invalid("reserved name"));
    }
    if component.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if component.contains(['/', '\\', '\0']) {
        return Err(invalid("must not contain '/', '\\' or NUL"));
    }
    Ok(())
}
