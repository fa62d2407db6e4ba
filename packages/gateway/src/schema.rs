//! JSON schema for code items.

use jsonschema::Validator;
use serde_json::{json, Value};

use crate::error::Error;

/// Schema every create and update body must satisfy.
pub fn code_item_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "functions/item",
        "type": "object",
        "properties": {
            "code": { "type": "string" }
        },
        "required": ["code"]
    })
}

/// Compiled code item schema, built once per router.
pub struct CodeItemValidator {
    validator: Validator,
}

impl CodeItemValidator {
    pub fn new() -> Result<Self, Error> {
        let validator = Validator::new(&code_item_schema()).map_err(|e| Error::Schema {
            message: e.to_string(),
        })?;
        Ok(Self { validator })
    }

    /// Check an instance, returning one message per violation.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<String>> {
        let details: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();

        if details.is_empty() {
            Ok(())
        } else {
            Err(details)
        }
    }
}
