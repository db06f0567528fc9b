//! Embedded JSON Schema for module specs

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::LoadError;

/// Schema source, Draft 7
pub const MODULE_SPEC_SCHEMA: &str = include_str!("module_spec_schema.json");

static VALIDATOR: Lazy<Result<JSONSchema, String>> = Lazy::new(|| {
    let schema: Value = serde_json::from_str(MODULE_SPEC_SCHEMA).map_err(|e| e.to_string())?;
    JSONSchema::compile(&schema).map_err(|e| e.to_string())
});

/// Check a parsed spec document against the schema
///
/// # Errors
///
/// Returns [`LoadError::Spec`] joining every violation, each prefixed with
/// its JSON pointer.
pub(crate) fn check(spec: &Value) -> Result<(), LoadError> {
    let validator = VALIDATOR
        .as_ref()
        .map_err(|e| LoadError::Spec(format!("embedded schema does not compile: {e}")))?;
    if let Err(errors) = validator.validate(spec) {
        let messages: Vec<String> = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path}: {error}")
                }
            })
            .collect();
        return Err(LoadError::Spec(messages.join("; ")));
    }
    Ok(())
}
