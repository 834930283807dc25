use std::collections::HashMap;

use jsonschema::Validator;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SchemaError};

/// Endpoint-keyed registry of compiled datatype validators.
///
/// Endpoints without a datatype accept anything.
#[derive(Default)]
pub struct SchemaRegistry {
    validators: HashMap<String, Validator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a datatype for `endpoint` from a JSON string.
    pub fn register(&mut self, endpoint: &str, schema_json: &str) -> Result<()> {
        let schema: Value = serde_json::from_str(schema_json)?;
        self.register_value(endpoint, &schema)
    }

    /// Register a datatype for `endpoint` from a parsed schema.
    pub fn register_value(&mut self, endpoint: &str, schema: &Value) -> Result<()> {
        let compiled =
            jsonschema::validator_for(schema).map_err(|err| SchemaError::CompileFailed {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })?;
        debug!(endpoint, "datatype registered");
        self.validators.insert(endpoint.to_string(), compiled);
        Ok(())
    }

    /// Validate a JSON payload against `endpoint`'s datatype.
    pub fn validate(&self, endpoint: &str, payload: &[u8]) -> Result<()> {
        if !self.has_schema(endpoint) {
            return Ok(());
        }
        let value: Value = serde_json::from_slice(payload)?;
        self.validate_value(endpoint, &value)
    }

    /// Validate an already-parsed value against `endpoint`'s datatype.
    pub fn validate_value(&self, endpoint: &str, value: &Value) -> Result<()> {
        let Some(validator) = self.validators.get(endpoint) else {
            return Ok(());
        };

        let mut errors = validator.iter_errors(value);
        if let Some(first) = errors.next() {
            let mut message = first.to_string();
            for err in errors.take(3) {
                message.push_str("; ");
                message.push_str(&err.to_string());
            }
            return Err(SchemaError::ValidationFailed {
                endpoint: endpoint.to_string(),
                message,
            });
        }
        Ok(())
    }

    pub fn has_schema(&self, endpoint: &str) -> bool {
        self.validators.contains_key(endpoint)
    }

    /// Endpoints with a registered datatype, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.validators.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const RATE_SCHEMA: &str = r#"{
        "type": "object",
        "properties": {
            "InputMassRate": { "type": "number" },
            "OuputMassRate": { "type": "number" }
        },
        "required": ["InputMassRate"]
    }"#;

    #[test]
    fn register_and_validate() {
        let mut registry = SchemaRegistry::new();
        registry.register("B_in", RATE_SCHEMA).unwrap();

        assert!(registry.validate("B_in", br#"{"InputMassRate": 50.0}"#).is_ok());
        assert!(matches!(
            registry.validate("B_in", br#"{"InputMassRate": "fifty"}"#),
            Err(SchemaError::ValidationFailed { endpoint, .. }) if endpoint == "B_in"
        ));
    }

    #[test]
    fn validate_parsed_value() {
        let mut registry = SchemaRegistry::new();
        registry.register("B_in", RATE_SCHEMA).unwrap();

        assert!(registry
            .validate_value("B_in", &json!({"InputMassRate": 1}))
            .is_ok());
        assert!(registry.validate_value("B_in", &json!({})).is_err());
    }

    #[test]
    fn endpoints_are_independent() {
        let mut registry = SchemaRegistry::new();
        registry
            .register("flag", r#"{"type":"boolean"}"#)
            .unwrap();
        registry.register("rate", RATE_SCHEMA).unwrap();

        assert!(registry.validate("flag", b"true").is_ok());
        assert!(registry.validate("flag", br#"{"InputMassRate":1}"#).is_err());
        assert_eq!(registry.endpoints(), vec!["flag", "rate"]);
    }

    #[test]
    fn endpoints_without_datatype_accept_anything() {
        let registry = SchemaRegistry::new();
        assert!(registry.validate("anything", b"not even json").is_ok());
    }

    #[test]
    fn invalid_json_payload_fails() {
        let mut registry = SchemaRegistry::new();
        registry.register("B_in", RATE_SCHEMA).unwrap();
        assert!(matches!(
            registry.validate("B_in", b"not-json"),
            Err(SchemaError::InvalidJson(_))
        ));
    }

    #[test]
    fn invalid_schema_fails_compile() {
        let mut registry = SchemaRegistry::new();
        assert!(matches!(
            registry.register("bad", r#"{"type":"definitely-not-a-type"}"#),
            Err(SchemaError::CompileFailed { .. })
        ));
    }
}
