//! Capability registry
//!
//! Named, schema-described operations the reasoning collaborator may invoke
//! during a turn. The registry validates arguments against each capability's
//! JSON schema before the handler ever runs, and holds no conversation state.

pub mod github;

pub use github::{register_code_search, CodeHit, CodeSearch, GithubCodeSearch};

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Name, description and JSON-schema parameters advertised for a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl CapabilitySchema {
    /// A capability that takes no arguments
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Executes one capability once its arguments have been validated
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, EngineError>;
}

struct Registered {
    schema: CapabilitySchema,
    handler: Arc<dyn CapabilityHandler>,
}

/// Name → (schema, handler) table shared by all conversations
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Arc<Registered>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under `schema.name`. A later registration with
    /// the same name replaces the earlier one.
    pub fn register(&self, schema: CapabilitySchema, handler: Arc<dyn CapabilityHandler>) {
        let name = schema.name.clone();
        let entry = Arc::new(Registered { schema, handler });

        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.insert(name.clone(), entry).is_some() {
            warn!("Capability '{}' re-registered, previous handler replaced", name);
        } else {
            debug!("Registered capability '{}'", name);
        }
    }

    /// Validate `arguments` and run the named capability.
    ///
    /// - unknown name: `UnknownCapability`, nothing runs
    /// - schema violation: `InvalidArguments`, handler not called
    /// - handler failure: tagged `CapabilityExecution`; timeouts and network
    ///   failures keep their own variant so they stay retryable
    pub async fn invoke(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, EngineError> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| EngineError::UnknownCapability(name.to_string()))?;

        validate_arguments(&entry.schema.parameters, arguments).map_err(|reason| {
            EngineError::InvalidArguments {
                capability: name.to_string(),
                reason,
            }
        })?;

        debug!("Invoking capability '{}'", name);
        entry.handler.call(arguments).await.map_err(|e| match e {
            EngineError::CapabilityExecution { .. }
            | EngineError::Timeout { .. }
            | EngineError::Network(_)
            | EngineError::RateLimited(_) => e,
            other => EngineError::capability(name, other),
        })
    }

    /// Schemas of every registered capability, sorted by name
    pub fn schemas(&self) -> Vec<CapabilitySchema> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut schemas: Vec<CapabilitySchema> =
            entries.values().map(|e| e.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<Arc<Registered>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(name).cloned()
    }
}

/// Check `arguments` against the JSON-schema subset capabilities use:
/// `required`, `properties.*.type` and `additionalProperties: false`.
pub fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<(), String> {
    if let Some(kind) = schema.get("type").and_then(Value::as_str) {
        if kind != "object" {
            return Err(format!("unsupported schema type '{kind}'"));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match arguments.get(key) {
                None | Some(Value::Null) => return Err(format!("missing required argument '{key}'")),
                Some(_) => {}
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in arguments {
        let Some(property) = properties.and_then(|p| p.get(key)) else {
            if closed {
                return Err(format!("unexpected argument '{key}'"));
            }
            continue;
        };

        let allowed: Vec<&str> = match property.get("type") {
            Some(Value::String(t)) => vec![t.as_str()],
            Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
            _ => continue,
        };
        if !allowed.iter().any(|t| type_matches(t, value)) {
            return Err(format!(
                "argument '{key}' must be of type {}",
                allowed.join(" or ")
            ));
        }

        if let Some(choices) = property.get("enum").and_then(Value::as_array) {
            if !choices.contains(value) {
                return Err(format!("argument '{key}' is not one of the allowed values"));
            }
        }
    }

    Ok(())
}

fn type_matches(kind: &str, value: &Value) -> bool {
    match kind {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => false,
    }
}
