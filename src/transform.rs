//! Transformer registry
//!
//! Maps endpoint names to pure, deterministic functions that reshape raw
//! vendor payloads into the proxy's stable schema: snake_case fields become
//! camelCase and list results are wrapped as `{items, metadata: {count}}`.
//! Endpoints without a registered transformer pass through unchanged.

use crate::error::{ProxyError, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A pure payload transformation. Implementations must be deterministic:
/// the same raw body always yields the same normalized body.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;
    fn transform(&self, raw: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through transformer for unregistered endpoints
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn name(&self) -> &str {
        "identity"
    }

    fn transform(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }
}

/// Vendor-schema normalizer for one endpoint
pub struct NormalizingTransformer {
    name: String,
    /// Vendor field holding the list payload, when the endpoint returns one
    list_field: Option<&'static str>,
}

impl NormalizingTransformer {
    pub fn new(name: impl Into<String>, list_field: Option<&'static str>) -> Self {
        Self {
            name: name.into(),
            list_field,
        }
    }
}

impl Transformer for NormalizingTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ProxyError::Transform(format!("{}: invalid upstream JSON: {e}", self.name)))?;

        let normalized = normalize_keys(value);

        let items: Vec<Value> = match normalized {
            Value::Array(items) => items,
            Value::Object(mut object) => {
                let field = self.list_field.map(snake_to_camel);
                let holds_list = field
                    .as_deref()
                    .and_then(|f| object.get(f))
                    .map(Value::is_array)
                    .unwrap_or(false);
                if !holds_list {
                    // Non-list endpoint payload: normalized object as-is
                    return Ok(serde_json::to_vec(&Value::Object(object))?);
                }
                match object.remove(field.as_deref().unwrap_or_default()) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                }
            }
            other => {
                return Ok(serde_json::to_vec(&other)?);
            }
        };

        let count = items.len();
        let wrapped = json!({
            "items": items,
            "metadata": { "count": count },
        });
        Ok(serde_json::to_vec(&wrapped)?)
    }
}

/// Recursively rename snake_case object keys to camelCase
fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut out = Map::with_capacity(object.len());
            for (key, inner) in object {
                out.insert(snake_to_camel(&key), normalize_keys(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Endpoint → transformer lookup with an identity default
pub struct TransformerRegistry {
    by_endpoint: HashMap<String, Arc<dyn Transformer>>,
    default: Arc<dyn Transformer>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self {
            by_endpoint: HashMap::new(),
            default: Arc::new(IdentityTransformer),
        }
    }

    /// Registry preloaded with the supported feed endpoints
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let endpoints: [(&str, Option<&'static str>); 6] = [
            ("tournaments", Some("tournaments")),
            ("rankings", Some("rankings")),
            ("field", Some("field")),
            ("scoring", Some("scores")),
            ("player-stats", Some("players")),
            ("betting-odds", Some("odds")),
        ];
        for (endpoint, list_field) in endpoints {
            registry.register(
                endpoint,
                Arc::new(NormalizingTransformer::new(endpoint, list_field)),
            );
        }
        registry
    }

    pub fn register(&mut self, endpoint: &str, transformer: Arc<dyn Transformer>) {
        self.by_endpoint.insert(endpoint.to_string(), transformer);
    }

    /// The transformer for an endpoint; unregistered endpoints pass through.
    /// Endpoints with path segments (`scoring/live/123`) match on their first
    /// segment.
    pub fn get(&self, endpoint: &str) -> Arc<dyn Transformer> {
        if let Some(t) = self.by_endpoint.get(endpoint) {
            return Arc::clone(t);
        }
        let head = endpoint.split('/').next().unwrap_or(endpoint);
        self.by_endpoint
            .get(head)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    /// Look up a per-request transformation override by name
    pub fn lookup_override(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.by_endpoint.get(name).map(Arc::clone)
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snake_to_camel() {
        assert_eq!(snake_to_camel("event_name"), "eventName");
        assert_eq!(snake_to_camel("player_id"), "playerId");
        assert_eq!(snake_to_camel("plain"), "plain");
        assert_eq!(snake_to_camel("a_b_c"), "aBC");
    }

    #[test]
    fn test_list_payload_wrapped() {
        let t = NormalizingTransformer::new("tournaments", Some("tournaments"));
        let raw = br#"{"tournaments":[{"event_name":"The Open","start_date":"2024-07-18"}]}"#;

        let out: Value = serde_json::from_slice(&t.transform(raw).unwrap()).unwrap();
        assert_eq!(out["metadata"]["count"], 1);
        assert_eq!(out["items"][0]["eventName"], "The Open");
        assert_eq!(out["items"][0]["startDate"], "2024-07-18");
        assert!(out["items"][0].get("event_name").is_none());
    }

    #[test]
    fn test_top_level_array_wrapped() {
        let t = NormalizingTransformer::new("rankings", Some("rankings"));
        let raw = br#"[{"player_name":"A"},{"player_name":"B"}]"#;

        let out: Value = serde_json::from_slice(&t.transform(raw).unwrap()).unwrap();
        assert_eq!(out["metadata"]["count"], 2);
        assert_eq!(out["items"][1]["playerName"], "B");
    }

    #[test]
    fn test_object_payload_normalized_in_place() {
        let t = NormalizingTransformer::new("scoring", Some("scores"));
        let raw = br#"{"event_id":42,"round_state":{"current_round":3}}"#;

        let out: Value = serde_json::from_slice(&t.transform(raw).unwrap()).unwrap();
        assert_eq!(out["eventId"], 42);
        assert_eq!(out["roundState"]["currentRound"], 3);
        assert!(out.get("items").is_none());
    }

    #[test]
    fn test_deterministic() {
        let t = NormalizingTransformer::new("field", Some("field"));
        let raw = br#"{"field":[{"player_id":1},{"player_id":2}]}"#;
        assert_eq!(t.transform(raw).unwrap(), t.transform(raw).unwrap());
    }

    #[test]
    fn test_invalid_json_rejected() {
        let t = NormalizingTransformer::new("field", Some("field"));
        assert!(matches!(
            t.transform(b"not json"),
            Err(ProxyError::Transform(_))
        ));
    }

    #[test]
    fn test_registry_defaults_and_fallback() {
        let registry = TransformerRegistry::with_defaults();
        assert_eq!(registry.get("rankings").name(), "rankings");
        assert_eq!(registry.get("scoring/live/123").name(), "scoring");
        assert_eq!(registry.get("unknown-endpoint").name(), "identity");
    }

    #[test]
    fn test_identity_passthrough() {
        let registry = TransformerRegistry::with_defaults();
        let t = registry.get("unknown");
        assert_eq!(t.transform(b"anything").unwrap(), b"anything");
    }
}
