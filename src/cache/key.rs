//! Deterministic cache key derivation
//!
//! Keys are `endpoint:<sha256 prefix>` over the endpoint and its parameters
//! sorted by name, so identical logical requests hash identically regardless
//! of input order. Credential-bearing parameters and `_`-prefixed control
//! parameters never reach the hash.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Lowercased parameter names excluded from key derivation
const SENSITIVE_PARAMS: &[&str] = &[
    "key",
    "api_key",
    "apikey",
    "token",
    "access_token",
    "secret",
    "client_secret",
    "password",
    "auth",
];

fn is_excluded(name: &str) -> bool {
    name.starts_with('_') || SENSITIVE_PARAMS.contains(&name.to_ascii_lowercase().as_str())
}

/// Derive the cache key for an endpoint and parameter set
pub fn derive_cache_key(endpoint: &str, params: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&str, &str)> = params
        .iter()
        .filter(|(name, _)| !is_excluded(name))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    // Stable, case-sensitive ordering by parameter name
    pairs.sort();

    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    for (name, value) in pairs {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{endpoint}:{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_order_independent() {
        let a = params(&[("season", "2024"), ("tour", "pga")]);
        let b = params(&[("tour", "pga"), ("season", "2024")]);
        assert_eq!(
            derive_cache_key("tournaments", &a),
            derive_cache_key("tournaments", &b)
        );
    }

    #[test]
    fn test_sensitive_params_ignored() {
        let without = params(&[("season", "2024")]);
        let with_key = params(&[("season", "2024"), ("key", "sk-secret-1")]);
        let other_key = params(&[("season", "2024"), ("key", "sk-secret-2")]);
        let with_token = params(&[("season", "2024"), ("TOKEN", "abc")]);

        let base = derive_cache_key("tournaments", &without);
        assert_eq!(base, derive_cache_key("tournaments", &with_key));
        assert_eq!(base, derive_cache_key("tournaments", &other_key));
        assert_eq!(base, derive_cache_key("tournaments", &with_token));
    }

    #[test]
    fn test_control_params_ignored() {
        let plain = params(&[("season", "2024")]);
        let with_control = params(&[("season", "2024"), ("_cache_override", "true")]);
        assert_eq!(
            derive_cache_key("tournaments", &plain),
            derive_cache_key("tournaments", &with_control)
        );
    }

    #[test]
    fn test_distinct_values_hash_differently() {
        let a = params(&[("season", "2024")]);
        let b = params(&[("season", "2025")]);
        assert_ne!(
            derive_cache_key("tournaments", &a),
            derive_cache_key("tournaments", &b)
        );
    }

    #[test]
    fn test_endpoint_prefix_present() {
        let key = derive_cache_key("rankings", &HashMap::new());
        assert!(key.starts_with("rankings:"));
    }

    #[test]
    fn test_param_names_case_sensitive() {
        let lower = params(&[("season", "2024")]);
        let upper = params(&[("Season", "2024")]);
        assert_ne!(
            derive_cache_key("tournaments", &lower),
            derive_cache_key("tournaments", &upper)
        );
    }
}
