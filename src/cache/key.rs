//! Canonical cache key construction.
//!
//! Keys have the form `<prefix>:<scope>:<hash>` where the hash is the
//! lowercase hex SHA-256 digest of a deterministic serialization of the key's
//! parameters. `serde_json` maps iterate in sorted key order, so equivalent
//! parameter sets always produce identical key strings.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash length for user-scoped keys
pub const USER_KEY_HASH_LEN: usize = 16;

/// Hash length for query keys
pub const QUERY_KEY_HASH_LEN: usize = 32;

/// Lowercase hex SHA-256 of the canonical serialization, truncated to `len`
pub fn params_hash(params: &Value, len: usize) -> String {
    let canonical = params.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(len);
    hex
}

/// User-scoped key: `<prefix>:user:<user_id>:<hash16>`
pub fn user_key(prefix: &str, user_id: &str, params: &Value) -> String {
    format!(
        "{prefix}:user:{user_id}:{}",
        params_hash(params, USER_KEY_HASH_LEN)
    )
}

/// Key for a (query, params) pair: `query:<hash32>`
pub fn query_key(query: &str, params: &Value) -> String {
    let composite = Value::from(vec![Value::from(query), params.clone()]);
    format!("query:{}", params_hash(&composite, QUERY_KEY_HASH_LEN))
}

/// Registry key for a prepared query text
pub fn statement_key(query: &str) -> String {
    params_hash(&Value::from(query), USER_KEY_HASH_LEN)
}

/// Substring that every key belonging to a user contains
pub fn user_scope_fragment(user_id: &str) -> String {
    format!(":user:{user_id}:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equivalent_params_same_key() {
        // serde_json maps are sorted, so construction order cannot matter
        let a = json!({"limit": 10, "filter": "work"});
        let b = json!({"filter": "work", "limit": 10});
        assert_eq!(user_key("memory", "u1", &a), user_key("memory", "u1", &b));
    }

    #[test]
    fn test_user_key_shape() {
        let key = user_key("memory", "u1", &json!({"id": "m1"}));
        assert!(key.starts_with("memory:user:u1:"));
        let hash = key.rsplit(':').next().unwrap();
        assert_eq!(hash.len(), USER_KEY_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_query_key_distinguishes_params() {
        let q = "SELECT * FROM memories WHERE user_id = $1";
        let a = query_key(q, &json!(["u1"]));
        let b = query_key(q, &json!(["u2"]));
        assert_ne!(a, b);
        assert_eq!(a, query_key(q, &json!(["u1"])));
        assert_eq!(a.len(), "query:".len() + QUERY_KEY_HASH_LEN);
    }

    #[test]
    fn test_scope_fragment_matches_user_keys() {
        let key = user_key("memory", "u1", &json!({"id": "m1"}));
        assert!(key.contains(&user_scope_fragment("u1")));
        assert!(!key.contains(&user_scope_fragment("u12")));
    }
}
