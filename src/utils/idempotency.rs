/// Deterministic idempotency keys
use sha2::{Digest, Sha256};

/// Hash the components into a stable hex key.
///
/// Components are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn generate_idempotency_key(components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for component in components {
        hasher.update((component.len() as u64).to_le_bytes());
        hasher.update(component.as_bytes());
    }
    let result = hasher.finalize();
    format!("{:x}", result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key() {
        let key1 = generate_idempotency_key(&["test", "WTI", "missing-data", "2025-03-10"]);
        let key2 = generate_idempotency_key(&["test", "WTI", "missing-data", "2025-03-10"]);
        let key3 = generate_idempotency_key(&["test", "WTI", "invalid-value", "2025-03-10"]);

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_component_boundaries_matter() {
        assert_ne!(
            generate_idempotency_key(&["ab", "c"]),
            generate_idempotency_key(&["a", "bc"])
        );
    }
}
