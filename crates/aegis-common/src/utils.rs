//! Shared helpers: naming, hashing, backoff arithmetic

use crate::types::ResourceRef;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// DNS-1123 label length bound.
pub const MAX_NAME_LEN: usize = 63;

/// Sanitize an arbitrary string into a DNS-1123 compliant name.
///
/// Characters outside `[a-z0-9-]` become `-`, consecutive hyphens collapse,
/// leading/trailing hyphens are stripped, and the result is truncated to 63
/// characters without leaving a trailing hyphen.
pub fn sanitize_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_NAME_LEN));
    let mut last_hyphen = true; // suppresses leading hyphens
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            out.push('-');
            last_hyphen = true;
        }
    }
    while out.len() > MAX_NAME_LEN {
        out.pop();
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Stable correlation key for a resource: truncated SHA-256 over
/// `namespace/kind/name`.
pub fn correlation_key(resource: &ResourceRef) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource.namespace.as_bytes());
    hasher.update(b"/");
    hasher.update(resource.kind.to_string().as_bytes());
    hasher.update(b"/");
    hasher.update(resource.name.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Short unique id suitable for a shadow environment name.
pub fn short_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..8].to_string()
}

/// Exponential backoff delay in milliseconds, capped at `max_delay_ms`.
pub fn exponential_backoff(attempt: u32, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> u64 {
    let delay = initial_delay_ms as f64 * multiplier.powi(attempt as i32);
    (delay as u64).min(max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;
    use proptest::prelude::*;

    #[test]
    fn sanitize_known_inputs() {
        assert_eq!(sanitize_name("Demo_API.v2"), "demo-api-v2");
        assert_eq!(sanitize_name("--already--dashed--"), "already-dashed");
        assert_eq!(sanitize_name("UPPER"), "upper");
        assert_eq!(sanitize_name("***"), "");
    }

    #[test]
    fn sanitize_truncates_without_trailing_hyphen() {
        let input = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let out = sanitize_name(&input);
        assert!(out.len() <= MAX_NAME_LEN);
        assert!(!out.ends_with('-'));
    }

    #[test]
    fn correlation_key_is_stable_and_distinct() {
        let a = ResourceRef::new("production", ResourceKind::Pod, "demo-api-7fbd");
        let b = ResourceRef::new("production", ResourceKind::Pod, "demo-api-7fbd");
        let c = ResourceRef::new("staging", ResourceKind::Pod, "demo-api-7fbd");
        assert_eq!(correlation_key(&a), correlation_key(&b));
        assert_ne!(correlation_key(&a), correlation_key(&c));
        assert_eq!(correlation_key(&a).len(), 16);
    }

    #[test]
    fn backoff_caps_at_max() {
        assert_eq!(exponential_backoff(0, 1000, 60_000, 2.0), 1000);
        assert_eq!(exponential_backoff(1, 1000, 60_000, 2.0), 2000);
        assert_eq!(exponential_backoff(10, 1000, 60_000, 2.0), 60_000);
    }

    proptest! {
        #[test]
        fn sanitized_names_are_dns1123(input in ".*") {
            let out = sanitize_name(&input);
            prop_assert!(out.len() <= MAX_NAME_LEN);
            prop_assert!(!out.contains("--"));
            if !out.is_empty() {
                let re = regex_check(&out);
                prop_assert!(re, "sanitized name '{}' not DNS-1123", out);
            }
        }
    }

    fn regex_check(s: &str) -> bool {
        let bytes = s.as_bytes();
        let ok_char = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-';
        let ok_edge = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
        ok_edge(bytes[0])
            && ok_edge(bytes[bytes.len() - 1])
            && bytes.iter().all(|&c| ok_char(c))
    }
}
