//! Canonical workload identities
//!
//! An identity is the label value that ties artifacts back to the
//! ClientIntents that produced them, and that ties pods to the logical
//! service they implement. It is derived from (service name, namespace) and
//! never stored anywhere else.

use crate::kube_utils::{sha256_hex, trim_to_boundary, MAX_LABEL_VALUE_LEN};

/// Maximum bytes of the service name kept in the readable prefix
const NAME_PART_LEN: usize = 20;
/// Maximum bytes of the namespace kept in the readable prefix
const NAMESPACE_PART_LEN: usize = 20;
/// Hex characters of the content hash appended to every identity (80 bits)
const HASH_LEN: usize = 20;

/// Format the canonical identity for a service in a namespace.
///
/// The result is `<name>-<namespace>-<hash>` with name and namespace cut to
/// 20 bytes each. The hash covers the full, untruncated pair, so two
/// services whose readable prefixes collide (or whose names split
/// differently around a `-`) still get distinct identities. The output is a
/// valid label value of at most 62 characters.
pub fn format_identity(name: &str, namespace: &str) -> String {
    let hash = sha256_hex(&format!("{name}\0{namespace}"));
    let name_part = readable_part(name, NAME_PART_LEN);
    let namespace_part = readable_part(namespace, NAMESPACE_PART_LEN);
    let identity = format!("{name_part}-{namespace_part}-{}", &hash[..HASH_LEN]);
    debug_assert!(identity.len() <= MAX_LABEL_VALUE_LEN);
    identity
}

fn readable_part(s: &str, max: usize) -> String {
    let cut: String = trim_to_boundary(s, max)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    cut.trim_matches(['-', '.', '_']).to_string()
}
