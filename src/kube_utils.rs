//! Shared Kubernetes helpers: compiled-resource metadata, API resource
//! construction and stable hashing for generated names.

use std::collections::BTreeMap;

use kube::discovery::ApiResource;

use crate::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE};

/// Maximum length of a Kubernetes object name (DNS-1123 subdomain)
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length of a label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

// =============================================================================
// ObjectMeta - metadata for compiled policy resources
// =============================================================================

/// Kubernetes metadata for resources compiled from ClientIntents.
///
/// Carries the managed-by label from construction; ownership labels are
/// attached by the artifact engine.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with the managed-by label set
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_VALUE.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// # Example
/// ```ignore
/// impl HasApiResource for Server {
///     const API_VERSION: &'static str = "policy.linkerd.io/v1beta3";
///     const KIND: &'static str = "Server";
/// }
///
/// let ar = Server::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "cilium.io/v2")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "CiliumNetworkPolicy")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND, None)
    }
}

/// Build an ApiResource from an apiVersion and kind.
///
/// `plural` overrides the lowercase-plus-s default for kinds whose resource
/// name doesn't follow it.
pub fn build_api_resource(api_version: &str, kind: &str, plural: Option<&str>) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: plural
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}s", kind.to_lowercase())),
    }
}

/// Split "group/version" into its parts; core types have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

// =============================================================================
// Hashing and generated names
// =============================================================================

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function must be used whenever the hash ends up in a persisted name or label.
pub fn deterministic_hash(input: &str) -> String {
    let mut hex = sha256_hex(input);
    hex.truncate(16);
    hex
}

/// Full SHA-256 digest of the input as 64 lowercase hex characters.
pub fn sha256_hex(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Fit a generated name into `max_len` characters.
///
/// Names that already fit are returned unchanged. Longer names are cut and
/// suffixed with a hash of the full name so distinct inputs stay distinct.
pub fn bounded_name(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let hash = &deterministic_hash(name)[..8];
    let keep = max_len.saturating_sub(hash.len() + 1);
    let prefix = trim_to_boundary(name, keep);
    format!("{}-{}", prefix.trim_end_matches(['-', '.']), hash)
}

/// Truncate to at most `max` bytes without splitting a character.
pub(crate) fn trim_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Render a label selector string (`k1=v1,k2=v2`) from a map
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
