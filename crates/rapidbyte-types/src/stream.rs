//! Stream identity.
//!
//! A [`StreamKey`] names one logical stream flowing into a destination. It is
//! the key for every per-stream queue, counter, and checkpoint lane in the
//! buffer.

use serde::{Deserialize, Serialize};

/// `(namespace, name)` identifier of a logical stream.
///
/// The namespace is optional; records that omit it pick up the destination's
/// default namespace via [`StreamKey::with_default_namespace`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    name: String,
}

impl StreamKey {
    /// Stream key with an explicit namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Stream key without a namespace.
    #[must_use]
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fill in `namespace` if this key has none. Keys that already carry a
    /// namespace are returned unchanged.
    #[must_use]
    pub fn with_default_namespace(self, namespace: Option<&str>) -> Self {
        match (self.namespace, namespace) {
            (None, Some(ns)) => Self {
                namespace: Some(ns.to_string()),
                name: self.name,
            },
            (namespace, _) => Self {
                namespace,
                name: self.name,
            },
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
