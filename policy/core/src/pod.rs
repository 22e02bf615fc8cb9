use std::collections::BTreeSet;
use std::fmt;

/// Identifies a pod by namespace and name.
///
/// The derived ordering (namespace first, then name) is what makes compiler
/// output deterministic: pods are always processed in `PodId` order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

/// A set of pods with deterministic iteration order.
pub type PodSet = BTreeSet<PodId>;

// === impl PodId ===

impl PodId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
