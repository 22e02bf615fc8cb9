//! Finite port sets with an in-band "any port" marker.

use std::collections::HashSet;
use std::hash::BuildHasherDefault;

/// Port value matching any port.
pub const ANY_PORT: u16 = 0;

/// A hasher for ports.
///
/// Ports are single `u16` values, so the value serves as its own hash.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

/// A set of L4 ports. Containing [`ANY_PORT`] makes the set cover every port,
/// which the subset and intersection operations account for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortSet(HashSet<u16, BuildHasherDefault<PortHasher>>);

// === impl PortHasher ===

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

// === impl PortSet ===

impl PortSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: u16) -> bool {
        self.0.insert(port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    /// True when the set carries the any-port marker.
    pub fn has_any_port(&self) -> bool {
        self.0.contains(&ANY_PORT)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Subset test under the any-port interpretation: everything is a subset
    /// of an any-marked set, and an any-marked set is a subset only of
    /// another any-marked set.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        if other.has_any_port() {
            return true;
        }
        if self.has_any_port() {
            return false;
        }
        self.0.is_subset(&other.0)
    }

    /// Intersection under the any-port interpretation: an any-marked set is
    /// the identity element.
    pub fn intersection(&self, other: &Self) -> Self {
        if self.has_any_port() {
            return other.clone();
        }
        if other.has_any_port() {
            return self.clone();
        }
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<u16> for PortSet {
    fn from_iter<T: IntoIterator<Item = u16>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
