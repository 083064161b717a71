//! Deduplicated sets of field elements.

use std::collections::BTreeSet;
use std::fmt;

use crate::field::Zp;

/// An unordered collection of distinct [`Zp`] values.
///
/// Iteration is in ascending numeric order so that wire output and test
/// assertions are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZSet {
    items: BTreeSet<Zp>,
}

impl ZSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `z`, returning `false` if it was already present.
    pub fn add(&mut self, z: Zp) -> bool {
        self.items.insert(z)
    }

    /// Removes `z`, returning `false` if it was absent.
    pub fn remove(&mut self, z: &Zp) -> bool {
        self.items.remove(z)
    }

    /// Membership test.
    pub fn contains(&self, z: &Zp) -> bool {
        self.items.contains(z)
    }

    /// Adds every element of `other`.
    pub fn add_all(&mut self, other: &ZSet) {
        self.items.extend(other.items.iter().cloned());
    }

    /// Removes every element of `other`.
    pub fn remove_all(&mut self, other: &ZSet) {
        for z in &other.items {
            self.items.remove(z);
        }
    }

    /// Elements in `self` or `other`.
    pub fn union(&self, other: &ZSet) -> ZSet {
        ZSet {
            items: self.items.union(&other.items).cloned().collect(),
        }
    }

    /// Elements in `self` but not in `other`.
    pub fn difference(&self, other: &ZSet) -> ZSet {
        ZSet {
            items: self.items.difference(&other.items).cloned().collect(),
        }
    }

    /// Elements in both sets.
    pub fn intersection(&self, other: &ZSet) -> ZSet {
        ZSet {
            items: self.items.intersection(&other.items).cloned().collect(),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Zp> {
        self.items.iter()
    }

    /// Copies the elements out in ascending order.
    pub fn items(&self) -> Vec<Zp> {
        self.items.iter().cloned().collect()
    }
}

impl FromIterator<Zp> for ZSet {
    fn from_iter<I: IntoIterator<Item = Zp>>(iter: I) -> Self {
        ZSet {
            items: iter.into_iter().collect(),
        }
    }
}

impl Extend<Zp> for ZSet {
    fn extend<I: IntoIterator<Item = Zp>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

impl IntoIterator for ZSet {
    type Item = Zp;
    type IntoIter = std::collections::btree_set::IntoIter<Zp>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl fmt::Display for ZSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, z) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{z}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::p_sks;

    fn set(vals: &[i64]) -> ZSet {
        let p = p_sks();
        vals.iter().map(|v| Zp::from_i64(&p, *v)).collect()
    }

    #[test]
    fn test_set_algebra() {
        let a = set(&[1, 2, 3]);
        let b = set(&[3, 4]);
        assert_eq!(a.union(&b), set(&[1, 2, 3, 4]));
        assert_eq!(a.difference(&b), set(&[1, 2]));
        assert_eq!(a.intersection(&b), set(&[3]));
        assert_eq!(a.to_string(), "{1, 2, 3}");
    }

    #[test]
    fn test_add_remove_dedup() {
        let p = p_sks();
        let mut s = ZSet::new();
        assert!(s.add(Zp::from_i64(&p, 7)));
        assert!(!s.add(Zp::from_i64(&p, 7)));
        assert_eq!(s.len(), 1);
        assert!(s.remove(&Zp::from_i64(&p, 7)));
        assert!(s.is_empty());
        let mut t = set(&[1, 2, 3]);
        t.remove_all(&set(&[2]));
        assert_eq!(t, set(&[1, 3]));
    }
}
