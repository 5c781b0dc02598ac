//! Ordered names made of opaque byte components.

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::wire::{tag, Reader, Writer};

/// How a name relates to another name or to a name range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRelation {
    Before,
    Equal,
    After,
}

/// A name: an ordered sequence of opaque byte components.
///
/// Ordering is component by component; a single component pair
/// compares first by byte length and then bytewise, and a name that
/// is a strict prefix of another sorts before it. This is the order
/// every tree invariant is stated in, so it must agree on all peers.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Name {
    components: Vec<Vec<u8>>,
}

impl Name {
    /// The empty name (zero components). Distinct from an *absent*
    /// name: an absent root hash means "empty tree", while an empty
    /// name is an ordinary, minimal name.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_components(components: Vec<Vec<u8>>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[Vec<u8>] {
        &self.components
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn push(&mut self, component: impl Into<Vec<u8>>) {
        self.components.push(component.into());
    }

    /// Returns `self` extended by one component.
    pub fn child(&self, component: impl Into<Vec<u8>>) -> Self {
        let mut name = self.clone();
        name.push(component);
        name
    }

    /// True when `prefix`'s components equal our leading components.
    /// Every name is a prefix of itself.
    pub fn starts_with(&self, prefix: &Name) -> bool {
        prefix.components.len() <= self.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }

    /// The components after `prefix`, or `None` when `prefix` does
    /// not apply.
    pub fn strip_prefix(&self, prefix: &Name) -> Option<&[Vec<u8>]> {
        self.starts_with(prefix)
            .then(|| &self.components[prefix.components.len()..])
    }

    /// Number of leading components shared with `other`.
    pub fn shared_components(&self, other: &Name) -> usize {
        self.components
            .iter()
            .zip(&other.components)
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Canonical encoding: a `Name` element wrapping one
    /// `NameComponent` element per component.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_into(&mut w);
        w.into_bytes()
    }

    pub fn encode_into(&self, w: &mut Writer) {
        w.nested(tag::NAME, |n| {
            for component in &self.components {
                n.element(tag::NAME_COMPONENT, component);
            }
        });
    }

    /// Encoded size without building the buffer.
    pub fn encoded_len(&self) -> usize {
        let body: usize = self
            .components
            .iter()
            .map(|c| crate::wire::element_len(tag::NAME_COMPONENT, c.len()))
            .sum();
        crate::wire::element_len(tag::NAME, body)
    }

    pub fn decode_from(r: &mut Reader<'_>) -> Result<Self, crate::wire::WireError> {
        let mut inner = r.nested(tag::NAME)?;
        let mut components = Vec::new();
        while !inner.at_end() {
            components.push(inner.element(tag::NAME_COMPONENT)?.to_vec());
        }
        Ok(Self { components })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, crate::wire::WireError> {
        let mut r = Reader::new(bytes);
        let name = Self::decode_from(&mut r)?;
        r.finish()?;
        Ok(name)
    }

    pub fn relation_to(&self, other: &Name) -> NameRelation {
        match self.cmp(other) {
            Ordering::Less => NameRelation::Before,
            Ordering::Equal => NameRelation::Equal,
            Ordering::Greater => NameRelation::After,
        }
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.components.iter().zip(&other.components) {
            let by_len = a.len().cmp(&b.len());
            let step = if by_len == Ordering::Equal {
                a.cmp(b)
            } else {
                by_len
            };
            if step != Ordering::Equal {
                return step;
            }
        }
        self.components.len().cmp(&other.components.len())
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/")?;
            if component.iter().all(|b| b.is_ascii_graphic()) {
                for b in component {
                    write!(f, "{}", *b as char)?;
                }
            } else {
                write!(f, "%{}", hex::encode(component))?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl FromStr for Name {
    type Err = core::convert::Infallible;

    /// Builds a name from a `/`-separated string; empty segments are
    /// ignored, so `"/"` is the empty name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            components: s
                .split('/')
                .filter(|seg| !seg.is_empty())
                .map(|seg| seg.as_bytes().to_vec())
                .collect(),
        })
    }
}

/// Filter pattern component: the single byte `0xFF` stands for "any
/// one component".
pub const WILDCARD: &[u8] = &[0xFF];

/// Matches `pattern` against the components of `name` starting at
/// `start`. Each pattern component must match the corresponding name
/// component, with [`WILDCARD`] matching exactly one arbitrary
/// component; the name may extend past the pattern.
pub fn pattern_match(pattern: &Name, name: &Name, start: usize) -> bool {
    let tail = &name.components()[start.min(name.component_count())..];
    if pattern.component_count() > tail.len() {
        return false;
    }
    pattern
        .components()
        .iter()
        .zip(tail)
        .all(|(p, c)| p[..] == *WILDCARD || p == c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn prefix_sorts_first() {
        assert!(name("/a") < name("/a/b"));
        assert!(name("/a/b") < name("/a/c"));
        assert!(name("/") < name("/a"));
    }

    #[test]
    fn shorter_component_sorts_first() {
        // per-component order is (length, bytes)
        assert!(name("/z") < name("/aa"));
        assert!(name("/a/z") < name("/a/aa"));
    }

    #[test]
    fn encode_round_trip() {
        for s in ["/", "/a", "/a/b/c", "/repo/data/0001"] {
            let n = name(s);
            assert_eq!(Name::decode(&n.encode()).unwrap(), n);
            assert_eq!(n.encode().len(), n.encoded_len());
        }
    }

    #[test]
    fn empty_component_is_not_absent() {
        let n = Name::from_components(vec![vec![]]);
        assert_ne!(n, Name::root());
        assert_eq!(Name::decode(&n.encode()).unwrap(), n);
        assert!(Name::root() < n);
    }

    #[test]
    fn prefix_strip() {
        let n = name("/a/b/c");
        assert_eq!(n.strip_prefix(&name("/a")).unwrap().len(), 2);
        assert!(n.strip_prefix(&name("/x")).is_none());
        assert!(n.starts_with(&n));
    }

    #[test]
    fn shared_component_counts() {
        assert_eq!(name("/a/b/c").shared_components(&name("/a/b/d")), 2);
        assert_eq!(name("/a").shared_components(&name("/b")), 0);
    }

    #[test]
    fn serde_round_trip() {
        let n = name("/a/b");
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(serde_json::from_str::<Name>(&json).unwrap(), n);
    }

    #[test]
    fn wildcard_matches_one_component() {
        let mut pattern = Name::root();
        pattern.push(WILDCARD.to_vec());
        pattern.push(b"leaf".to_vec());

        assert!(pattern_match(&pattern, &name("/x/leaf"), 0));
        assert!(pattern_match(&pattern, &name("/p/x/leaf/extra"), 1));
        assert!(!pattern_match(&pattern, &name("/leaf"), 0));
        assert!(!pattern_match(&pattern, &name("/x/other"), 0));
    }
}
