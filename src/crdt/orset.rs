//! Observed-remove set
//!
//! Every add mints a unique tag stamped with the partition that performed
//! it. A remove tombstones the tags it can see, so an add it never
//! observed (concurrent, or later) survives the merge.
//!
//! The set holds no clock and no shared state: `add` and `remove` only
//! touch `self`, and the caller decides whether to persist the result.

use crate::common::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identity of one add operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Partition that performed the add
    pub origin: PartitionId,
    pub id: Uuid,
}

impl Tag {
    fn mint(origin: PartitionId) -> Self {
        Self {
            origin,
            id: Uuid::new_v4(),
        }
    }
}

/// Observed-remove set over opaque members.
///
/// `PartialEq` compares raw state (tags and tombstones). Use
/// [`OrSet::value_eq`] to compare what readers actually see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize + Ord",
    deserialize = "T: Deserialize<'de> + Ord"
))]
pub struct OrSet<T: Ord> {
    elements: BTreeMap<T, BTreeSet<Tag>>,
    tombstones: BTreeSet<Tag>,
}

impl<T: Ord> Default for OrSet<T> {
    fn default() -> Self {
        Self {
            elements: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` under a fresh tag minted for `origin`.
    pub fn add(&mut self, member: T, origin: PartitionId) -> Tag {
        let tag = Tag::mint(origin);
        self.elements.entry(member).or_default().insert(tag);
        tag
    }

    /// Tombstone every tag of `member` visible right now.
    ///
    /// `origin` is recorded only in logs; removes mint no tag.
    pub fn remove(&mut self, member: &T, origin: PartitionId) -> usize {
        let Some(tags) = self.elements.get(member) else {
            return 0;
        };
        let mut removed = 0;
        for tag in tags {
            if self.tombstones.insert(*tag) {
                removed += 1;
            }
        }
        tracing::trace!(origin, removed, "Tombstoned tags");
        removed
    }

    /// Union of elements and tombstones.
    pub fn merge(&mut self, other: &Self) {
        for (member, tags) in &other.elements {
            self.elements
                .entry(member.clone())
                .or_default()
                .extend(tags.iter().copied());
        }
        self.tombstones.extend(other.tombstones.iter().copied());
    }

    /// Merge two sets into a new one.
    pub fn merged(a: &Self, b: &Self) -> Self {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    fn is_visible(&self, tags: &BTreeSet<Tag>) -> bool {
        tags.iter().any(|t| !self.tombstones.contains(t))
    }

    /// Visible members in order
    pub fn value(&self) -> BTreeSet<T> {
        self.elements
            .iter()
            .filter(|(_, tags)| self.is_visible(tags))
            .map(|(member, _)| member.clone())
            .collect()
    }

    pub fn contains(&self, member: &T) -> bool {
        self.elements
            .get(member)
            .is_some_and(|tags| self.is_visible(tags))
    }

    /// Compare materialized values, ignoring tag history.
    pub fn value_eq(&self, other: &Self) -> bool {
        let mine = self
            .elements
            .iter()
            .filter(|(_, tags)| self.is_visible(tags))
            .map(|(m, _)| m);
        let theirs = other
            .elements
            .iter()
            .filter(|(_, tags)| other.is_visible(tags))
            .map(|(m, _)| m);
        mine.eq(theirs)
    }

    /// Number of visible members
    pub fn len(&self) -> usize {
        self.elements
            .values()
            .filter(|tags| self.is_visible(tags))
            .count()
    }

    /// No visible members (tags and tombstones may still be present)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}
