//! Partition archives into groups connected through shared identifiers.
//!
//! Archives and identifiers form a bipartite graph; a group is one connected
//! component of archives in that graph. Components are computed with a
//! union-find over archive indices, driven by an identifier -> archive index
//! built in a single pass.

use crate::event::IdentifierSet;
use crate::store::ArchiveHandle;
use crate::PipelineError;
use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::HashMap;

/// Disjoint-set forest with path halving and union by size.
pub struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns false if both were already in the same set.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}

/// A non-empty set of raw archives, held in byte-wise order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Group {
    archives: Vec<ArchiveHandle>,
}

impl Group {
    pub fn new(mut archives: Vec<ArchiveHandle>) -> Result<Self, PipelineError> {
        if archives.is_empty() {
            return Err(PipelineError::integrity("a group must contain at least one archive"));
        }
        archives.sort();
        archives.dedup();
        Ok(Self { archives })
    }

    /// The archive whose relative path names the merged and final output.
    pub fn representative(&self) -> &ArchiveHandle {
        &self.archives[0]
    }

    pub fn archives(&self) -> &[ArchiveHandle] {
        &self.archives
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    pub fn contains(&self, archive: &ArchiveHandle) -> bool {
        self.archives.binary_search(archive).is_ok()
    }
}

/// Group archives that share identifiers, directly or transitively.
///
/// The result does not depend on the iteration order of `archive_ids`:
/// archives are sorted before unions, each group is sorted, and groups are
/// ordered by their representative.
pub fn group_related_archives<S>(
    archive_ids: &HashMap<ArchiveHandle, IdentifierSet, S>,
) -> Vec<Group>
where
    S: std::hash::BuildHasher,
{
    let archives: Vec<&ArchiveHandle> = archive_ids.keys().sorted().collect();
    let mut sets = UnionFind::new(archives.len());
    let mut first_holder: FxHashMap<&str, usize> = FxHashMap::default();

    for (index, archive) in archives.iter().enumerate() {
        for id in &archive_ids[*archive] {
            match first_holder.get(id.as_str()) {
                Some(&holder) => {
                    sets.union(holder, index);
                }
                None => {
                    first_holder.insert(id.as_str(), index);
                }
            }
        }
    }

    let mut components: FxHashMap<usize, Vec<ArchiveHandle>> = FxHashMap::default();
    for (index, archive) in archives.iter().enumerate() {
        let root = sets.find(index);
        components.entry(root).or_default().push((*archive).clone());
    }

    // archives were visited in sorted order, so every member list is sorted
    let mut groups: Vec<Group> = components
        .into_values()
        .map(|archives| Group { archives })
        .collect();
    groups.sort_by(|a, b| a.representative().cmp(b.representative()));

    tracing::debug!(
        archives = archives.len(),
        identifiers = first_holder.len(),
        groups = groups.len(),
        "grouped archives by shared identifiers"
    );
    groups
}

/// Check that `groups` partition `archives`: no empty group, no archive
/// missing, no archive in two groups, no unknown archive.
pub fn validate_partition(groups: &[Group], archives: &[ArchiveHandle]) -> Result<(), PipelineError> {
    let expected: FxHashSet<&ArchiveHandle> = archives.iter().collect();
    let mut seen: FxHashSet<&ArchiveHandle> = FxHashSet::default();

    for group in groups {
        if group.is_empty() {
            return Err(PipelineError::integrity("grouping produced an empty group"));
        }
        for archive in group.archives() {
            if !expected.contains(archive) {
                return Err(PipelineError::integrity(format!(
                    "group references unknown archive {}",
                    archive
                )));
            }
            if !seen.insert(archive) {
                return Err(PipelineError::integrity(format!(
                    "archive {} is assigned to more than one group",
                    archive
                )));
            }
        }
    }

    if seen.len() != expected.len() {
        let missing = expected
            .iter()
            .filter(|a| !seen.contains(*a))
            .sorted()
            .join(", ");
        return Err(PipelineError::integrity(format!(
            "archives not assigned to any group: {}",
            missing
        )));
    }
    Ok(())
}
