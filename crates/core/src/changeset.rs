//! Change sets
//!
//! A [`ChangeSet`] describes how the results of one query differ between two
//! snapshots. Indices refer to positions in the result lists:
//!
//! - `deletions`: positions in the old results
//! - `insertions`: positions in the new results
//! - `modifications`: positions in the old results of rows whose values changed
//! - `modifications_new`: the same rows, positions in the new results
//! - `moves`: surviving rows whose relative order changed
//!
//! Change sets are always computed as a net difference, so a sequence of
//! commits that cancel out yields an empty set.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// A row that kept its identity but changed position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Move {
    /// Position in the old results
    pub from: usize,
    /// Position in the new results
    pub to: usize,
}

/// Difference between two versions of one query's results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Positions in the new results
    pub insertions: BTreeSet<usize>,
    /// Positions in the old results
    pub deletions: BTreeSet<usize>,
    /// Positions in the old results
    pub modifications: BTreeSet<usize>,
    /// Positions in the new results
    pub modifications_new: BTreeSet<usize>,
    /// Reordered surviving rows
    pub moves: Vec<Move>,
}

impl ChangeSet {
    /// The empty change set
    pub fn empty() -> Self {
        ChangeSet::default()
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty()
            && self.deletions.is_empty()
            && self.modifications.is_empty()
            && self.moves.is_empty()
    }

    /// Compute the net difference between two ordered result lists
    ///
    /// Rows are identified by key `K`; a row present in both lists whose
    /// payload `R` differs is a modification.
    pub fn diff<K, R>(old: &[(K, R)], new: &[(K, R)]) -> ChangeSet
    where
        K: Eq + Hash + Copy,
        R: PartialEq,
    {
        let mut changes = ChangeSet::default();

        let new_positions: HashMap<K, usize> =
            new.iter().enumerate().map(|(i, (k, _))| (*k, i)).collect();
        let old_positions: HashMap<K, usize> =
            old.iter().enumerate().map(|(i, (k, _))| (*k, i)).collect();

        for (old_index, (key, old_row)) in old.iter().enumerate() {
            match new_positions.get(key) {
                None => {
                    changes.deletions.insert(old_index);
                }
                Some(&new_index) => {
                    if new[new_index].1 != *old_row {
                        changes.modifications.insert(old_index);
                        changes.modifications_new.insert(new_index);
                    }
                }
            }
        }

        // Surviving rows in new order, tagged with their old position
        let mut survivors: Vec<(usize, usize)> = Vec::new();
        for (new_index, (key, _)) in new.iter().enumerate() {
            match old_positions.get(key) {
                None => {
                    changes.insertions.insert(new_index);
                }
                Some(&old_index) => survivors.push((old_index, new_index)),
            }
        }

        let stable = longest_increasing_run(&survivors);
        for (i, &(from, to)) in survivors.iter().enumerate() {
            if !stable.contains(&i) {
                changes.moves.push(Move { from, to });
            }
        }

        changes
    }
}

/// Indices into `pairs` forming a longest subsequence increasing in `.0`
fn longest_increasing_run(pairs: &[(usize, usize)]) -> BTreeSet<usize> {
    // Patience sorting; tails[l] = index of the smallest tail of a run of length l+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; pairs.len()];

    for i in 0..pairs.len() {
        let value = pairs[i].0;
        let pos = tails.partition_point(|&t| pairs[t].0 < value);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut result = BTreeSet::new();
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        result.insert(i);
        cursor = prev[i];
    }
    result
}
