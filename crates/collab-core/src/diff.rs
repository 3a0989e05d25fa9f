//! Keyed sequence reconciliation.
//!
//! Single pass with a cursor into each sequence and set lookahead. An old
//! item missing from the rest of the new sequence is removed and a new item
//! missing from the rest of the old sequence is inserted. When both items
//! appear further along, the one whose other position is farther away is
//! taken as the moved one and relocated: a rotation costs one move, not one
//! per shifted item.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqStep<T> {
    Keep(T),
    Remove(T),
    Insert(T),
}

/// Steps that turn `old` into `new`, in application order.
///
/// Items must be unique within each sequence. A moved item may be inserted
/// at its new place before its old copy is removed, so a consumer briefly
/// holds it twice.
pub fn diff_sequence<T: Eq + Hash + Clone>(old: &[T], new: &[T]) -> Vec<SeqStep<T>> {
    let mut old_remaining: HashSet<&T> = old.iter().collect();
    let mut new_remaining: HashSet<&T> = new.iter().collect();
    let old_pos: HashMap<&T, usize> = old.iter().enumerate().map(|(i, t)| (t, i)).collect();
    let new_pos: HashMap<&T, usize> = new.iter().enumerate().map(|(j, t)| (t, j)).collect();
    let mut steps = Vec::with_capacity(old.len().max(new.len()));
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        let (a, b) = (&old[i], &new[j]);
        if a == b {
            steps.push(SeqStep::Keep(a.clone()));
            old_remaining.remove(a);
            new_remaining.remove(b);
            i += 1;
            j += 1;
        } else if !new_remaining.contains(a) {
            steps.push(SeqStep::Remove(a.clone()));
            old_remaining.remove(a);
            i += 1;
        } else if !old_remaining.contains(b) {
            steps.push(SeqStep::Insert(b.clone()));
            new_remaining.remove(b);
            j += 1;
        } else {
            // Both present further along. Move whichever is displaced farther.
            let a_ahead = new_pos.get(a).map_or(0, |p| p.saturating_sub(j));
            let b_ahead = old_pos.get(b).map_or(0, |p| p.saturating_sub(i));
            if b_ahead > a_ahead {
                steps.push(SeqStep::Insert(b.clone()));
                new_remaining.remove(b);
                j += 1;
            } else {
                steps.push(SeqStep::Remove(a.clone()));
                old_remaining.remove(a);
                i += 1;
            }
        }
    }
    steps.extend(old[i..].iter().cloned().map(SeqStep::Remove));
    steps.extend(new[j..].iter().cloned().map(SeqStep::Insert));
    steps
}

/// Run-length view of a step list: retained, removed and inserted spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqRun<T> {
    Retain(usize),
    Remove(Vec<T>),
    Insert(Vec<T>),
}

pub fn runs<T: Clone>(steps: &[SeqStep<T>]) -> Vec<SeqRun<T>> {
    let mut out: Vec<SeqRun<T>> = Vec::new();
    for step in steps {
        match (step, out.last_mut()) {
            (SeqStep::Keep(_), Some(SeqRun::Retain(n))) => *n += 1,
            (SeqStep::Keep(_), _) => out.push(SeqRun::Retain(1)),
            (SeqStep::Remove(item), Some(SeqRun::Remove(items))) => items.push(item.clone()),
            (SeqStep::Remove(item), _) => out.push(SeqRun::Remove(vec![item.clone()])),
            (SeqStep::Insert(item), Some(SeqRun::Insert(items))) => items.push(item.clone()),
            (SeqStep::Insert(item), _) => out.push(SeqRun::Insert(vec![item.clone()])),
        }
    }
    // Trailing retains carry no information.
    if matches!(out.last(), Some(SeqRun::Retain(_))) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(old: &[&str], steps: &[SeqStep<&str>]) -> Vec<String> {
        let mut seq: Vec<String> = old.iter().map(|s| s.to_string()).collect();
        let mut cursor = 0;
        for step in steps {
            match step {
                SeqStep::Keep(item) => {
                    assert_eq!(seq[cursor], *item);
                    cursor += 1;
                }
                SeqStep::Remove(item) => {
                    assert_eq!(seq[cursor], *item);
                    seq.remove(cursor);
                }
                SeqStep::Insert(item) => {
                    seq.insert(cursor, item.to_string());
                    cursor += 1;
                }
            }
        }
        seq
    }

    #[test]
    fn test_identical_sequences_only_keep() {
        let steps = diff_sequence(&["a", "b"], &["a", "b"]);
        assert!(steps.iter().all(|s| matches!(s, SeqStep::Keep(_))));
        assert!(runs(&steps).is_empty());
    }

    #[test]
    fn test_insert_in_middle() {
        let steps = diff_sequence(&["a", "c"], &["a", "b", "c"]);
        assert_eq!(
            steps,
            vec![SeqStep::Keep("a"), SeqStep::Insert("b"), SeqStep::Keep("c")]
        );
    }

    #[test]
    fn test_remove_and_insert() {
        let old = ["a", "b", "c", "d"];
        let new = ["a", "x", "d", "y"];
        let steps = diff_sequence(&old, &new);
        assert_eq!(apply(&old, &steps), new);
        let removed = steps.iter().filter(|s| matches!(s, SeqStep::Remove(_))).count();
        let inserted = steps.iter().filter(|s| matches!(s, SeqStep::Insert(_))).count();
        assert_eq!((removed, inserted), (2, 2));
    }

    fn edits<T>(steps: &[SeqStep<T>]) -> usize {
        steps
            .iter()
            .filter(|s| !matches!(s, SeqStep::Keep(_)))
            .count()
    }

    #[test]
    fn test_rotation_moves_one_item() {
        let old = ["a", "b", "c"];
        let new = ["c", "a", "b"];
        let steps = diff_sequence(&old, &new);
        assert_eq!(apply(&old, &steps), new);
        assert_eq!(
            steps,
            vec![
                SeqStep::Insert("c"),
                SeqStep::Keep("a"),
                SeqStep::Keep("b"),
                SeqStep::Remove("c"),
            ]
        );
    }

    #[test]
    fn test_rotation_other_way_moves_one_item() {
        let old = ["a", "b", "c", "d"];
        let new = ["b", "c", "d", "a"];
        let steps = diff_sequence(&old, &new);
        assert_eq!(apply(&old, &steps), new);
        assert_eq!(edits(&steps), 2);
        assert_eq!(steps[0], SeqStep::Remove("a"));
    }

    #[test]
    fn test_swap_and_shuffle_still_apply() {
        for (old, new) in [
            (vec!["a", "b"], vec!["b", "a"]),
            (vec!["a", "b", "c", "d", "e"], vec!["e", "c", "a", "d", "b"]),
            (vec!["a", "b", "c", "d"], vec!["d", "x", "b", "a"]),
        ] {
            let steps = diff_sequence(&old, &new);
            assert_eq!(apply(&old, &steps), new);
        }
    }

    #[test]
    fn test_runs_compress() {
        let steps = diff_sequence(&["a", "b", "c", "d"], &["a", "x", "y", "d"]);
        assert_eq!(
            runs(&steps),
            vec![
                SeqRun::Retain(1),
                SeqRun::Remove(vec!["b", "c"]),
                SeqRun::Insert(vec!["x", "y"]),
            ]
        );
    }
}
