//! Collaborative undo.
//!
//! Tracks only changes this client pushed. Undoing applies the inverse of
//! those changes as a fresh local edit, so edits made by peers in the
//! meantime stay untouched: text inverses only apply while the text they
//! would remove is still there, and attribute inverses only apply while the
//! attribute still holds the value we wrote.

use crate::binding::Binding;
use crate::delta::SharedRef;
use crate::model::{DocumentModel, UpdateTags};
use crate::provider::Provider;
use crate::push::{AppliedChange, PushError, push_local_update};
use crate::snapshot::{NodeKey, Snapshot, SnapshotDraft};
use crate::text;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};
use web_time::Instant;

pub const DEFAULT_MAX_STEPS: usize = 100;
pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum UndoError {
    #[error("Push failed: {0}")]
    Push(#[from] PushError),
}

pub type Result<T> = std::result::Result<T, UndoError>;

/// A recorded change plus, for text, where it sits in the shared text now.
#[derive(Debug, Clone)]
struct TrackedChange {
    change: AppliedChange,
    anchor: Option<(SharedRef, Vec<u8>)>,
}

#[derive(Debug, Clone)]
struct UndoEntry {
    changes: Vec<TrackedChange>,
    at: Instant,
    /// Later edits may still merge into this step.
    open: bool,
}

pub struct UndoManager {
    scope: SharedRef,
    undo: Vec<UndoEntry>,
    redo: Vec<UndoEntry>,
    max_steps: usize,
    merge_interval: Duration,
}

/// Create an undo manager tracking local changes under `root`.
pub fn create_undo_manager(binding: &Binding, root: SharedRef) -> UndoManager {
    if binding.key_for(&root).is_none() {
        debug!("Undo scope {} is not bound yet", root);
    }
    UndoManager::new(root)
}

impl UndoManager {
    pub fn new(scope: SharedRef) -> Self {
        Self {
            scope,
            undo: Vec::new(),
            redo: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
            merge_interval: DEFAULT_MERGE_INTERVAL,
        }
    }

    pub fn with_limits(mut self, max_steps: usize, merge_interval: Duration) -> Self {
        self.max_steps = max_steps.max(1);
        self.merge_interval = merge_interval;
        self
    }

    pub fn scope(&self) -> &SharedRef {
        &self.scope
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    /// Record changes from a local push. Starts a new step unless the last
    /// one is younger than the merge interval. Clears the redo stack.
    pub fn record(&mut self, binding: &Binding, snapshot: &Snapshot, changes: &[AppliedChange]) {
        let tracked = self.track(binding, snapshot, changes);
        if tracked.is_empty() {
            return;
        }
        self.redo.clear();
        let now = Instant::now();
        match self.undo.last_mut() {
            Some(last) if last.open && now.duration_since(last.at) < self.merge_interval => {
                last.changes.extend(tracked);
                last.at = now;
            }
            _ => {
                self.undo.push(UndoEntry {
                    changes: tracked,
                    at: now,
                    open: true,
                });
                if self.undo.len() > self.max_steps {
                    self.undo.remove(0);
                }
            }
        }
    }

    /// Revert the most recent step. Returns false if there was nothing to undo.
    pub fn undo<M: DocumentModel, P: Provider + ?Sized>(
        &mut self,
        binding: &mut Binding,
        provider: &P,
        model: &mut M,
    ) -> Result<bool> {
        let Some(entry) = self.undo.pop() else {
            return Ok(false);
        };
        let inverse = self.revert(binding, provider, model, entry)?;
        if !inverse.is_empty() {
            self.redo.push(UndoEntry {
                changes: inverse,
                at: Instant::now(),
                open: false,
            });
        }
        Ok(true)
    }

    /// Re-apply the most recently undone step.
    pub fn redo<M: DocumentModel, P: Provider + ?Sized>(
        &mut self,
        binding: &mut Binding,
        provider: &P,
        model: &mut M,
    ) -> Result<bool> {
        let Some(entry) = self.redo.pop() else {
            return Ok(false);
        };
        let inverse = self.revert(binding, provider, model, entry)?;
        if !inverse.is_empty() {
            self.undo.push(UndoEntry {
                changes: inverse,
                at: Instant::now(),
                open: false,
            });
        }
        Ok(true)
    }

    fn revert<M: DocumentModel, P: Provider + ?Sized>(
        &self,
        binding: &mut Binding,
        provider: &P,
        model: &mut M,
        entry: UndoEntry,
    ) -> Result<Vec<TrackedChange>> {
        let positions: Vec<Option<usize>> = entry
            .changes
            .iter()
            .map(|tracked| {
                let (shared, cursor) = tracked.anchor.as_ref()?;
                binding
                    .replica()
                    .resolve_text_cursor(shared, cursor)
                    .map(|resolved| resolved.offset)
            })
            .collect();

        let update = model.update(UpdateTags::historic(), |draft| {
            for (tracked, position) in entry.changes.iter().zip(positions).rev() {
                invert(draft, &tracked.change, position, &entry.changes);
            }
        });
        let report = push_local_update(binding, provider, &update)?;
        trace!("Reverted step with {} changes", report.changes.len());
        Ok(self.track(binding, &update.next, &report.changes))
    }

    fn track(
        &self,
        binding: &Binding,
        snapshot: &Snapshot,
        changes: &[AppliedChange],
    ) -> Vec<TrackedChange> {
        let scope = binding.key_for(&self.scope).cloned();
        changes
            .iter()
            .filter(|change| match &scope {
                Some(scope) => {
                    let key = change_anchor_key(change);
                    key == scope || snapshot.is_ancestor(scope, key)
                }
                None => false,
            })
            .map(|change| TrackedChange {
                anchor: text_anchor(binding, change),
                change: change.clone(),
            })
            .collect()
    }
}

fn change_anchor_key(change: &AppliedChange) -> &NodeKey {
    match change {
        AppliedChange::Inserted { parent, .. } | AppliedChange::Removed { parent, .. } => parent,
        AppliedChange::Text { key, .. } | AppliedChange::Attrs { key, .. } => key,
    }
}

fn text_anchor(binding: &Binding, change: &AppliedChange) -> Option<(SharedRef, Vec<u8>)> {
    let AppliedChange::Text { key, index, .. } = change else {
        return None;
    };
    let shared = binding.shadow(key)?.shared.clone();
    let cursor = binding.replica().text_cursor(&shared, *index)?;
    Some((shared, cursor))
}

/// Apply the inverse of one change to `draft`, skipping anything a peer has since altered.
fn invert(
    draft: &mut SnapshotDraft,
    change: &AppliedChange,
    position: Option<usize>,
    entry: &[TrackedChange],
) {
    match change {
        AppliedChange::Text {
            key,
            index,
            removed,
            inserted,
        } => {
            let Some(current) = draft.text(key) else {
                return;
            };
            let start = position.unwrap_or(*index);
            let end = start + text::utf16_len(inserted);
            if end > text::utf16_len(current)
                || text::slice_utf16(current, start, end) != inserted.as_str()
            {
                trace!("Skipping undo of text in {}: changed since", key);
                return;
            }
            let removed = removed.clone();
            draft.splice_text(key, start, text::utf16_len(inserted), &removed);
        }
        AppliedChange::Inserted { key, subtree, .. } => {
            let moved = entry.iter().any(|t| {
                matches!(&t.change, AppliedChange::Removed { key: removed, .. } if removed == key)
            });
            if !moved {
                let ours: HashSet<NodeKey> = subtree.keys().into_iter().collect();
                remove_own(draft, key, &ours);
            }
        }
        AppliedChange::Removed {
            parent,
            key,
            index,
            after,
            subtree,
        } => {
            if !draft.contains(parent) {
                trace!("Skipping restore of {}: parent {} is gone", key, parent);
                return;
            }
            let position = match after {
                Some(after) => draft
                    .children(parent)
                    .iter()
                    .position(|k| k == after)
                    .map(|i| i + 1)
                    .unwrap_or(*index),
                None => 0,
            };
            if draft.contains(key) {
                draft.move_node(key, parent, position);
            } else {
                draft.insert(parent, position, subtree.clone());
            }
        }
        AppliedChange::Attrs { key, before, after } => {
            for (name, previous) in before {
                let ours = after.get(name).cloned().flatten();
                let current = draft.get(key).and_then(|n| n.attrs.get(name).cloned());
                if current != ours {
                    continue;
                }
                match previous {
                    Some(value) => draft.set_attr(key, name, value.clone()),
                    None => draft.remove_attr(key, name),
                };
            }
        }
    }
}

/// Remove the parts of `key`'s subtree listed in `ours`.
///
/// A node that still holds anything else stays, along with the path to it.
/// Returns whether `key` itself went away.
fn remove_own(draft: &mut SnapshotDraft, key: &NodeKey, ours: &HashSet<NodeKey>) -> bool {
    if !draft.contains(key) {
        return true;
    }
    let mut kept = false;
    for child in draft.children(key).to_vec() {
        if !ours.contains(&child) || !remove_own(draft, &child, ours) {
            kept = true;
        }
    }
    if kept {
        trace!("Keeping {}: holds content added since", key);
        return false;
    }
    draft.remove(key);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackHub, LoopbackProvider};
    use crate::model::LocalDocument;
    use crate::peer_id::PeerId;
    use crate::replica::Replica;
    use crate::snapshot::NodeSpec;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Fixture {
        binding: Binding,
        doc: LocalDocument,
        provider: Arc<LoopbackProvider>,
        undo: UndoManager,
    }

    fn fixture() -> Fixture {
        let hub = LoopbackHub::new();
        let replica = Replica::new(PeerId::from(1));
        let binding = Binding::new(PeerId::from(1), "t", replica, HashMap::new());
        let undo = create_undo_manager(&binding, SharedRef::root()).with_limits(10, Duration::ZERO);
        Fixture {
            binding,
            doc: LocalDocument::default(),
            provider: hub.provider(PeerId::from(1)),
            undo,
        }
    }

    fn edit(f: &mut Fixture, edit: impl FnOnce(&mut SnapshotDraft)) {
        let update = f.doc.update(UpdateTags::none(), edit);
        let report = push_local_update(&mut f.binding, f.provider.as_ref(), &update).unwrap();
        f.undo.record(&f.binding, &update.next, &report.changes);
    }

    #[test]
    fn test_undo_and_redo_text() {
        let mut f = fixture();
        edit(&mut f, |d| {
            d.append(
                &NodeKey::root(),
                NodeSpec::paragraph()
                    .with_key("p")
                    .with_child(NodeSpec::text("hello").with_key("t")),
            );
        });
        edit(&mut f, |d| {
            d.set_text(&NodeKey::from("t"), "hello world");
        });

        assert!(f.undo.undo(&mut f.binding, f.provider.as_ref(), &mut f.doc).unwrap());
        assert_eq!(f.doc.snapshot().text(&NodeKey::from("t")), Some("hello"));
        assert!(f.undo.can_redo());

        assert!(f.undo.redo(&mut f.binding, f.provider.as_ref(), &mut f.doc).unwrap());
        assert_eq!(f.doc.snapshot().text(&NodeKey::from("t")), Some("hello world"));
        assert!(f.binding.verify(&f.doc.snapshot()).is_empty());
    }

    #[test]
    fn test_undo_insert_removes_node() {
        let mut f = fixture();
        edit(&mut f, |d| {
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("p"));
        });
        f.undo.undo(&mut f.binding, f.provider.as_ref(), &mut f.doc).unwrap();
        assert!(!f.doc.snapshot().contains(&NodeKey::from("p")));
        assert!(f.binding.replica().is_empty());
    }

    #[test]
    fn test_undo_insert_keeps_children_added_since() {
        let mut f = fixture();
        edit(&mut f, |d| {
            d.append(
                &NodeKey::root(),
                NodeSpec::paragraph()
                    .with_key("p")
                    .with_child(NodeSpec::text("ours").with_key("t")),
            );
        });
        // A peer adds a child to the paragraph we inserted.
        f.doc.update(UpdateTags::collaboration(), |d| {
            d.append(&NodeKey::from("p"), NodeSpec::text("theirs").with_key("x"));
        });

        f.undo.undo(&mut f.binding, f.provider.as_ref(), &mut f.doc).unwrap();

        let snapshot = f.doc.snapshot();
        assert!(snapshot.contains(&NodeKey::from("p")));
        assert!(!snapshot.contains(&NodeKey::from("t")));
        assert_eq!(snapshot.text(&NodeKey::from("x")), Some("theirs"));
        assert_eq!(snapshot.children(&NodeKey::from("p")), &[NodeKey::from("x")]);
    }

    #[test]
    fn test_undo_remove_restores_at_anchor() {
        let mut f = fixture();
        edit(&mut f, |d| {
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("a"));
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("b"));
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("c"));
        });
        f.undo.clear();
        edit(&mut f, |d| {
            d.remove(&NodeKey::from("b"));
        });
        f.undo.undo(&mut f.binding, f.provider.as_ref(), &mut f.doc).unwrap();

        let snapshot = f.doc.snapshot();
        let order: Vec<&str> = snapshot
            .children(&NodeKey::root())
            .iter()
            .map(|k| k.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_attribute_changed_since_is_left_alone() {
        let mut f = fixture();
        edit(&mut f, |d| {
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("p"));
        });
        f.undo.clear();
        edit(&mut f, |d| {
            d.set_attr(&NodeKey::from("p"), "align", json!("left"));
        });
        // Someone else's later write to the same key.
        f.doc.update(UpdateTags::collaboration(), |d| {
            d.set_attr(&NodeKey::from("p"), "align", json!("right"));
        });
        f.undo.undo(&mut f.binding, f.provider.as_ref(), &mut f.doc).unwrap();
        let node = f.doc.snapshot().get(&NodeKey::from("p")).cloned().unwrap();
        assert_eq!(node.attrs.get("align"), Some(&json!("right")));
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut f = fixture();
        edit(&mut f, |d| {
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("p"));
        });
        f.undo.undo(&mut f.binding, f.provider.as_ref(), &mut f.doc).unwrap();
        assert!(f.undo.can_redo());
        edit(&mut f, |d| {
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("q"));
        });
        assert!(!f.undo.can_redo());
    }

    #[test]
    fn test_max_steps_drops_oldest() {
        let mut f = fixture();
        f.undo = UndoManager::new(SharedRef::root()).with_limits(2, Duration::ZERO);
        for key in ["a", "b", "c"] {
            edit(&mut f, |d| {
                d.append(&NodeKey::root(), NodeSpec::paragraph().with_key(key));
            });
        }
        assert_eq!(f.undo.undo_depth(), 2);
    }
}
