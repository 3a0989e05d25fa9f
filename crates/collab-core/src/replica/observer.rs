//! Delta observation.
//!
//! Keeps an index of the shared structure as last observed. The replica
//! re-reads only the nodes its change events name; the difference to the
//! index becomes `DeltaBatch`es, parents before children.
//! Newly created nodes are delivered whole as `SpanSnapshot`s inside their
//! parent's batch; removed nodes carry their identity so a remove and an
//! insert of the same node can be paired as a move.

use crate::delta::{
    AttrPatch, BatchId, DeltaBatch, DeltaOp, Origin, RemovedSpan, SharedRef, SpanSnapshot,
};
use crate::diff::{self, SeqRun};
use crate::snapshot::{Attrs, NodeKind};
use crate::text;
use std::collections::HashMap;

/// Shared state of one node as read from the document.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub kind: NodeKind,
    pub node_type: String,
    pub identity: String,
    pub attrs: Attrs,
    pub text: String,
    pub children: Vec<SharedRef>,
}

impl NodeState {
    pub fn empty_root() -> Self {
        Self {
            kind: NodeKind::Element,
            node_type: "root".to_string(),
            identity: SharedRef::ROOT.to_string(),
            attrs: Attrs::new(),
            text: String::new(),
            children: Vec::new(),
        }
    }
}

pub(crate) struct DeltaObserver {
    index: HashMap<SharedRef, NodeState>,
    parents: HashMap<SharedRef, SharedRef>,
    epoch: u64,
}

impl Default for DeltaObserver {
    fn default() -> Self {
        let mut index = HashMap::new();
        index.insert(SharedRef::root(), NodeState::empty_root());
        Self {
            index,
            parents: HashMap::new(),
            epoch: 0,
        }
    }
}

impl DeltaObserver {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self, shared: &SharedRef) -> Option<&NodeState> {
        self.index.get(shared)
    }

    pub fn contains(&self, shared: &SharedRef) -> bool {
        self.index.contains_key(shared)
    }

    /// Forget everything observed so the next pass re-delivers the whole tree.
    pub fn reset(&mut self) {
        *self = Self {
            epoch: self.epoch,
            ..Self::default()
        };
    }

    pub fn span(&self, shared: &SharedRef) -> Option<SpanSnapshot> {
        span_snapshot(shared, &self.index, self.epoch)
    }

    fn depth(&self, shared: &SharedRef) -> Option<usize> {
        if !self.index.contains_key(shared) {
            return None;
        }
        let mut depth = 0;
        let mut current = shared;
        while let Some(parent) = self.parents.get(current) {
            depth += 1;
            current = parent;
        }
        Some(depth)
    }

    /// Diff the `changed` nodes against their `fresh` state, then adopt it.
    ///
    /// `fresh` must hold every changed node that is still alive, plus the
    /// whole subtree of any child the index does not know yet. Nodes are
    /// visited parents first; a node inside a subtree removed earlier in the
    /// pass is skipped. Returns the batches and the refs dropped from the index.
    pub fn apply(
        &mut self,
        changed: &[SharedRef],
        fresh: &HashMap<SharedRef, NodeState>,
        origin: Origin,
    ) -> (Vec<DeltaBatch>, Vec<SharedRef>) {
        self.epoch += 1;
        let mut order: Vec<&SharedRef> = changed.iter().collect();
        order.sort_by_key(|shared| self.depth(shared).unwrap_or(usize::MAX));

        let mut batches = Vec::new();
        let mut pruned = Vec::new();
        for shared in order {
            let (Some(old), Some(new)) = (self.index.get(shared), fresh.get(shared)) else {
                continue;
            };
            let (ops, removed, inserted) = self.ops(old, new, fresh);
            for child in removed {
                self.prune(&child, &mut pruned);
            }
            for child in inserted {
                self.adopt(&child, shared, fresh);
            }
            self.index.insert(shared.clone(), new.clone());

            if !ops.is_empty() {
                batches.push(DeltaBatch {
                    id: BatchId {
                        epoch: self.epoch,
                        index: batches.len() as u32,
                    },
                    origin,
                    target: shared.clone(),
                    ops,
                });
            }
        }
        (batches, pruned)
    }

    fn ops(
        &self,
        old: &NodeState,
        new: &NodeState,
        fresh: &HashMap<SharedRef, NodeState>,
    ) -> (Vec<DeltaOp>, Vec<SharedRef>, Vec<SharedRef>) {
        let mut ops = Vec::new();
        let mut removed = Vec::new();
        let mut inserted = Vec::new();
        let patch = attr_patch(&old.attrs, &new.attrs);
        if !patch.is_empty() {
            ops.push(DeltaOp::Attributes(patch));
        }

        match new.kind {
            NodeKind::Text => {
                if let Some(splice) = text::compute_splice(&old.text, &new.text) {
                    if splice.index > 0 {
                        ops.push(DeltaOp::Retain(splice.index));
                    }
                    if splice.delete > 0 {
                        ops.push(DeltaOp::Delete(splice.delete));
                    }
                    if !splice.insert.is_empty() {
                        ops.push(DeltaOp::InsertText(splice.insert));
                    }
                }
            }
            NodeKind::Element => {
                let steps = diff::diff_sequence(&old.children, &new.children);
                for run in diff::runs(&steps) {
                    ops.push(match run {
                        SeqRun::Retain(n) => DeltaOp::Retain(n),
                        SeqRun::Remove(refs) => {
                            removed.extend(refs.iter().cloned());
                            DeltaOp::DeleteSpans(
                                refs.into_iter()
                                    .map(|shared| RemovedSpan {
                                        identity: self
                                            .index
                                            .get(&shared)
                                            .map(|s| s.identity.clone())
                                            .unwrap_or_default(),
                                        shared,
                                    })
                                    .collect(),
                            )
                        }
                        SeqRun::Insert(refs) => {
                            inserted.extend(refs.iter().cloned());
                            DeltaOp::InsertSpans(
                                refs.iter()
                                    .filter_map(|r| span_snapshot(r, fresh, self.epoch))
                                    .collect(),
                            )
                        }
                    });
                }
            }
            NodeKind::LineBreak | NodeKind::Decorator => {}
        }
        (ops, removed, inserted)
    }

    fn prune(&mut self, shared: &SharedRef, pruned: &mut Vec<SharedRef>) {
        let Some(state) = self.index.remove(shared) else {
            return;
        };
        self.parents.remove(shared);
        for child in &state.children {
            self.prune(child, pruned);
        }
        pruned.push(shared.clone());
    }

    fn adopt(
        &mut self,
        shared: &SharedRef,
        parent: &SharedRef,
        fresh: &HashMap<SharedRef, NodeState>,
    ) {
        let Some(state) = fresh.get(shared) else {
            return;
        };
        self.parents.insert(shared.clone(), parent.clone());
        for child in &state.children {
            self.adopt(child, shared, fresh);
        }
        self.index.insert(shared.clone(), state.clone());
    }
}

fn span_snapshot(
    shared: &SharedRef,
    states: &HashMap<SharedRef, NodeState>,
    epoch: u64,
) -> Option<SpanSnapshot> {
    let state = states.get(shared)?;
    Some(SpanSnapshot {
        shared: shared.clone(),
        identity: state.identity.clone(),
        kind: state.kind,
        node_type: state.node_type.clone(),
        attrs: state.attrs.clone(),
        text: state.text.clone(),
        children: state
            .children
            .iter()
            .filter_map(|child| span_snapshot(child, states, epoch))
            .collect(),
        epoch,
    })
}

/// Keys whose value differs between `from` and `to`.
pub fn attr_patch(from: &Attrs, to: &Attrs) -> AttrPatch {
    let mut patch = AttrPatch::default();
    for (key, value) in to {
        if from.get(key) != Some(value) {
            patch.set.insert(key.clone(), value.clone());
        }
    }
    for key in from.keys() {
        if !to.contains_key(key) {
            patch.removed.push(key.clone());
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(kind: NodeKind, identity: &str, text: &str, children: &[&str]) -> NodeState {
        NodeState {
            kind,
            node_type: kind.as_str().to_string(),
            identity: identity.to_string(),
            attrs: Attrs::new(),
            text: text.to_string(),
            children: children.iter().map(|c| SharedRef::new(*c)).collect(),
        }
    }

    fn tree(entries: Vec<(&str, NodeState)>) -> HashMap<SharedRef, NodeState> {
        entries
            .into_iter()
            .map(|(k, v)| (SharedRef::new(k), v))
            .collect()
    }

    fn root(children: &[&str]) -> NodeState {
        let mut state = NodeState::empty_root();
        state.children = children.iter().map(|c| SharedRef::new(*c)).collect();
        state
    }

    fn refs(names: &[&str]) -> Vec<SharedRef> {
        names.iter().map(|n| SharedRef::new(*n)).collect()
    }

    fn seeded() -> DeltaObserver {
        let mut observer = DeltaObserver::default();
        observer.apply(
            &refs(&["root"]),
            &tree(vec![
                ("root", root(&["a", "b"])),
                ("a", node(NodeKind::Element, "A", "", &["x"])),
                ("b", node(NodeKind::Element, "B", "", &[])),
                ("x", node(NodeKind::Text, "X", "moved", &[])),
            ]),
            Origin::Remote,
        );
        observer
    }

    #[test]
    fn test_first_observation_delivers_whole_tree() {
        let mut observer = DeltaObserver::default();
        let (batches, pruned) = observer.apply(
            &refs(&["root"]),
            &tree(vec![
                ("root", root(&["p"])),
                ("p", node(NodeKind::Element, "p1", "", &["t"])),
                ("t", node(NodeKind::Text, "t1", "hi", &[])),
            ]),
            Origin::Remote,
        );

        assert!(pruned.is_empty());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].target, SharedRef::root());
        let spans: Vec<_> = batches[0].inserted_spans().collect();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].identity, "p1");
        assert_eq!(spans[0].children[0].text, "hi");
        assert_eq!(spans[0].epoch, 1);
        assert!(observer.contains(&SharedRef::new("t")));
    }

    #[test]
    fn test_text_edit_emits_utf16_ops() {
        let mut observer = DeltaObserver::default();
        observer.apply(
            &refs(&["root"]),
            &tree(vec![
                ("root", root(&["t"])),
                ("t", node(NodeKind::Text, "t1", "a😀b", &[])),
            ]),
            Origin::Remote,
        );

        let (batches, _) = observer.apply(
            &refs(&["t"]),
            &tree(vec![("t", node(NodeKind::Text, "t1", "a😀xb", &[]))]),
            Origin::Remote,
        );
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].ops,
            vec![DeltaOp::Retain(3), DeltaOp::InsertText("x".into())]
        );
    }

    #[test]
    fn test_move_carries_identity_on_both_sides() {
        let mut observer = seeded();
        let (batches, pruned) = observer.apply(
            &refs(&["a", "b"]),
            &tree(vec![
                ("a", node(NodeKind::Element, "A", "", &[])),
                ("b", node(NodeKind::Element, "B", "", &["x2"])),
                ("x2", node(NodeKind::Text, "X", "moved", &[])),
            ]),
            Origin::Remote,
        );

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].removed_identities().collect::<Vec<_>>(), vec!["X"]);
        assert_eq!(batches[1].inserted_spans().next().unwrap().identity, "X");
        assert!(batches[0].id < batches[1].id);
        assert_eq!(pruned, refs(&["x"]));
        assert!(observer.contains(&SharedRef::new("x2")));
    }

    #[test]
    fn test_parents_visit_first_and_removed_subtrees_are_skipped() {
        let mut observer = seeded();
        // Children listed first still come after their parent.
        let (batches, pruned) = observer.apply(
            &refs(&["x", "root"]),
            &tree(vec![
                ("root", root(&["b"])),
                ("x", node(NodeKind::Text, "X", "edited", &[])),
            ]),
            Origin::Remote,
        );

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].target, SharedRef::root());
        assert_eq!(batches[0].removed_identities().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(pruned, refs(&["x", "a"]));
        assert!(observer.state(&SharedRef::new("x")).is_none());
    }

    #[test]
    fn test_attr_patch_only_changed_keys() {
        let mut from = Attrs::new();
        from.insert("a".into(), json!(1));
        from.insert("b".into(), json!(2));
        let mut to = from.clone();
        to.insert("a".into(), json!(5));
        to.remove("b");

        let patch = attr_patch(&from, &to);
        assert_eq!(patch.set.len(), 1);
        assert_eq!(patch.removed, vec!["b".to_string()]);
    }

    #[test]
    fn test_unchanged_tree_emits_nothing() {
        let mut observer = DeltaObserver::default();
        let state = tree(vec![
            ("root", root(&["t"])),
            ("t", node(NodeKind::Text, "t1", "same", &[])),
        ]);
        observer.apply(&refs(&["root"]), &state, Origin::Local);
        let (batches, _) = observer.apply(&refs(&["root", "t"]), &state, Origin::Local);
        assert!(batches.is_empty());
        assert_eq!(observer.epoch(), 2);
    }

    #[test]
    fn test_reset_redelivers_on_next_pass() {
        let mut observer = seeded();
        observer.reset();
        assert_eq!(observer.epoch(), 1);
        assert!(!observer.contains(&SharedRef::new("a")));
        assert!(observer.state(&SharedRef::root()).unwrap().children.is_empty());
    }
}
