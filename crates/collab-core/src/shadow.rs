//! Shadow mirror: per-node records tying local keys to shared nodes.
//!
//! Shadows live in an arena keyed by `NodeKey`. Each records its shared ref,
//! its node identity and its size; offsets are derived by walking prior
//! siblings and ancestors.

use crate::delta::{AttrPatch, SharedRef};
use crate::replica::attr_patch;
use crate::snapshot::{Attrs, LocalNode, NodeKey, NodeKind, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Attribute key naming the sub-document embedded by a decorator.
pub const SUBDOC_ATTR: &str = "subdoc";

/// Which attributes are synchronized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<Vec<String>>", into = "Option<Vec<String>>")]
pub enum AttributeFilter {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl AttributeFilter {
    pub fn only<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(keys.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, key: &str) -> bool {
        match self {
            AttributeFilter::All => true,
            AttributeFilter::Only(keys) => key == SUBDOC_ATTR || keys.contains(key),
        }
    }

    pub fn filter(&self, attrs: &Attrs) -> Attrs {
        attrs
            .iter()
            .filter(|(k, _)| self.allows(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn filter_patch(&self, patch: &AttrPatch) -> AttrPatch {
        AttrPatch {
            set: patch
                .set
                .iter()
                .filter(|(k, _)| self.allows(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            removed: patch.removed.iter().filter(|k| self.allows(k)).cloned().collect(),
        }
    }
}

impl From<Option<Vec<String>>> for AttributeFilter {
    fn from(keys: Option<Vec<String>>) -> Self {
        match keys {
            None => Self::All,
            Some(keys) => Self::only(keys),
        }
    }
}

impl From<AttributeFilter> for Option<Vec<String>> {
    fn from(filter: AttributeFilter) -> Self {
        match filter {
            AttributeFilter::All => None,
            AttributeFilter::Only(keys) => Some(keys.into_iter().collect()),
        }
    }
}

/// Patch that brings the allow-listed keys of `shared` in line with `local`.
///
/// Keys outside the allow-list, and keys that already agree, are left out so
/// concurrent writers to other attributes are never overwritten.
pub fn diff_attributes(filter: &AttributeFilter, shared: &Attrs, local: &Attrs) -> AttrPatch {
    attr_patch(&filter.filter(shared), &filter.filter(local))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShadowVariant {
    Element { children: Vec<NodeKey> },
    Text,
    LineBreak,
    Decorator { subdoc: Option<String> },
}

impl ShadowVariant {
    pub fn for_kind(kind: NodeKind, attrs: &Attrs) -> Self {
        match kind {
            NodeKind::Element => ShadowVariant::Element {
                children: Vec::new(),
            },
            NodeKind::Text => ShadowVariant::Text,
            NodeKind::LineBreak => ShadowVariant::LineBreak,
            NodeKind::Decorator => ShadowVariant::Decorator {
                subdoc: attrs
                    .get(SUBDOC_ATTR)
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            ShadowVariant::Element { .. } => NodeKind::Element,
            ShadowVariant::Text => NodeKind::Text,
            ShadowVariant::LineBreak => NodeKind::LineBreak,
            ShadowVariant::Decorator { .. } => NodeKind::Decorator,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowNode {
    pub key: NodeKey,
    pub parent: Option<NodeKey>,
    pub shared: SharedRef,
    pub identity: String,
    pub size: usize,
    pub variant: ShadowVariant,
}

impl ShadowNode {
    pub fn new(
        key: NodeKey,
        parent: Option<NodeKey>,
        shared: SharedRef,
        identity: String,
        variant: ShadowVariant,
    ) -> Self {
        let size = match variant {
            ShadowVariant::Element { .. } | ShadowVariant::Text => 0,
            ShadowVariant::LineBreak | ShadowVariant::Decorator { .. } => 1,
        };
        Self {
            key,
            parent,
            shared,
            identity,
            size,
            variant,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.variant.kind()
    }

    pub fn children(&self) -> &[NodeKey] {
        match &self.variant {
            ShadowVariant::Element { children } => children,
            _ => &[],
        }
    }

    /// Local node this shadow mirrors, or `None` if it was deleted locally.
    pub fn resolve_local<'a>(&self, snapshot: &'a Snapshot) -> Option<&'a LocalNode> {
        snapshot.get(&self.key)
    }
}

/// Arena of shadow nodes plus the reverse index from shared refs.
#[derive(Debug, Default)]
pub struct ShadowArena {
    nodes: HashMap<NodeKey, ShadowNode>,
    by_shared: HashMap<SharedRef, NodeKey>,
}

impl ShadowArena {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&ShadowNode> {
        self.nodes.get(key)
    }

    pub fn get_mut(&mut self, key: &NodeKey) -> Option<&mut ShadowNode> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn key_for(&self, shared: &SharedRef) -> Option<&NodeKey> {
        self.by_shared.get(shared)
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.nodes.keys()
    }

    pub fn insert(&mut self, node: ShadowNode) {
        if let Some(old) = self.nodes.get(&node.key) {
            if self.by_shared.get(&old.shared) == Some(&node.key) {
                self.by_shared.remove(&old.shared);
            }
        }
        self.by_shared.insert(node.shared.clone(), node.key.clone());
        self.nodes.insert(node.key.clone(), node);
    }

    /// Point `key` at a different shared node.
    pub fn rebind(&mut self, key: &NodeKey, shared: SharedRef) {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        if self.by_shared.get(&node.shared) == Some(key) {
            self.by_shared.remove(&node.shared);
        }
        node.shared = shared.clone();
        self.by_shared.insert(shared, key.clone());
    }

    pub fn children(&self, key: &NodeKey) -> &[NodeKey] {
        self.nodes.get(key).map(|n| n.children()).unwrap_or(&[])
    }

    pub fn children_mut(&mut self, key: &NodeKey) -> Option<&mut Vec<NodeKey>> {
        match &mut self.nodes.get_mut(key)?.variant {
            ShadowVariant::Element { children } => Some(children),
            _ => None,
        }
    }

    /// Unregister one shadow without touching its parent or children.
    pub fn remove_one(&mut self, key: &NodeKey) -> Option<ShadowNode> {
        let node = self.nodes.remove(key)?;
        if self.by_shared.get(&node.shared) == Some(key) {
            self.by_shared.remove(&node.shared);
        }
        Some(node)
    }

    /// Remove `key` and its shadow subtree. Returns the removed records.
    ///
    /// The parent's child list is left alone; callers splice it themselves
    /// so it stays aligned with the shared sequence.
    pub fn remove_subtree(&mut self, key: &NodeKey) -> Vec<ShadowNode> {
        let mut removed = Vec::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.remove_one(&current) {
                // Children that were re-parented elsewhere are not ours to drop.
                stack.extend(
                    node.children()
                        .iter()
                        .filter(|child| {
                            self.nodes.get(*child).and_then(|c| c.parent.as_ref()) == Some(&current)
                        })
                        .cloned(),
                );
                removed.push(node);
            }
        }
        removed
    }

    /// Contribution of `key` to its parent's size.
    pub fn contribution(&self, key: &NodeKey) -> usize {
        match self.nodes.get(key) {
            Some(node) if node.kind() == NodeKind::Text => node.size,
            Some(_) => 1,
            None => 0,
        }
    }

    pub fn size(&self, key: &NodeKey) -> usize {
        self.nodes.get(key).map(|n| n.size).unwrap_or(0)
    }

    /// Offset of `key` within its parent: the sum of prior siblings' contributions.
    pub fn offset(&self, key: &NodeKey) -> usize {
        let Some(parent) = self.nodes.get(key).and_then(|n| n.parent.as_ref()) else {
            return 0;
        };
        self.children(parent)
            .iter()
            .take_while(|sibling| *sibling != key)
            .map(|sibling| self.contribution(sibling))
            .sum()
    }

    /// Offset of `key` from the start of the document, walking the parent chain.
    pub fn absolute_offset(&self, key: &NodeKey) -> usize {
        let mut total = 0;
        let mut current = Some(key);
        while let Some(k) = current {
            total += self.offset(k);
            current = self.nodes.get(k).and_then(|n| n.parent.as_ref());
        }
        total
    }

    /// Set a text shadow's size and refresh its ancestors.
    pub fn set_text_size(&mut self, key: &NodeKey, size: usize) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.size = size;
        }
        let parent = self.nodes.get(key).and_then(|n| n.parent.clone());
        if let Some(parent) = parent {
            self.refresh_size(&parent);
        }
    }

    /// Recompute an element's size from its children, then its ancestors'.
    pub fn refresh_size(&mut self, key: &NodeKey) {
        let mut current = Some(key.clone());
        while let Some(k) = current {
            let size: usize = self
                .children(&k)
                .iter()
                .map(|child| self.contribution(child))
                .sum();
            let Some(node) = self.nodes.get_mut(&k) else {
                break;
            };
            if matches!(node.variant, ShadowVariant::Element { .. }) {
                node.size = size;
            }
            current = node.parent.clone();
        }
    }

    /// Keys of `key` and every shadow below it, pre-order.
    pub fn subtree(&self, key: &NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if !self.nodes.contains_key(&current) {
                continue;
            }
            for child in self.children(&current).iter().rev() {
                stack.push(child.clone());
            }
            out.push(current);
        }
        out
    }

    pub fn depth(&self, key: &NodeKey) -> usize {
        let mut depth = 0;
        let mut current = self.nodes.get(key).and_then(|n| n.parent.as_ref());
        while let Some(parent) = current {
            depth += 1;
            current = self.nodes.get(parent).and_then(|n| n.parent.as_ref());
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(key: &str, parent: Option<&str>, children: &[&str]) -> ShadowNode {
        ShadowNode::new(
            key.into(),
            parent.map(NodeKey::from),
            SharedRef::new(format!("s-{}", key)),
            key.to_string(),
            ShadowVariant::Element {
                children: children.iter().map(|c| NodeKey::from(*c)).collect(),
            },
        )
    }

    fn leaf(key: &str, parent: &str, variant: ShadowVariant) -> ShadowNode {
        ShadowNode::new(
            key.into(),
            Some(parent.into()),
            SharedRef::new(format!("s-{}", key)),
            key.to_string(),
            variant,
        )
    }

    fn arena() -> ShadowArena {
        let mut arena = ShadowArena::default();
        arena.insert(element("root", None, &["p1", "p2"]));
        arena.insert(element("p1", Some("root"), &["t1", "br", "t2"]));
        arena.insert(element("p2", Some("root"), &["t3"]));
        arena.insert(leaf("t1", "p1", ShadowVariant::Text));
        arena.insert(leaf("br", "p1", ShadowVariant::LineBreak));
        arena.insert(leaf("t2", "p1", ShadowVariant::Text));
        arena.insert(leaf("t3", "p2", ShadowVariant::Text));
        arena.set_text_size(&"t1".into(), 5);
        arena.set_text_size(&"t2".into(), 3);
        arena.set_text_size(&"t3".into(), 4);
        arena
    }

    #[test]
    fn test_sizes_propagate_to_ancestors() {
        let arena = arena();
        assert_eq!(arena.size(&"p1".into()), 9);
        assert_eq!(arena.size(&"p2".into()), 4);
        // Element children contribute one unit each.
        assert_eq!(arena.size(&"root".into()), 2);
    }

    #[test]
    fn test_offsets_walk_siblings_and_parents() {
        let arena = arena();
        assert_eq!(arena.offset(&"t1".into()), 0);
        assert_eq!(arena.offset(&"br".into()), 5);
        assert_eq!(arena.offset(&"t2".into()), 6);
        assert_eq!(arena.absolute_offset(&"t3".into()), 1);
    }

    #[test]
    fn test_remove_subtree_clears_reverse_index() {
        let mut arena = arena();
        let removed = arena.remove_subtree(&"p1".into());
        assert_eq!(removed.len(), 4);
        assert!(arena.key_for(&SharedRef::new("s-t1")).is_none());
        assert!(arena.contains(&"t3".into()));
    }

    #[test]
    fn test_rebind_moves_reverse_index() {
        let mut arena = arena();
        arena.rebind(&"t2".into(), SharedRef::new("s-new"));
        assert_eq!(arena.key_for(&SharedRef::new("s-new")), Some(&NodeKey::from("t2")));
        assert!(arena.key_for(&SharedRef::new("s-t2")).is_none());
    }

    #[test]
    fn test_diff_attributes_respects_allow_list() {
        let filter = AttributeFilter::only(["align"]);
        let mut shared = Attrs::new();
        shared.insert("align".into(), json!("left"));
        shared.insert("secret".into(), json!(1));
        let mut local = Attrs::new();
        local.insert("align".into(), json!("right"));
        local.insert("secret".into(), json!(2));

        let patch = diff_attributes(&filter, &shared, &local);
        assert_eq!(patch.set.len(), 1);
        assert_eq!(patch.set.get("align"), Some(&json!("right")));
        assert!(patch.removed.is_empty());
    }

    #[test]
    fn test_unchanged_attributes_produce_empty_patch() {
        let mut attrs = Attrs::new();
        attrs.insert("align".into(), json!("left"));
        assert!(diff_attributes(&AttributeFilter::All, &attrs, &attrs).is_empty());
    }

    #[test]
    fn test_filter_serde_roundtrip() {
        let filter: AttributeFilter = serde_json::from_str("[\"align\"]").unwrap();
        assert!(filter.allows("align"));
        assert!(!filter.allows("color"));
        let all: AttributeFilter = serde_json::from_str("null").unwrap();
        assert_eq!(all, AttributeFilter::All);
    }

    #[test]
    fn test_decorator_variant_reads_subdoc() {
        let mut attrs = Attrs::new();
        attrs.insert(SUBDOC_ATTR.into(), json!("table-1"));
        let variant = ShadowVariant::for_kind(NodeKind::Decorator, &attrs);
        assert_eq!(
            variant,
            ShadowVariant::Decorator {
                subdoc: Some("table-1".into())
            }
        );
    }
}
