//! Immutable local document snapshots.
//!
//! Nodes live in a flat arena keyed by `NodeKey`; parent and child relations
//! are key references. A `SnapshotDraft` is the only way to derive a new
//! snapshot and records which keys it touched.

use crate::text;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Attribute map carried by every node.
pub type Attrs = BTreeMap<String, serde_json::Value>;

/// Opaque key of a node in the local document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(String);

impl NodeKey {
    pub const ROOT: &'static str = "root";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Element,
    Text,
    LineBreak,
    Decorator,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Element => "element",
            NodeKind::Text => "text",
            NodeKind::LineBreak => "linebreak",
            NodeKind::Decorator => "decorator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "element" => Some(NodeKind::Element),
            "text" => Some(NodeKind::Text),
            "linebreak" => Some(NodeKind::LineBreak),
            "decorator" => Some(NodeKind::Decorator),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Element)
    }
}

/// One node of a local snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalNode {
    pub key: NodeKey,
    pub kind: NodeKind,
    /// Schema type tag ("paragraph", "heading", "image", ...).
    pub node_type: String,
    pub parent: Option<NodeKey>,
    pub children: Vec<NodeKey>,
    pub text: String,
    pub attrs: Attrs,
}

impl LocalNode {
    fn from_spec(key: NodeKey, spec: &NodeSpec, parent: Option<NodeKey>) -> Self {
        Self {
            key,
            kind: spec.kind,
            node_type: spec.node_type.clone(),
            parent,
            children: Vec::new(),
            text: if spec.kind == NodeKind::Text {
                spec.text.clone()
            } else {
                String::new()
            },
            attrs: spec.attrs.clone(),
        }
    }
}

/// Builder describing a subtree to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub key: Option<NodeKey>,
    pub kind: NodeKind,
    pub node_type: String,
    pub attrs: Attrs,
    pub text: String,
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    fn new(kind: NodeKind, node_type: &str) -> Self {
        Self {
            key: None,
            kind,
            node_type: node_type.to_string(),
            attrs: Attrs::new(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn element(node_type: &str) -> Self {
        Self::new(NodeKind::Element, node_type)
    }

    pub fn paragraph() -> Self {
        Self::element("paragraph")
    }

    pub fn text(content: &str) -> Self {
        let mut spec = Self::new(NodeKind::Text, "text");
        spec.text = content.to_string();
        spec
    }

    pub fn line_break() -> Self {
        Self::new(NodeKind::LineBreak, "linebreak")
    }

    pub fn decorator(node_type: &str) -> Self {
        Self::new(NodeKind::Decorator, node_type)
    }

    pub fn with_key(mut self, key: impl Into<NodeKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_attr(mut self, name: &str, value: serde_json::Value) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn with_child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = NodeSpec>) -> Self {
        self.children.extend(children);
        self
    }

    /// Capture an existing subtree, keys included.
    pub fn capture(snapshot: &Snapshot, key: &NodeKey) -> Option<Self> {
        let node = snapshot.get(key)?;
        Some(Self {
            key: Some(node.key.clone()),
            kind: node.kind,
            node_type: node.node_type.clone(),
            attrs: node.attrs.clone(),
            text: node.text.clone(),
            children: node
                .children
                .iter()
                .filter_map(|child| Self::capture(snapshot, child))
                .collect(),
        })
    }

    /// Keys of this spec and all descendants that carry one.
    pub fn keys(&self) -> Vec<NodeKey> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys(&self, out: &mut Vec<NodeKey>) {
        if let Some(key) = &self.key {
            out.push(key.clone());
        }
        for child in &self.children {
            child.collect_keys(out);
        }
    }
}

impl From<String> for NodeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Immutable tree of local nodes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Snapshot {
    nodes: Arc<HashMap<NodeKey, LocalNode>>,
    epoch: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// An empty document: just the root element.
    pub fn new() -> Self {
        let root = LocalNode {
            key: NodeKey::root(),
            kind: NodeKind::Element,
            node_type: "root".to_string(),
            parent: None,
            children: Vec::new(),
            text: String::new(),
            attrs: Attrs::new(),
        };
        let mut nodes = HashMap::new();
        nodes.insert(root.key.clone(), root);
        Self {
            nodes: Arc::new(nodes),
            epoch: 0,
        }
    }

    /// Build a document whose root holds `children`.
    pub fn from_specs(children: impl IntoIterator<Item = NodeSpec>) -> Self {
        let base = Self::new();
        let mut draft = SnapshotDraft::new(&base);
        let root = NodeKey::root();
        for spec in children {
            draft.append(&root, spec);
        }
        draft.into_snapshot()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn root(&self) -> NodeKey {
        NodeKey::root()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&LocalNode> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.get(&NodeKey::root())
            .map(|root| root.children.is_empty())
            .unwrap_or(true)
    }

    pub fn children(&self, key: &NodeKey) -> &[NodeKey] {
        self.nodes
            .get(key)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn text(&self, key: &NodeKey) -> Option<&str> {
        self.nodes.get(key).map(|node| node.text.as_str())
    }

    pub fn parent(&self, key: &NodeKey) -> Option<&NodeKey> {
        self.nodes.get(key).and_then(|node| node.parent.as_ref())
    }

    pub fn index_in_parent(&self, key: &NodeKey) -> Option<usize> {
        let parent = self.parent(key)?;
        self.children(parent).iter().position(|k| k == key)
    }

    /// Number of ancestors between `key` and the root.
    pub fn depth(&self, key: &NodeKey) -> usize {
        let mut depth = 0;
        let mut current = self.parent(key);
        while let Some(parent) = current {
            depth += 1;
            current = self.parent(parent);
        }
        depth
    }

    pub fn is_ancestor(&self, ancestor: &NodeKey, key: &NodeKey) -> bool {
        let mut current = self.parent(key);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent(parent);
        }
        false
    }

    /// Keys of the subtree rooted at `key`, pre-order.
    pub fn descendants(&self, key: &NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            for child in self.children(&current).iter().rev() {
                stack.push(child.clone());
            }
            out.push(current);
        }
        out
    }

    /// Concatenated text content with one newline between top-level blocks.
    pub fn plain_text(&self) -> String {
        self.children(&NodeKey::root())
            .iter()
            .map(|block| self.text_content(block))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn text_content(&self, key: &NodeKey) -> String {
        let Some(node) = self.get(key) else {
            return String::new();
        };
        match node.kind {
            NodeKind::Text => node.text.clone(),
            NodeKind::LineBreak => "\n".to_string(),
            NodeKind::Decorator => String::new(),
            NodeKind::Element => node
                .children
                .iter()
                .map(|child| self.text_content(child))
                .collect(),
        }
    }

    /// Key-agnostic dump of the tree, used to compare replicas.
    pub fn structure(&self) -> serde_json::Value {
        self.structure_of(&NodeKey::root())
    }

    fn structure_of(&self, key: &NodeKey) -> serde_json::Value {
        let Some(node) = self.get(key) else {
            return serde_json::Value::Null;
        };
        let mut out = serde_json::Map::new();
        out.insert("kind".into(), node.kind.as_str().into());
        out.insert("type".into(), node.node_type.clone().into());
        if !node.attrs.is_empty() {
            out.insert(
                "attrs".into(),
                serde_json::Value::Object(node.attrs.clone().into_iter().collect()),
            );
        }
        match node.kind {
            NodeKind::Text => {
                out.insert("text".into(), node.text.clone().into());
            }
            NodeKind::Element => {
                let children = node
                    .children
                    .iter()
                    .map(|child| self.structure_of(child))
                    .collect();
                out.insert("children".into(), serde_json::Value::Array(children));
            }
            _ => {}
        }
        serde_json::Value::Object(out)
    }
}

/// Mutable working copy of a snapshot plus its dirty bookkeeping.
pub struct SnapshotDraft {
    nodes: HashMap<NodeKey, LocalNode>,
    epoch: u64,
    dirty_containers: HashSet<NodeKey>,
    dirty_leaves: HashSet<NodeKey>,
    normalized: HashSet<NodeKey>,
}

impl SnapshotDraft {
    pub fn new(base: &Snapshot) -> Self {
        Self {
            nodes: (*base.nodes).clone(),
            epoch: base.epoch + 1,
            dirty_containers: HashSet::new(),
            dirty_leaves: HashSet::new(),
            normalized: HashSet::new(),
        }
    }

    pub fn get(&self, key: &NodeKey) -> Option<&LocalNode> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn children(&self, key: &NodeKey) -> &[NodeKey] {
        self.nodes
            .get(key)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn text(&self, key: &NodeKey) -> Option<&str> {
        self.nodes.get(key).map(|node| node.text.as_str())
    }

    pub fn parent(&self, key: &NodeKey) -> Option<&NodeKey> {
        self.nodes.get(key).and_then(|node| node.parent.as_ref())
    }

    fn mark_dirty(&mut self, key: &NodeKey) {
        match self.nodes.get(key).map(|node| node.kind) {
            Some(NodeKind::Element) => {
                self.dirty_containers.insert(key.clone());
            }
            Some(_) => {
                self.dirty_leaves.insert(key.clone());
            }
            None => {}
        }
    }

    /// Append `spec` as the last child of `parent`.
    pub fn append(&mut self, parent: &NodeKey, spec: NodeSpec) -> Option<NodeKey> {
        let index = self.children(parent).len();
        self.insert(parent, index, spec)
    }

    /// Insert `spec` at `index` under `parent` (clamped). Returns the new key.
    ///
    /// Spec keys that are already taken are replaced by fresh ones.
    pub fn insert(&mut self, parent: &NodeKey, index: usize, spec: NodeSpec) -> Option<NodeKey> {
        if self.nodes.get(parent)?.kind != NodeKind::Element {
            tracing::warn!("Cannot insert into non-element {}", parent);
            return None;
        }
        let key = self.create_subtree(&spec, Some(parent.clone()));
        self.link(parent, index, &key);
        Some(key)
    }

    fn create_subtree(&mut self, spec: &NodeSpec, parent: Option<NodeKey>) -> NodeKey {
        let key = match &spec.key {
            Some(key) if !self.nodes.contains_key(key) => key.clone(),
            _ => NodeKey::generate(),
        };
        let node = LocalNode::from_spec(key.clone(), spec, parent);
        self.nodes.insert(key.clone(), node);
        self.mark_dirty(&key);
        if spec.kind == NodeKind::Element {
            let mut children = Vec::with_capacity(spec.children.len());
            for child in &spec.children {
                children.push(self.create_subtree(child, Some(key.clone())));
            }
            if let Some(node) = self.nodes.get_mut(&key) {
                node.children = children;
            }
        }
        key
    }

    fn link(&mut self, parent: &NodeKey, index: usize, key: &NodeKey) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.parent = Some(parent.clone());
        }
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            let index = index.min(parent_node.children.len());
            parent_node.children.insert(index, key.clone());
        }
        self.dirty_containers.insert(parent.clone());
    }

    /// Remove a node and its subtree. The root cannot be removed.
    pub fn remove(&mut self, key: &NodeKey) -> bool {
        if key.is_root() || !self.nodes.contains_key(key) {
            return false;
        }
        self.detach(key);
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
            }
            self.dirty_containers.remove(&current);
            self.dirty_leaves.remove(&current);
            self.normalized.remove(&current);
        }
        true
    }

    /// Unlink a node from its parent but keep its subtree in the arena.
    ///
    /// Nodes still detached when the draft finishes are dropped.
    pub fn detach(&mut self, key: &NodeKey) -> Option<usize> {
        let parent = self.nodes.get_mut(key)?.parent.take()?;
        let parent_node = self.nodes.get_mut(&parent)?;
        let index = parent_node.children.iter().position(|k| k == key)?;
        parent_node.children.remove(index);
        self.dirty_containers.insert(parent);
        Some(index)
    }

    /// Link a detached node under `parent` at `index` (clamped).
    pub fn attach(&mut self, key: &NodeKey, parent: &NodeKey, index: usize) -> bool {
        let attachable = matches!(self.nodes.get(key), Some(node) if node.parent.is_none())
            && matches!(self.nodes.get(parent), Some(node) if node.kind == NodeKind::Element)
            && !key.is_root()
            && key != parent;
        if !attachable {
            return false;
        }
        self.link(parent, index, key);
        true
    }

    /// Move a node (and subtree) to `parent` at `index`.
    ///
    /// Nothing changes when the move is invalid: unknown nodes, the root, a
    /// non-element target or a target inside the moved subtree.
    pub fn move_node(&mut self, key: &NodeKey, parent: &NodeKey, index: usize) -> bool {
        let movable = self.nodes.contains_key(key)
            && matches!(self.nodes.get(parent), Some(node) if node.kind == NodeKind::Element)
            && !key.is_root()
            && key != parent
            && !self.is_ancestor(key, parent);
        if !movable {
            return false;
        }
        self.detach(key);
        self.attach(key, parent, index)
    }

    /// Whether `key` hangs off the root, so `finish` keeps it.
    pub fn is_attached(&self, key: &NodeKey) -> bool {
        let mut current = key;
        loop {
            if current.is_root() {
                return self.nodes.contains_key(current);
            }
            match self.parent(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn is_ancestor(&self, ancestor: &NodeKey, key: &NodeKey) -> bool {
        let mut current = self.parent(key);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent(parent);
        }
        false
    }

    pub fn set_text(&mut self, key: &NodeKey, content: &str) -> bool {
        match self.nodes.get_mut(key) {
            Some(node) if node.kind == NodeKind::Text => {
                if node.text != content {
                    node.text = content.to_string();
                    self.dirty_leaves.insert(key.clone());
                }
                true
            }
            _ => false,
        }
    }

    /// Splice text at a UTF-16 offset. Offsets are clamped.
    pub fn splice_text(
        &mut self,
        key: &NodeKey,
        index_utf16: usize,
        delete_utf16: usize,
        insert: &str,
    ) -> bool {
        let Some(current) = self.text(key) else {
            return false;
        };
        let updated = text::splice_utf16(current, index_utf16, delete_utf16, insert);
        self.set_text(key, &updated)
    }

    pub fn set_attr(&mut self, key: &NodeKey, name: &str, value: serde_json::Value) -> bool {
        let Some(node) = self.nodes.get_mut(key) else {
            return false;
        };
        if node.attrs.get(name) == Some(&value) {
            return true;
        }
        node.attrs.insert(name.to_string(), value);
        self.mark_dirty(key);
        true
    }

    pub fn remove_attr(&mut self, key: &NodeKey, name: &str) -> bool {
        let Some(node) = self.nodes.get_mut(key) else {
            return false;
        };
        if node.attrs.remove(name).is_some() {
            self.mark_dirty(key);
        }
        true
    }

    /// Record that a normalization pass rewrote `key`.
    pub fn mark_normalized(&mut self, key: &NodeKey) {
        if self.nodes.contains_key(key) {
            self.normalized.insert(key.clone());
        }
    }

    /// Remove every child of `key`.
    pub fn clear_children(&mut self, key: &NodeKey) {
        let children = self.children(key).to_vec();
        for child in children {
            self.remove(&child);
        }
    }

    /// Finish the draft, dropping nodes that are still detached.
    pub(crate) fn finish(
        mut self,
    ) -> (Snapshot, HashSet<NodeKey>, HashSet<NodeKey>, HashSet<NodeKey>) {
        let orphans: Vec<NodeKey> = self
            .nodes
            .values()
            .filter(|node| node.parent.is_none() && !node.key.is_root())
            .map(|node| node.key.clone())
            .collect();
        for orphan in orphans {
            let mut stack = vec![orphan];
            while let Some(current) = stack.pop() {
                if let Some(node) = self.nodes.remove(&current) {
                    stack.extend(node.children);
                }
            }
        }
        let nodes = self.nodes;
        self.dirty_containers.retain(|k| nodes.contains_key(k));
        self.dirty_leaves.retain(|k| nodes.contains_key(k));
        self.normalized.retain(|k| nodes.contains_key(k));
        let snapshot = Snapshot {
            nodes: Arc::new(nodes),
            epoch: self.epoch,
        };
        (
            snapshot,
            self.dirty_containers,
            self.dirty_leaves,
            self.normalized,
        )
    }

    pub fn into_snapshot(self) -> Snapshot {
        self.finish().0
    }
}
