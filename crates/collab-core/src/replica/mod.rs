//! Replica: Loro document holding the shared copy of the tree.
//!
//! Layout:
//! - `root`: LoroList of the root's child node maps
//! - `root_attrs`: LoroMap of the root's attributes
//!
//! Every other node is a LoroMap with:
//! - `kind`, `type`: node kind and schema type
//! - `id`: node identity (the creating client's key), preserved across moves
//! - `attrs`: LoroMap, last-writer-wins per attribute
//! - `children`: LoroList of node maps (elements) or `text`: LoroText (text nodes)

mod observer;
pub mod value;

pub use observer::{NodeState, attr_patch};

use crate::delta::{AttrPatch, DeltaBatch, Origin, SharedRef, SpanSnapshot};
use crate::peer_id::PeerId;
use crate::snapshot::{Attrs, NodeKind};
use crate::text;
use loro::cursor::{Cursor, Side};
use loro::{
    Container, ContainerID, ContainerTrait, ExportMode, LoroDoc, LoroList, LoroMap, LoroText,
    LoroValue, Subscription, ValueOrContainer, VersionVector,
};
use observer::DeltaObserver;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

const ROOT_CHILDREN: &str = "root";
const ROOT_ATTRS: &str = "root_attrs";
const KIND: &str = "kind";
const TYPE: &str = "type";
const ID: &str = "id";
const ATTRS: &str = "attrs";
const CHILDREN: &str = "children";
const TEXT: &str = "text";

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Unknown shared node: {0}")]
    UnknownNode(SharedRef),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

fn loro_err(e: impl std::fmt::Display) -> ReplicaError {
    ReplicaError::Loro(e.to_string())
}

/// Content of a node to write into the shared document.
#[derive(Debug, Clone)]
pub struct NodeSeed {
    pub identity: String,
    pub kind: NodeKind,
    pub node_type: String,
    pub attrs: Attrs,
    pub text: String,
    pub children: Vec<NodeSeed>,
}

/// Position resolved from an encoded cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCursor {
    /// UTF-16 offset for text cursors, child index for element cursors.
    pub offset: usize,
}

/// The shared tree as a Loro document.
///
/// Change events from the document are queued as container ids and mapped
/// back to the node that owns each container when `observe` runs, so an
/// observation only re-reads what changed.
pub struct Replica {
    doc: LoroDoc,
    handles: HashMap<SharedRef, LoroMap>,
    /// Container id to the node whose state it holds.
    owners: HashMap<ContainerID, SharedRef>,
    /// Containers registered per node, dropped with it.
    containers: HashMap<SharedRef, Vec<ContainerID>>,
    observer: DeltaObserver,
    changed: Arc<Mutex<Vec<ContainerID>>>,
    outbox: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Re-read from the root on the next observation.
    rescan: bool,
    last_scan: usize,
    _events: Subscription,
    _updates: Subscription,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Replica {
    /// Create an empty replica writing as `peer`.
    pub fn new(peer: PeerId) -> Self {
        let doc = LoroDoc::new();
        if let Err(e) = doc.set_peer_id(peer.as_u64()) {
            warn!("Could not set replica peer id to {}: {}", peer, e);
        }

        let changed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changed);
        let events = doc.subscribe_root(Arc::new(move |event| {
            let mut sink = lock(&sink);
            sink.extend(event.events.iter().map(|diff| diff.target.clone()));
        }));

        let outbox = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::clone(&outbox);
        let updates = doc.subscribe_local_update(Box::new(move |update| {
            trace!("Local update ({} bytes)", update.len());
            lock(&queue).push(update.to_vec());
            true
        }));

        let mut replica = Self {
            doc,
            handles: HashMap::new(),
            owners: HashMap::new(),
            containers: HashMap::new(),
            observer: DeltaObserver::default(),
            changed,
            outbox,
            rescan: true,
            last_scan: 0,
            _events: events,
            _updates: updates,
        };
        replica.register_root();
        replica
    }

    fn register_root(&mut self) {
        let root = SharedRef::root();
        self.owners
            .insert(self.doc.get_list(ROOT_CHILDREN).id(), root.clone());
        self.owners.insert(self.doc.get_map(ROOT_ATTRS).id(), root);
    }

    /// Create a replica from exported bytes.
    pub fn from_bytes(peer: PeerId, bytes: &[u8]) -> Result<Self> {
        let replica = Self::new(peer);
        replica.doc.import(bytes).map_err(loro_err)?;
        Ok(replica)
    }

    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.doc.peer_id())
    }

    pub fn is_empty(&self) -> bool {
        self.doc.get_list(ROOT_CHILDREN).is_empty()
    }

    fn node_map(&self, shared: &SharedRef) -> Result<&LoroMap> {
        self.handles
            .get(shared)
            .ok_or_else(|| ReplicaError::UnknownNode(shared.clone()))
    }

    fn children_list(&self, shared: &SharedRef) -> Result<LoroList> {
        if shared.is_root() {
            return Ok(self.doc.get_list(ROOT_CHILDREN));
        }
        child_list(self.node_map(shared)?).ok_or_else(|| ReplicaError::UnknownNode(shared.clone()))
    }

    fn attrs_map(&self, shared: &SharedRef) -> Result<LoroMap> {
        if shared.is_root() {
            return Ok(self.doc.get_map(ROOT_ATTRS));
        }
        child_attrs(self.node_map(shared)?).ok_or_else(|| ReplicaError::UnknownNode(shared.clone()))
    }

    fn text_handle(&self, shared: &SharedRef) -> Result<LoroText> {
        child_text(self.node_map(shared)?).ok_or_else(|| ReplicaError::UnknownNode(shared.clone()))
    }

    pub fn contains(&self, shared: &SharedRef) -> bool {
        shared.is_root() || self.handles.contains_key(shared)
    }

    /// Shared refs of an element's children, in sequence order.
    pub fn children(&self, shared: &SharedRef) -> Result<Vec<SharedRef>> {
        let list = self.children_list(shared)?;
        Ok((0..list.len())
            .filter_map(|i| match list.get(i) {
                Some(ValueOrContainer::Container(Container::Map(map))) => {
                    Some(SharedRef::new(map.id().to_string()))
                }
                _ => None,
            })
            .collect())
    }

    pub fn text(&self, shared: &SharedRef) -> Result<String> {
        Ok(self.text_handle(shared)?.to_string())
    }

    pub fn attrs(&self, shared: &SharedRef) -> Result<Attrs> {
        Ok(value::loro_map_to_attrs(&self.attrs_map(shared)?.get_deep_value()))
    }

    /// Live content length, as tracked by the shadow mirror.
    pub fn size(&self, shared: &SharedRef) -> Result<usize> {
        if shared.is_root() {
            return self.element_size(shared);
        }
        let map = self.node_map(shared)?;
        match read_kind(map) {
            Some(NodeKind::Text) => Ok(text::utf16_len(&self.text(shared)?)),
            Some(NodeKind::Element) => self.element_size(shared),
            _ => Ok(1),
        }
    }

    fn element_size(&self, shared: &SharedRef) -> Result<usize> {
        let mut size = 0;
        for child in self.children(shared)? {
            size += match self.handles.get(&child).and_then(read_kind) {
                Some(NodeKind::Text) => text::utf16_len(&self.text(&child)?),
                _ => 1,
            };
        }
        Ok(size)
    }

    /// Insert `seed` (and its subtree) under `parent` at `index`.
    ///
    /// Returns the shared refs created, in pre-order of the seed tree.
    pub fn insert_node(
        &mut self,
        parent: &SharedRef,
        index: usize,
        seed: &NodeSeed,
    ) -> Result<Vec<SharedRef>> {
        let list = self.children_list(parent)?;
        let index = index.min(list.len());
        let mut created = Vec::new();
        self.write_node(&list, index, seed, &mut created)?;
        Ok(created)
    }

    fn write_node(
        &mut self,
        list: &LoroList,
        index: usize,
        seed: &NodeSeed,
        created: &mut Vec<SharedRef>,
    ) -> Result<()> {
        let map = list.insert_container(index, LoroMap::new()).map_err(loro_err)?;
        map.insert(KIND, seed.kind.as_str()).map_err(loro_err)?;
        map.insert(TYPE, seed.node_type.as_str()).map_err(loro_err)?;
        map.insert(ID, seed.identity.as_str()).map_err(loro_err)?;
        let attrs = map.insert_container(ATTRS, LoroMap::new()).map_err(loro_err)?;
        for (key, value) in &seed.attrs {
            attrs.insert(key, value.clone()).map_err(loro_err)?;
        }

        let shared = SharedRef::new(map.id().to_string());
        created.push(shared.clone());
        match seed.kind {
            NodeKind::Element => {
                let children = map.insert_container(CHILDREN, LoroList::new()).map_err(loro_err)?;
                self.register(&shared, &map);
                for (i, child) in seed.children.iter().enumerate() {
                    self.write_node(&children, i, child, created)?;
                }
            }
            NodeKind::Text => {
                let content = map.insert_container(TEXT, LoroText::new()).map_err(loro_err)?;
                content.insert(0, &seed.text).map_err(loro_err)?;
                self.register(&shared, &map);
            }
            NodeKind::LineBreak | NodeKind::Decorator => {
                self.register(&shared, &map);
            }
        }
        Ok(())
    }

    /// Remove the child at `index` of `parent`.
    pub fn remove_child(&mut self, parent: &SharedRef, index: usize) -> Result<()> {
        let list = self.children_list(parent)?;
        if index >= list.len() {
            return Err(ReplicaError::Encoding(format!(
                "child index {} out of range for {} ({} children)",
                index,
                parent,
                list.len()
            )));
        }
        list.delete(index, 1).map_err(loro_err)
    }

    /// Replace `delete` UTF-16 units at `index` with `insert`.
    pub fn splice_text(
        &mut self,
        shared: &SharedRef,
        index: usize,
        delete: usize,
        insert: &str,
    ) -> Result<()> {
        let content = self.text_handle(shared)?;
        let current = content.to_string();
        let start = text::utf16_to_char(&current, index);
        let end = text::utf16_to_char(&current, text::char_to_utf16(&current, start) + delete);
        if end > start {
            content.delete(start, end - start).map_err(loro_err)?;
        }
        if !insert.is_empty() {
            content.insert(start, insert).map_err(loro_err)?;
        }
        Ok(())
    }

    /// Write only the keys named in `patch`.
    pub fn apply_attr_patch(&mut self, shared: &SharedRef, patch: &AttrPatch) -> Result<()> {
        let attrs = self.attrs_map(shared)?;
        for key in &patch.removed {
            attrs.delete(key).map_err(loro_err)?;
        }
        for (key, value) in &patch.set {
            attrs.insert(key, value.clone()).map_err(loro_err)?;
        }
        Ok(())
    }

    /// Close the current transaction.
    pub fn commit(&self) {
        self.doc.commit();
    }

    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    pub fn encoded_version(&self) -> Vec<u8> {
        self.version().encode()
    }

    /// Export updates the holder of `version` is missing.
    pub fn export_since(&self, version: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(version))
            .map_err(|e| ReplicaError::Encoding(e.to_string()))
    }

    /// Export updates relative to an encoded version vector. Empty means everything.
    pub fn export_since_encoded(&self, version: &[u8]) -> Result<Vec<u8>> {
        if version.is_empty() {
            return self
                .doc
                .export(ExportMode::all_updates())
                .map_err(|e| ReplicaError::Encoding(e.to_string()));
        }
        let version = VersionVector::decode(version)
            .map_err(|e| ReplicaError::Encoding(e.to_string()))?;
        self.export_since(&version)
    }

    pub fn import(&mut self, bytes: &[u8]) -> Result<()> {
        self.doc.import(bytes).map_err(loro_err)?;
        debug!("Imported {} bytes", bytes.len());
        Ok(())
    }

    /// Report what changed since the last observation.
    ///
    /// Only nodes named by queued change events are re-read, plus the
    /// subtrees of children the observer has not seen yet.
    pub fn observe(&mut self, origin: Origin) -> Vec<DeltaBatch> {
        self.commit();
        let touched = std::mem::take(&mut *lock(&self.changed));

        let mut changed = Vec::new();
        let mut seen = HashSet::new();
        if std::mem::take(&mut self.rescan) {
            seen.insert(SharedRef::root());
            changed.push(SharedRef::root());
        }
        for id in &touched {
            match self.owner_of(id) {
                Some(owner) => {
                    if seen.insert(owner.clone()) {
                        changed.push(owner);
                    }
                }
                None => trace!("No node owns container {}", id),
            }
        }

        let mut fresh = HashMap::new();
        for shared in &changed {
            let Some(state) = self.read_state(shared) else {
                continue;
            };
            for child in &state.children {
                if !self.observer.contains(child) {
                    self.read_subtree(child, &mut fresh);
                }
            }
            fresh.insert(shared.clone(), state);
        }
        self.last_scan = fresh.len();

        let (batches, pruned) = self.observer.apply(&changed, &fresh, origin);
        for shared in &pruned {
            self.forget(shared);
        }
        if !changed.is_empty() {
            debug!(
                "Observed {} changed nodes, read {}, {} batches, {} dropped",
                changed.len(),
                self.last_scan,
                batches.len(),
                pruned.len()
            );
        }
        batches
    }

    /// Drop the observation index; the next `observe` re-delivers everything.
    pub fn reset_observer(&mut self) {
        self.observer.reset();
        self.handles.clear();
        self.owners.clear();
        self.containers.clear();
        lock(&self.changed).clear();
        self.register_root();
        self.rescan = true;
    }

    /// Update bytes of every local commit since the last call, oldest first.
    pub fn take_local_updates(&self) -> Vec<Vec<u8>> {
        self.commit();
        std::mem::take(&mut *lock(&self.outbox))
    }

    fn owner_of(&self, id: &ContainerID) -> Option<SharedRef> {
        if let Some(owner) = self.owners.get(id) {
            return Some(owner.clone());
        }
        // Containers we never read: fall back to the closest registered ancestor.
        let path = self.doc.get_path_to_container(id)?;
        path.iter()
            .rev()
            .find_map(|(ancestor, _)| self.owners.get(ancestor).cloned())
    }

    fn register(&mut self, shared: &SharedRef, map: &LoroMap) {
        let mut ids = vec![map.id()];
        if let Some(attrs) = child_attrs(map) {
            ids.push(attrs.id());
        }
        if let Some(children) = child_list(map) {
            ids.push(children.id());
        }
        if let Some(content) = child_text(map) {
            ids.push(content.id());
        }
        for id in &ids {
            self.owners.insert(id.clone(), shared.clone());
        }
        self.containers
            .entry(shared.clone())
            .or_default()
            .extend(ids);
        self.handles.insert(shared.clone(), map.clone());
    }

    fn forget(&mut self, shared: &SharedRef) {
        self.handles.remove(shared);
        for id in self.containers.remove(shared).unwrap_or_default() {
            if self.owners.get(&id) == Some(shared) {
                self.owners.remove(&id);
            }
        }
    }

    /// Current state of `shared`, or `None` once it left the document.
    fn read_state(&mut self, shared: &SharedRef) -> Option<NodeState> {
        if shared.is_root() {
            let list = self.doc.get_list(ROOT_CHILDREN);
            let mut root = NodeState::empty_root();
            root.attrs = value::loro_map_to_attrs(&self.doc.get_map(ROOT_ATTRS).get_deep_value());
            root.children = self.read_children(&list, shared);
            return Some(root);
        }
        let map = self.handles.get(shared)?.clone();
        if map.is_deleted() {
            return None;
        }
        self.node_state(shared, &map)
    }

    fn read_subtree(&mut self, shared: &SharedRef, fresh: &mut HashMap<SharedRef, NodeState>) {
        let Some(state) = self.read_state(shared) else {
            return;
        };
        for child in &state.children {
            self.read_subtree(child, fresh);
        }
        fresh.insert(shared.clone(), state);
    }

    fn node_state(&mut self, shared: &SharedRef, map: &LoroMap) -> Option<NodeState> {
        let kind = read_kind(map)?;
        let children = match child_list(map) {
            Some(list) if kind == NodeKind::Element => self.read_children(&list, shared),
            _ => Vec::new(),
        };
        Some(NodeState {
            kind,
            node_type: read_string(map, TYPE).unwrap_or_else(|| kind.as_str().to_string()),
            identity: read_string(map, ID).unwrap_or_else(|| shared.to_string()),
            attrs: child_attrs(map)
                .map(|attrs| value::loro_map_to_attrs(&attrs.get_deep_value()))
                .unwrap_or_default(),
            text: child_text(map).map(|t| t.to_string()).unwrap_or_default(),
            children,
        })
    }

    /// Refs of the complete node maps in `list`, registering each one.
    fn read_children(&mut self, list: &LoroList, parent: &SharedRef) -> Vec<SharedRef> {
        let mut refs = Vec::with_capacity(list.len());
        for i in 0..list.len() {
            let Some(ValueOrContainer::Container(Container::Map(map))) = list.get(i) else {
                continue;
            };
            if read_kind(&map).is_none() {
                // Half-written node from a peer that has not delivered the rest
                // yet; its completion shows up as a change of the parent.
                self.owners.insert(map.id(), parent.clone());
                self.containers
                    .entry(parent.clone())
                    .or_default()
                    .push(map.id());
                continue;
            }
            let shared = SharedRef::new(map.id().to_string());
            self.register(&shared, &map);
            refs.push(shared);
        }
        refs
    }

    /// Nodes read by the last observation.
    #[cfg(test)]
    fn last_scan(&self) -> usize {
        self.last_scan
    }

    pub fn observer_epoch(&self) -> u64 {
        self.observer.epoch()
    }

    /// Last observed state of `shared` and its subtree.
    pub fn snapshot_span(&self, shared: &SharedRef) -> Option<SpanSnapshot> {
        self.observer.span(shared)
    }

    pub fn observed_state(&self, shared: &SharedRef) -> Option<&NodeState> {
        self.observer.state(shared)
    }

    /// Encode a relocatable position inside a text node.
    pub fn text_cursor(&self, shared: &SharedRef, offset: usize) -> Option<Vec<u8>> {
        let content = self.text_handle(shared).ok()?;
        let pos = text::utf16_to_char(&content.to_string(), offset);
        content.get_cursor(pos, Side::default()).map(|c| c.encode())
    }

    /// Encode a relocatable position between an element's children.
    pub fn child_cursor(&self, shared: &SharedRef, index: usize) -> Option<Vec<u8>> {
        let list = self.children_list(shared).ok()?;
        list.get_cursor(index.min(list.len()), Side::default())
            .map(|c| c.encode())
    }

    /// Resolve a cursor from `text_cursor` against the current text of `shared`.
    pub fn resolve_text_cursor(
        &self,
        shared: &SharedRef,
        encoded: &[u8],
    ) -> Option<ResolvedCursor> {
        let pos = self.resolve_raw(encoded)?;
        let current = self.text(shared).ok()?;
        let chars = pos.min(current.chars().count());
        Some(ResolvedCursor {
            offset: text::char_to_utf16(&current, chars),
        })
    }

    pub fn resolve_child_cursor(
        &self,
        shared: &SharedRef,
        encoded: &[u8],
    ) -> Option<ResolvedCursor> {
        let pos = self.resolve_raw(encoded)?;
        let len = self.children_list(shared).ok()?.len();
        Some(ResolvedCursor {
            offset: pos.min(len),
        })
    }

    fn resolve_raw(&self, encoded: &[u8]) -> Option<usize> {
        let cursor = Cursor::decode(encoded).ok()?;
        let result = self.doc.get_cursor_pos(&cursor).ok()?;
        Some(result.current.pos)
    }
}

fn read_string(map: &LoroMap, key: &str) -> Option<String> {
    match map.get(key)? {
        ValueOrContainer::Value(LoroValue::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn read_kind(map: &LoroMap) -> Option<NodeKind> {
    read_string(map, KIND).and_then(|kind| NodeKind::parse(&kind))
}

fn child_list(map: &LoroMap) -> Option<LoroList> {
    match map.get(CHILDREN)? {
        ValueOrContainer::Container(Container::List(list)) => Some(list),
        _ => None,
    }
}

fn child_attrs(map: &LoroMap) -> Option<LoroMap> {
    match map.get(ATTRS)? {
        ValueOrContainer::Container(Container::Map(attrs)) => Some(attrs),
        _ => None,
    }
}

fn child_text(map: &LoroMap) -> Option<LoroText> {
    match map.get(TEXT)? {
        ValueOrContainer::Container(Container::Text(text)) => Some(text),
        _ => None,
    }
}
