//! Binding: session-scoped state tying the local document to the replica.
//!
//! Owns the shadow arena, sub-documents, the remote cursor table, the
//! attribute allow-list, the out-of-order delta buffer and every provider
//! subscription the session registered. Dropping or destroying it releases
//! all of them.

use crate::cursor::RemoteCursor;
use crate::delta::{BatchId, DeltaBatch, SharedRef};
use crate::events::Subscription;
use crate::model::DocumentModel;
use crate::peer_id::PeerId;
use crate::provider::Provider;
use crate::replica::Replica;
use crate::shadow::{AttributeFilter, ShadowArena, ShadowNode, ShadowVariant};
use crate::snapshot::{Attrs, NodeKey, NodeKind, Snapshot};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use thiserror::Error;
use tracing::{debug, info, warn};

const SEEN_BATCH_WINDOW: usize = 4096;
const TOMBSTONE_WINDOW: usize = 4096;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("Shadow for {key} is inconsistent: {detail}")]
    Inconsistent { key: NodeKey, detail: String },
}

pub type Result<T> = std::result::Result<T, BindingError>;

/// Insertion-ordered set that forgets its oldest entries past `capacity`.
#[derive(Debug)]
pub struct BoundedSet<T> {
    order: VecDeque<T>,
    items: HashSet<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            items: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the item was already present.
    pub fn insert(&mut self, item: T) -> bool {
        if !self.items.insert(item.clone()) {
            return false;
        }
        self.order.push_back(item);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.items.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    pub fn remove(&mut self, item: &T) {
        if self.items.remove(item) {
            self.order.retain(|i| i != item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.items.clear();
    }
}

/// Counters describing what the engine did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub pushes: usize,
    pub skipped_pushes: usize,
    pub transactions: usize,
    pub pulls: usize,
    pub echoes_dropped: usize,
    pub duplicates_dropped: usize,
    pub buffered: usize,
    pub moves: usize,
    pub heals: usize,
}

pub struct Binding {
    client_id: PeerId,
    session_id: String,
    pub(crate) replica: Replica,
    pub(crate) shadows: ShadowArena,
    subdocs: HashMap<String, Replica>,
    pub(crate) cursors: HashMap<PeerId, RemoteCursor>,
    pub(crate) filter: AttributeFilter,
    pub(crate) pending: Vec<DeltaBatch>,
    pub(crate) seen: BoundedSet<BatchId>,
    pub(crate) tombstones: BoundedSet<SharedRef>,
    pub(crate) stats: SyncStats,
    /// A push failed part way; shadows no longer mirror the replica.
    pub(crate) needs_reload: bool,
    subscriptions: Vec<Subscription>,
}

/// Create the binding for one collaboration session.
///
/// `doc` is an existing replica to attach to; a fresh one is created
/// otherwise. `subdocs` pre-registers embedded sub-documents by id.
pub fn create_binding<M: DocumentModel, P: Provider + ?Sized>(
    model: &M,
    provider: &P,
    session_id: &str,
    doc: Option<Replica>,
    subdocs: HashMap<String, Replica>,
) -> Binding {
    let client_id = provider.client_id();
    let replica = doc.unwrap_or_else(|| Replica::new(client_id));
    let binding = Binding::new(client_id, session_id, replica, subdocs);
    debug!(
        "Created binding {} for {} ({} local nodes)",
        session_id,
        client_id,
        model.snapshot().len()
    );
    binding
}

impl Binding {
    pub fn new(
        client_id: PeerId,
        session_id: &str,
        replica: Replica,
        subdocs: HashMap<String, Replica>,
    ) -> Self {
        let mut shadows = ShadowArena::default();
        shadows.insert(Self::root_shadow());
        Self {
            client_id,
            session_id: session_id.to_string(),
            replica,
            shadows,
            subdocs,
            cursors: HashMap::new(),
            filter: AttributeFilter::All,
            pending: Vec::new(),
            seen: BoundedSet::new(SEEN_BATCH_WINDOW),
            tombstones: BoundedSet::new(TOMBSTONE_WINDOW),
            stats: SyncStats::default(),
            needs_reload: false,
            subscriptions: Vec::new(),
        }
    }

    fn root_shadow() -> ShadowNode {
        ShadowNode::new(
            NodeKey::root(),
            None,
            SharedRef::root(),
            SharedRef::ROOT.to_string(),
            ShadowVariant::Element {
                children: Vec::new(),
            },
        )
    }

    pub fn client_id(&self) -> PeerId {
        self.client_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn replica_mut(&mut self) -> &mut Replica {
        &mut self.replica
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// True after a failed push until the shadows are rebuilt.
    pub fn needs_reload(&self) -> bool {
        self.needs_reload
    }

    pub fn filter(&self) -> &AttributeFilter {
        &self.filter
    }

    /// Replace the attribute allow-list.
    pub fn configure(&mut self, filter: AttributeFilter) {
        self.filter = filter;
    }

    pub fn has(&self, key: &NodeKey) -> bool {
        self.shadows.contains(key)
    }

    pub fn shadow(&self, key: &NodeKey) -> Option<&ShadowNode> {
        self.shadows.get(key)
    }

    pub fn shadows(&self) -> &ShadowArena {
        &self.shadows
    }

    pub fn key_for(&self, shared: &SharedRef) -> Option<&NodeKey> {
        self.shadows.key_for(shared)
    }

    /// Return the shadow for `key`, creating it under `parent` if missing.
    ///
    /// A new shadow is appended to the parent's child list only when the
    /// caller passes `index`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create_shadow(
        &mut self,
        key: &NodeKey,
        parent: &NodeKey,
        index: Option<usize>,
        shared: SharedRef,
        identity: &str,
        kind: NodeKind,
        attrs: &Attrs,
    ) -> Result<&mut ShadowNode> {
        if !self.shadows.contains(key) {
            self.tombstones.remove(&shared);
            let node = ShadowNode::new(
                key.clone(),
                Some(parent.clone()),
                shared,
                identity.to_string(),
                ShadowVariant::for_kind(kind, attrs),
            );
            self.shadows.insert(node);
            if let Some(index) = index {
                if let Some(children) = self.shadows.children_mut(parent) {
                    let index = index.min(children.len());
                    children.insert(index, key.clone());
                }
            }
        }
        self.shadows
            .get_mut(key)
            .ok_or_else(|| BindingError::Inconsistent {
                key: key.clone(),
                detail: "shadow missing right after insert".to_string(),
            })
    }

    /// Destroy the shadow subtree at `key` and remember its shared refs as removed.
    ///
    /// The parent's child list is not touched.
    pub fn remove(&mut self, key: &NodeKey) -> Vec<ShadowNode> {
        if key.is_root() {
            warn!("Refusing to remove the root shadow");
            return Vec::new();
        }
        let removed = self.shadows.remove_subtree(key);
        for node in &removed {
            self.tombstones.insert(node.shared.clone());
        }
        removed
    }

    /// Drop exactly the shadows named in `keys` and tombstone their shared refs.
    ///
    /// Children that are not listed stay. Returns how many shadows went away.
    pub(crate) fn forget(&mut self, keys: impl IntoIterator<Item = NodeKey>) -> usize {
        let mut count = 0;
        for key in keys {
            if key.is_root() {
                continue;
            }
            if let Some(node) = self.shadows.remove_one(&key) {
                self.tombstones.insert(node.shared);
                count += 1;
            }
        }
        count
    }

    /// Lazily create (or fetch) the embedded sub-document `id`.
    pub fn get_or_create_subdocument(&mut self, id: &str) -> &mut Replica {
        let client_id = self.client_id;
        self.subdocs.entry(id.to_string()).or_insert_with(|| {
            info!("Registering sub-document {}", id);
            Replica::new(client_id)
        })
    }

    pub fn subdocument(&self, id: &str) -> Option<&Replica> {
        self.subdocs.get(id)
    }

    pub fn subdocument_mut(&mut self, id: &str) -> Option<&mut Replica> {
        self.subdocs.get_mut(id)
    }

    pub fn subdocument_ids(&self) -> Vec<String> {
        self.subdocs.keys().cloned().collect()
    }

    pub fn remote_cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn remote_cursor(&self, peer: &PeerId) -> Option<&RemoteCursor> {
        self.cursors.get(peer)
    }

    /// Keep `subscription` alive for the binding's lifetime.
    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Reset shadows to just the root; the replica is kept.
    pub(crate) fn clear_shadows(&mut self) {
        self.shadows = ShadowArena::default();
        self.shadows.insert(Self::root_shadow());
        self.pending.clear();
        self.seen.clear();
        self.tombstones.clear();
        self.needs_reload = false;
    }

    /// Release all shadow state and subscriptions.
    pub fn destroy(&mut self) {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        debug!(
            "Destroying binding {} ({} shadows, {} subscriptions)",
            self.session_id,
            self.shadows.len(),
            subscriptions.len()
        );
        drop(subscriptions);
        self.clear_shadows();
        self.cursors.clear();
        self.subdocs.clear();
    }

    /// Check the shadow invariants against the local snapshot and the replica.
    ///
    /// Returns one message per violation; empty means consistent.
    pub fn verify(&self, snapshot: &Snapshot) -> Vec<String> {
        let mut problems = Vec::new();
        let local_keys = snapshot.descendants(&snapshot.root());
        for key in &local_keys {
            if !self.shadows.contains(key) {
                problems.push(format!("local node {} has no shadow", key));
            }
        }
        if self.shadows.len() != local_keys.len() {
            problems.push(format!(
                "{} shadows for {} local nodes",
                self.shadows.len(),
                local_keys.len()
            ));
        }
        for key in self.shadows.subtree(&NodeKey::root()) {
            let Some(shadow) = self.shadows.get(&key) else {
                continue;
            };
            if let Some(local) = snapshot.get(&key) {
                if local.kind != shadow.kind() {
                    problems.push(format!("{}: kind {:?} vs {:?}", key, local.kind, shadow.kind()));
                }
            }
            match self.replica.size(&shadow.shared) {
                Ok(size) if size == shadow.size => {}
                Ok(size) => problems.push(format!(
                    "{}: shadow size {} but shared size {}",
                    key, shadow.size, size
                )),
                Err(e) => problems.push(format!("{}: {}", key, e)),
            }
            if shadow.kind() == NodeKind::Element {
                let expected: Vec<SharedRef> = shadow
                    .children()
                    .iter()
                    .filter_map(|child| self.shadows.get(child).map(|c| c.shared.clone()))
                    .collect();
                match self.replica.children(&shadow.shared) {
                    Ok(actual) if actual == expected => {}
                    Ok(_) => problems.push(format!(
                        "{}: child order differs from shared sequence",
                        key
                    )),
                    Err(e) => problems.push(format!("{}: {}", key, e)),
                }
                let local_children = snapshot.children(&key);
                if local_children != shadow.children() {
                    problems.push(format!("{}: child keys differ from local snapshot", key));
                }
            }
        }
        problems
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_set_evicts_oldest() {
        let mut set = BoundedSet::new(2);
        assert!(set.insert(1));
        assert!(set.insert(2));
        assert!(!set.insert(2));
        assert!(set.insert(3));
        assert!(!set.contains(&1));
        assert!(set.contains(&3));
        assert_eq!(set.len(), 2);
    }

    fn binding() -> Binding {
        Binding::new(PeerId::from(7), "s", Replica::new(PeerId::from(7)), HashMap::new())
    }

    fn shadow(
        binding: &mut Binding,
        key: &NodeKey,
        parent: &NodeKey,
        shared: &str,
        kind: NodeKind,
    ) {
        binding
            .get_or_create_shadow(
                key,
                parent,
                Some(0),
                SharedRef::new(shared),
                key.as_str(),
                kind,
                &Attrs::new(),
            )
            .unwrap();
    }

    #[test]
    fn test_new_binding_has_root_shadow() {
        let binding = binding();
        assert!(binding.has(&NodeKey::root()));
        assert_eq!(binding.key_for(&SharedRef::root()), Some(&NodeKey::root()));
        assert!(binding.verify(&Snapshot::new()).is_empty());
        assert!(!binding.needs_reload());
    }

    #[test]
    fn test_get_or_create_shadow_is_idempotent() {
        let mut binding = binding();
        let root = NodeKey::root();
        let key = NodeKey::from("p1");
        shadow(&mut binding, &key, &root, "a", NodeKind::Element);
        shadow(&mut binding, &key, &root, "b", NodeKind::Element);

        assert_eq!(binding.shadows.children(&root), &[key.clone()]);
        assert_eq!(binding.shadow(&key).unwrap().shared, SharedRef::new("a"));
    }

    #[test]
    fn test_remove_tombstones_subtree() {
        let mut binding = binding();
        let root = NodeKey::root();
        let p = NodeKey::from("p1");
        let t = NodeKey::from("t1");
        shadow(&mut binding, &p, &root, "a", NodeKind::Element);
        shadow(&mut binding, &t, &p, "b", NodeKind::Text);

        let removed = binding.remove(&p);
        assert_eq!(removed.len(), 2);
        assert!(binding.tombstones.contains(&SharedRef::new("b")));
        assert!(!binding.has(&t));
    }

    #[test]
    fn test_forget_drops_only_listed_keys() {
        let mut binding = binding();
        let root = NodeKey::root();
        let p = NodeKey::from("p1");
        let t = NodeKey::from("t1");
        shadow(&mut binding, &p, &root, "a", NodeKind::Element);
        shadow(&mut binding, &t, &p, "b", NodeKind::Text);

        assert_eq!(binding.forget(vec![t.clone(), root.clone(), "nope".into()]), 1);
        assert!(!binding.has(&t));
        assert!(binding.has(&p));
        assert!(binding.has(&root));
        assert!(binding.tombstones.contains(&SharedRef::new("b")));
        assert!(!binding.tombstones.contains(&SharedRef::new("a")));
    }

    #[test]
    fn test_subdocuments_are_lazy() {
        let mut binding = binding();
        assert!(binding.subdocument("table").is_none());
        binding.get_or_create_subdocument("table");
        assert!(binding.subdocument("table").is_some());
        assert_eq!(binding.subdocument_ids(), vec!["table".to_string()]);
    }

    #[test]
    fn test_destroy_releases_subscriptions() {
        use crate::events::EventBus;
        use std::sync::Arc;

        let bus = Arc::new(EventBus::<u32>::new());
        let mut binding = binding();
        binding.add_subscription(bus.subscribe(|_| {}));
        assert_eq!(bus.subscriber_count(), 1);
        binding.destroy();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
