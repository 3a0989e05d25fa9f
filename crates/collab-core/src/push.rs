//! Push sync: local snapshot changes into replica transactions.
//!
//! Dirty containers are reconciled top-down against their shadow child
//! lists, one replica transaction per dirty root. Dirty leaves outside any
//! dirty root are synced afterwards, one transaction per parent. Text is
//! spliced by common prefix/suffix so positions anchored in the unchanged
//! parts stay valid.

use crate::binding::Binding;
use crate::delta::{DeltaBatch, Origin, SharedRef};
use crate::diff::{self, SeqStep};
use crate::message::{CollabMessage, DocTarget};
use crate::model::LocalUpdate;
use crate::provider::Provider;
use crate::replica::{NodeSeed, ReplicaError};
use crate::shadow::{ShadowNode, ShadowVariant, diff_attributes};
use crate::snapshot::{NodeKey, NodeKind, NodeSpec, Snapshot};
use crate::text;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Shadow for {key} does not match the shared document: {detail}")]
    Inconsistent { key: NodeKey, detail: String },
}

pub type Result<T> = std::result::Result<T, PushError>;

/// One change written to the replica, in local terms.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedChange {
    Inserted {
        parent: NodeKey,
        key: NodeKey,
        index: usize,
        /// Sibling the node was placed after, if any.
        after: Option<NodeKey>,
        subtree: NodeSpec,
    },
    Removed {
        parent: NodeKey,
        key: NodeKey,
        index: usize,
        after: Option<NodeKey>,
        subtree: NodeSpec,
    },
    Text {
        key: NodeKey,
        /// UTF-16 offset.
        index: usize,
        removed: String,
        inserted: String,
    },
    Attrs {
        key: NodeKey,
        before: BTreeMap<String, Option<Value>>,
        after: BTreeMap<String, Option<Value>>,
    },
}

#[derive(Debug, Default)]
pub struct PushReport {
    /// The update carried the collaboration tag and was not pushed.
    pub skipped: bool,
    pub transactions: usize,
    pub changes: Vec<AppliedChange>,
    /// Batches the replica observed from our own writes. Never applied locally.
    pub echo: Vec<DeltaBatch>,
    /// Size of the broadcast update.
    pub bytes: usize,
}

/// Push one committed local update into the replica and broadcast it.
pub fn push_local_update<P: Provider + ?Sized>(
    binding: &mut Binding,
    provider: &P,
    update: &LocalUpdate,
) -> Result<PushReport> {
    if update.tags.is_collaboration() {
        binding.stats.skipped_pushes += 1;
        trace!("Skipping push of collaboration update");
        return Ok(PushReport {
            skipped: true,
            ..PushReport::default()
        });
    }
    if update.is_empty() {
        return Ok(PushReport::default());
    }

    binding.stats.pushes += 1;
    let mut pusher = Pusher::new(binding, update);
    let outcome = pusher.run();
    let Pusher {
        changes,
        transactions,
        ..
    } = pusher;
    binding.stats.transactions += transactions;

    if let Err(e) = outcome {
        // Whatever reached the replica is real; peers get it, and the shadows
        // are rebuilt from the replica before the next push.
        binding.needs_reload = true;
        let size = broadcast(binding, provider);
        warn!(
            "Push failed after {} transactions ({} bytes sent), shadows need a reload: {}",
            transactions, size, e
        );
        return Err(e);
    }

    let echo = binding.replica.observe(Origin::Local);
    let size = broadcast(binding, provider);
    if !changes.is_empty() {
        debug!(
            "Pushed {} changes in {} transactions ({} bytes)",
            changes.len(),
            transactions,
            size
        );
    }

    Ok(PushReport {
        skipped: false,
        transactions,
        changes,
        echo,
        bytes: size,
    })
}

/// Send every pending local update. Returns the bytes queued for peers.
fn broadcast<P: Provider + ?Sized>(binding: &Binding, provider: &P) -> usize {
    let mut size = 0;
    for update in binding.replica.take_local_updates() {
        size += update.len();
        if let Err(e) = provider.send(CollabMessage::Update {
            doc: DocTarget::Root,
            update,
        }) {
            // The replica keeps the change; the next sync exchange carries it.
            warn!("Failed to broadcast update: {}", e);
        }
    }
    size
}

struct Pusher<'a> {
    binding: &'a mut Binding,
    prev: &'a Snapshot,
    next: &'a Snapshot,
    dirty_containers: HashSet<NodeKey>,
    dirty_leaves: HashSet<NodeKey>,
    needs_visit: HashSet<NodeKey>,
    visited: HashSet<NodeKey>,
    parked: HashSet<NodeKey>,
    placed: HashSet<NodeKey>,
    changes: Vec<AppliedChange>,
    transactions: usize,
}

impl<'a> Pusher<'a> {
    fn new(binding: &'a mut Binding, update: &'a LocalUpdate) -> Self {
        let next = &update.next;
        let mut dirty_containers = HashSet::new();
        let mut dirty_leaves = HashSet::new();

        let normalized = update.normalized.iter().flat_map(|key| {
            let parent = next.parent(key).cloned();
            std::iter::once(key.clone()).chain(parent)
        });
        let candidates = update
            .dirty_containers
            .iter()
            .chain(update.dirty_leaves.iter())
            .cloned()
            .chain(normalized);

        for key in candidates {
            let Some(node) = next.get(&key) else {
                continue;
            };
            if !binding.has(&key) {
                // Unbound nodes are created by reconciling the nearest bound ancestor.
                if let Some(ancestor) = nearest_bound_ancestor(binding, next, &key) {
                    dirty_containers.insert(ancestor);
                }
            } else if node.kind == NodeKind::Element {
                dirty_containers.insert(key);
            } else {
                dirty_leaves.insert(key);
            }
        }

        let mut needs_visit = HashSet::new();
        for key in dirty_containers.iter().chain(dirty_leaves.iter()) {
            let mut current = next.parent(key);
            while let Some(parent) = current {
                if !needs_visit.insert(parent.clone()) {
                    break;
                }
                current = next.parent(parent);
            }
        }

        Self {
            binding,
            prev: &update.prev,
            next,
            dirty_containers,
            dirty_leaves,
            needs_visit,
            visited: HashSet::new(),
            parked: HashSet::new(),
            placed: HashSet::new(),
            changes: Vec::new(),
            transactions: 0,
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut roots: Vec<NodeKey> = self
            .dirty_containers
            .iter()
            .filter(|key| !self.has_dirty_ancestor(key))
            .cloned()
            .collect();
        roots.sort_by(|a, b| {
            self.next
                .depth(a)
                .cmp(&self.next.depth(b))
                .then_with(|| a.as_str().cmp(b.as_str()))
        });

        for root in roots {
            if self.visited.contains(&root) || self.placed.contains(&root) {
                continue;
            }
            self.reconcile(&root)?;
            self.binding.replica.commit();
            self.transactions += 1;
        }

        let mut by_parent: BTreeMap<String, Vec<NodeKey>> = BTreeMap::new();
        for leaf in &self.dirty_leaves {
            if self.visited.contains(leaf) || self.placed.contains(leaf) {
                continue;
            }
            let parent = self
                .next
                .parent(leaf)
                .map(|p| p.as_str().to_string())
                .unwrap_or_default();
            by_parent.entry(parent).or_default().push(leaf.clone());
        }
        for (_, mut leaves) in by_parent {
            leaves.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            for leaf in leaves {
                self.sync_leaf(&leaf)?;
            }
            self.binding.replica.commit();
            self.transactions += 1;
        }

        for key in self.parked.clone() {
            if self.placed.contains(&key) || !self.binding.has(&key) {
                continue;
            }
            if self.next.contains(&key) {
                warn!("Moved node {} was never re-placed; dropping its shadow", key);
                self.binding.remove(&key);
            } else {
                self.drop_removed(&key);
            }
        }
        Ok(())
    }

    fn has_dirty_ancestor(&self, key: &NodeKey) -> bool {
        let mut current = self.next.parent(key);
        while let Some(parent) = current {
            if self.dirty_containers.contains(parent) {
                return true;
            }
            current = self.next.parent(parent);
        }
        false
    }

    fn shared_of(&self, key: &NodeKey) -> Result<SharedRef> {
        self.binding
            .shadow(key)
            .map(|s| s.shared.clone())
            .ok_or_else(|| PushError::Inconsistent {
                key: key.clone(),
                detail: "no shadow".to_string(),
            })
    }

    fn reconcile(&mut self, container: &NodeKey) -> Result<()> {
        self.visited.insert(container.clone());
        self.sync_attrs(container)?;
        let shared = self.shared_of(container)?;
        let old = self.binding.shadows.children(container).to_vec();
        let new = self.next.children(container).to_vec();

        let mut index = 0;
        for step in diff::diff_sequence(&old, &new) {
            match step {
                SeqStep::Keep(key) => {
                    if self.needs_replace(&key) {
                        self.remove_at(container, &shared, index, &key, false)?;
                        self.insert_at(container, &shared, index, &key)?;
                    } else if self.is_element(&key)
                        && (self.dirty_containers.contains(&key) || self.needs_visit.contains(&key))
                    {
                        self.reconcile(&key)?;
                    } else if self.dirty_leaves.contains(&key) {
                        self.sync_leaf(&key)?;
                    }
                    index += 1;
                }
                SeqStep::Remove(key) => {
                    let moving = self.next.contains(&key);
                    self.remove_at(container, &shared, index, &key, moving)?;
                }
                SeqStep::Insert(key) => {
                    self.insert_at(container, &shared, index, &key)?;
                    index += 1;
                }
            }
        }
        self.binding.shadows.refresh_size(container);
        Ok(())
    }

    fn is_element(&self, key: &NodeKey) -> bool {
        self.next.get(key).map(|n| n.kind) == Some(NodeKind::Element)
    }

    /// The replica cannot retype a node, so a kind or type change is a replace.
    fn needs_replace(&self, key: &NodeKey) -> bool {
        let Some(next) = self.next.get(key) else {
            return false;
        };
        let kind_changed = self
            .binding
            .shadow(key)
            .is_some_and(|shadow| shadow.kind() != next.kind);
        let type_changed = self
            .prev
            .get(key)
            .is_some_and(|prev| prev.node_type != next.node_type);
        kind_changed || type_changed
    }

    fn remove_at(
        &mut self,
        container: &NodeKey,
        shared: &SharedRef,
        index: usize,
        key: &NodeKey,
        park: bool,
    ) -> Result<()> {
        self.binding.replica.remove_child(shared, index)?;
        let children = self.binding.shadows.children(container);
        let after = index.checked_sub(1).and_then(|i| children.get(i).cloned());
        if let Some(children) = self.binding.shadows.children_mut(container) {
            if index < children.len() {
                children.remove(index);
            }
        }
        if let Some(subtree) = NodeSpec::capture(self.prev, key) {
            self.changes.push(AppliedChange::Removed {
                parent: container.clone(),
                key: key.clone(),
                index,
                after,
                subtree,
            });
        }

        if !park {
            self.drop_removed(key);
            return Ok(());
        }
        let owned_here = self
            .binding
            .shadow(key)
            .is_some_and(|s| s.parent.as_ref() == Some(container));
        if owned_here && !self.placed.contains(key) {
            self.parked.insert(key.clone());
        }
        Ok(())
    }

    /// Drop the shadows of a deleted subtree, as shadowed and as it was
    /// locally, keeping any node that still exists in the next snapshot.
    fn drop_removed(&mut self, key: &NodeKey) {
        let mut keys = self.binding.shadows.subtree(key);
        keys.extend(preorder(self.prev, key));
        keys.retain(|k| !self.next.contains(k));
        let dropped = self.binding.forget(keys);
        trace!("Dropped {} shadows under {}", dropped, key);
    }

    fn insert_at(
        &mut self,
        container: &NodeKey,
        shared: &SharedRef,
        index: usize,
        key: &NodeKey,
    ) -> Result<()> {
        let seed = self.seed(key).ok_or_else(|| PushError::Inconsistent {
            key: key.clone(),
            detail: "inserted node missing from snapshot".to_string(),
        })?;
        let created = self.binding.replica.insert_node(shared, index, &seed)?;
        let keys = preorder(self.next, key);
        if keys.len() != created.len() {
            return Err(PushError::Inconsistent {
                key: key.clone(),
                detail: format!(
                    "{} local nodes but {} shared nodes created",
                    keys.len(),
                    created.len()
                ),
            });
        }

        for (k, s) in keys.iter().zip(created) {
            let parent = if k == key {
                container.clone()
            } else {
                self.next.parent(k).cloned().unwrap_or_else(|| container.clone())
            };
            self.bind(k, s, parent);
        }
        for k in keys.iter().rev() {
            self.recompute_size(k);
        }

        let after = {
            let children = self.binding.shadows.children_mut(container);
            match children {
                Some(children) => {
                    let index = index.min(children.len());
                    children.insert(index, key.clone());
                    index.checked_sub(1).and_then(|i| children.get(i).cloned())
                }
                None => None,
            }
        };
        if let Some(subtree) = NodeSpec::capture(self.next, key) {
            self.changes.push(AppliedChange::Inserted {
                parent: container.clone(),
                key: key.clone(),
                index,
                after,
                subtree,
            });
        }
        Ok(())
    }

    /// Point the shadow for `key` at a freshly written shared node.
    fn bind(&mut self, key: &NodeKey, shared: SharedRef, parent: NodeKey) {
        let next = self.next;
        let Some(node) = next.get(key) else {
            return;
        };
        let mut variant = ShadowVariant::for_kind(node.kind, &node.attrs);
        if let ShadowVariant::Element { children } = &mut variant {
            *children = node.children.clone();
        }
        if let ShadowVariant::Decorator { subdoc: Some(id) } = &variant {
            self.binding.get_or_create_subdocument(id);
        }

        match self.binding.shadows.get_mut(key) {
            Some(existing) => {
                let old_children = existing.children().to_vec();
                existing.parent = Some(parent);
                existing.variant = variant;
                self.binding.shadows.rebind(key, shared);
                for child in old_children {
                    if node.children.contains(&child) {
                        continue;
                    }
                    let still_ours = self
                        .binding
                        .shadow(&child)
                        .is_some_and(|c| c.parent.as_ref() == Some(key));
                    if !self.next.contains(&child) {
                        self.drop_removed(&child);
                    } else if still_ours && !self.placed.contains(&child) {
                        self.parked.insert(child);
                    }
                }
            }
            None => {
                self.binding.tombstones.remove(&shared);
                self.binding.shadows.insert(ShadowNode::new(
                    key.clone(),
                    Some(parent),
                    shared,
                    key.as_str().to_string(),
                    variant,
                ));
            }
        }
        self.parked.remove(key);
        self.placed.insert(key.clone());
        self.visited.insert(key.clone());
    }

    fn recompute_size(&mut self, key: &NodeKey) {
        let size = match self.binding.shadow(key).map(|s| s.kind()) {
            Some(NodeKind::Text) => text::utf16_len(self.next.text(key).unwrap_or_default()),
            Some(NodeKind::Element) => self
                .binding
                .shadows
                .children(key)
                .iter()
                .map(|child| self.binding.shadows.contribution(child))
                .sum(),
            Some(_) => 1,
            None => return,
        };
        if let Some(node) = self.binding.shadows.get_mut(key) {
            node.size = size;
        }
    }

    fn seed(&self, key: &NodeKey) -> Option<NodeSeed> {
        let node = self.next.get(key)?;
        let identity = self
            .binding
            .shadow(key)
            .map(|s| s.identity.clone())
            .unwrap_or_else(|| key.as_str().to_string());
        Some(NodeSeed {
            identity,
            kind: node.kind,
            node_type: node.node_type.clone(),
            attrs: self.binding.filter.filter(&node.attrs),
            text: if node.kind == NodeKind::Text {
                node.text.clone()
            } else {
                String::new()
            },
            children: node
                .children
                .iter()
                .filter_map(|child| self.seed(child))
                .collect(),
        })
    }

    fn sync_leaf(&mut self, key: &NodeKey) -> Result<()> {
        self.visited.insert(key.clone());
        let Some(node) = self.next.get(key) else {
            return Ok(());
        };
        if node.kind == NodeKind::Text {
            let shared = self.shared_of(key)?;
            let current = self.binding.replica.text(&shared)?;
            if let Some(splice) = text::compute_splice(&current, &node.text) {
                self.binding
                    .replica
                    .splice_text(&shared, splice.index, splice.delete, &splice.insert)?;
                self.changes.push(AppliedChange::Text {
                    key: key.clone(),
                    index: splice.index,
                    removed: splice.removed,
                    inserted: splice.insert,
                });
            }
            self.binding
                .shadows
                .set_text_size(key, text::utf16_len(&node.text));
        }
        self.sync_attrs(key)
    }

    /// Write allow-listed attribute keys that differ from the shared copy.
    fn sync_attrs(&mut self, key: &NodeKey) -> Result<()> {
        let Some(node) = self.next.get(key) else {
            return Ok(());
        };
        let shared = self.shared_of(key)?;
        let current = self.binding.replica.attrs(&shared)?;
        let patch = diff_attributes(&self.binding.filter, &current, &node.attrs);
        if patch.is_empty() {
            return Ok(());
        }
        self.binding.replica.apply_attr_patch(&shared, &patch)?;

        let touched = patch.set.keys().chain(patch.removed.iter());
        let before = touched
            .clone()
            .map(|k| (k.clone(), current.get(k).cloned()))
            .collect();
        let after = touched.map(|k| (k.clone(), node.attrs.get(k).cloned())).collect();
        self.changes.push(AppliedChange::Attrs {
            key: key.clone(),
            before,
            after,
        });

        if node.kind == NodeKind::Decorator {
            let variant = ShadowVariant::for_kind(node.kind, &node.attrs);
            if let ShadowVariant::Decorator { subdoc: Some(id) } = &variant {
                self.binding.get_or_create_subdocument(id);
            }
            if let Some(shadow) = self.binding.shadows.get_mut(key) {
                shadow.variant = variant;
            }
        }
        Ok(())
    }
}

fn nearest_bound_ancestor(
    binding: &Binding,
    snapshot: &Snapshot,
    key: &NodeKey,
) -> Option<NodeKey> {
    let mut current = snapshot.parent(key);
    while let Some(parent) = current {
        if binding.has(parent) {
            return Some(parent.clone());
        }
        current = snapshot.parent(parent);
    }
    None
}

/// `key` and its descendants in pre-order, matching `Replica::insert_node`.
fn preorder(snapshot: &Snapshot, key: &NodeKey) -> Vec<NodeKey> {
    let mut out = Vec::new();
    let mut stack = vec![key.clone()];
    while let Some(current) = stack.pop() {
        let Some(node) = snapshot.get(&current) else {
            continue;
        };
        for child in node.children.iter().rev() {
            stack.push(child.clone());
        }
        out.push(current);
    }
    out
}
