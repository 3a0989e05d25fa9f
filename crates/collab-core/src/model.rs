//! Local document model boundary.
//!
//! The host editor owns the document and serializes every mutation through
//! `DocumentModel::update`. Each update yields a `LocalUpdate` describing the
//! previous and next snapshots plus the keys that changed.

use crate::events::{EventBus, Subscription};
use crate::snapshot::{NodeKey, Snapshot, SnapshotDraft};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Metadata attached to one update cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateTags(BTreeSet<String>);

impl UpdateTags {
    /// Update originated from pull sync; push must not re-broadcast it.
    pub const COLLABORATION: &'static str = "collaboration";
    /// Update replays undo/redo history.
    pub const HISTORIC: &'static str = "historic";

    pub fn none() -> Self {
        Self::default()
    }

    pub fn collaboration() -> Self {
        Self::none().with(Self::COLLABORATION)
    }

    pub fn historic() -> Self {
        Self::none().with(Self::HISTORIC)
    }

    pub fn with(mut self, tag: &str) -> Self {
        self.0.insert(tag.to_string());
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn is_collaboration(&self) -> bool {
        self.contains(Self::COLLABORATION)
    }

    pub fn is_historic(&self) -> bool {
        self.contains(Self::HISTORIC)
    }
}

/// Everything push sync needs to know about one committed local update.
#[derive(Debug, Clone)]
pub struct LocalUpdate {
    pub prev: Snapshot,
    pub next: Snapshot,
    pub dirty_containers: HashSet<NodeKey>,
    pub dirty_leaves: HashSet<NodeKey>,
    pub normalized: HashSet<NodeKey>,
    pub tags: UpdateTags,
}

impl LocalUpdate {
    pub fn is_empty(&self) -> bool {
        self.dirty_containers.is_empty()
            && self.dirty_leaves.is_empty()
            && self.normalized.is_empty()
    }

    /// An update that marks the whole tree dirty, used to seed a shared document.
    pub fn full(snapshot: Snapshot) -> Self {
        let dirty_containers = [snapshot.root()].into_iter().collect();
        Self {
            prev: snapshot.clone(),
            next: snapshot,
            dirty_containers,
            dirty_leaves: HashSet::new(),
            normalized: HashSet::new(),
            tags: UpdateTags::none(),
        }
    }
}

/// The host's document: a single-writer queue of snapshot updates.
pub trait DocumentModel {
    /// Current committed snapshot.
    fn snapshot(&self) -> Snapshot;

    /// Apply `edit` to a draft of the current snapshot and commit the result.
    fn update(&mut self, tags: UpdateTags, edit: impl FnOnce(&mut SnapshotDraft)) -> LocalUpdate;
}

/// In-memory `DocumentModel`.
pub struct LocalDocument {
    current: Snapshot,
    listeners: Arc<EventBus<LocalUpdate>>,
}

impl Default for LocalDocument {
    fn default() -> Self {
        Self::new(Snapshot::new())
    }
}

impl LocalDocument {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: initial,
            listeners: Arc::new(EventBus::new()),
        }
    }

    /// Register an update listener. Dropping the handle unregisters it.
    pub fn subscribe(
        &self,
        callback: impl Fn(LocalUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.subscribe(callback)
    }
}

impl DocumentModel for LocalDocument {
    fn snapshot(&self) -> Snapshot {
        self.current.clone()
    }

    fn update(&mut self, tags: UpdateTags, edit: impl FnOnce(&mut SnapshotDraft)) -> LocalUpdate {
        let prev = self.current.clone();
        let mut draft = SnapshotDraft::new(&prev);
        edit(&mut draft);
        let (next, dirty_containers, dirty_leaves, normalized) = draft.finish();
        self.current = next.clone();
        let update = LocalUpdate {
            prev,
            next,
            dirty_containers,
            dirty_leaves,
            normalized,
            tags,
        };
        self.listeners.emit(update.clone());
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::NodeSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_update_commits_and_notifies() {
        let mut doc = LocalDocument::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let _sub = doc.subscribe(move |update| {
            assert!(update.tags.is_collaboration());
            seen_clone.fetch_add(1, Ordering::Relaxed);
        });

        let update = doc.update(UpdateTags::collaboration(), |draft| {
            draft.append(&NodeKey::root(), NodeSpec::paragraph());
        });

        assert!(update.prev.is_empty());
        assert!(!update.next.is_empty());
        assert_eq!(doc.snapshot().epoch(), update.next.epoch());
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tags() {
        let tags = UpdateTags::historic().with("custom");
        assert!(tags.is_historic());
        assert!(tags.contains("custom"));
        assert!(!tags.is_collaboration());
    }
}
