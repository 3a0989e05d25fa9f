//! Pull sync: replica delta batches into one local update.
//!
//! A round applies every queued batch inside a single collaboration-tagged
//! model update, so the host sees one atomic change and push sync skips it.
//! Removals park the local subtree under its identity; an insert with the
//! same identity later in the round re-attaches it instead of rebuilding it
//! from scratch. Batches whose target is not materialized yet wait in the
//! binding until it is.

use crate::binding::Binding;
use crate::delta::{AttrPatch, DeltaBatch, DeltaOp, Origin, RemovedSpan, SharedRef, SpanSnapshot};
use crate::message::{CollabMessage, DocTarget};
use crate::model::{DocumentModel, LocalUpdate, UpdateTags};
use crate::provider::Provider;
use crate::shadow::ShadowVariant;
use crate::snapshot::{Attrs, NodeKey, NodeKind, NodeSpec, SnapshotDraft};
use crate::text;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

const MAX_PENDING: usize = 1024;

#[derive(Debug, Default)]
pub struct PullReport {
    pub applied: usize,
    pub echoes_dropped: usize,
    pub duplicates_dropped: usize,
    /// Batches for removed or stale targets.
    pub dropped: usize,
    /// Batches left waiting for their target.
    pub buffered: usize,
    pub moves: usize,
    pub heals: usize,
    /// The collaboration-tagged update, if the round changed anything.
    pub update: Option<LocalUpdate>,
}

/// Apply remote batches to the local document in one collaboration-tagged update.
pub fn pull_remote_events<M: DocumentModel, P: Provider + ?Sized>(
    binding: &mut Binding,
    provider: &P,
    model: &mut M,
    batches: Vec<DeltaBatch>,
) -> PullReport {
    let mut report = PullReport::default();
    let mut queue = std::mem::take(&mut binding.pending);
    for batch in batches {
        if batch.origin == Origin::Local {
            report.echoes_dropped += 1;
            continue;
        }
        if !binding.seen.insert(batch.id) {
            report.duplicates_dropped += 1;
            continue;
        }
        queue.push(batch);
    }
    binding.stats.echoes_dropped += report.echoes_dropped;
    binding.stats.duplicates_dropped += report.duplicates_dropped;
    if queue.is_empty() {
        return report;
    }

    binding.stats.pulls += 1;
    let mut outcome = PullOutcome::default();
    let update = model.update(UpdateTags::collaboration(), |draft| {
        let mut puller = Puller::new(&mut *binding, provider, draft, &queue);
        puller.run(queue);
        outcome = puller.finish();
    });

    let mut waiting = outcome.waiting;
    if waiting.len() > MAX_PENDING {
        warn!("Dropping {} buffered batches", waiting.len() - MAX_PENDING);
        waiting.drain(..waiting.len() - MAX_PENDING);
    }
    report.applied = outcome.applied;
    report.dropped = outcome.dropped;
    report.buffered = waiting.len();
    report.moves = outcome.moves;
    report.heals = outcome.heals;
    binding.stats.buffered += report.buffered;
    binding.stats.moves += report.moves;
    binding.stats.heals += report.heals;
    binding.pending = waiting;

    if !update.is_empty() {
        debug!(
            "Pulled {} batches ({} moves, {} heals, {} waiting)",
            report.applied, report.moves, report.heals, report.buffered
        );
        report.update = Some(update);
    }
    report
}

#[derive(Default)]
struct PullOutcome {
    applied: usize,
    dropped: usize,
    moves: usize,
    heals: usize,
    waiting: Vec<DeltaBatch>,
}

struct Puller<'a, P: ?Sized> {
    binding: &'a mut Binding,
    provider: &'a P,
    draft: &'a mut SnapshotDraft,
    /// Detached subtrees by identity, waiting to be re-inserted this round.
    parked: HashMap<String, NodeKey>,
    /// Live nodes whose removal is still ahead in the round, by identity.
    leaving: HashMap<String, NodeKey>,
    /// Every node detached from the draft this round. Whatever is not
    /// attached again by `finish` loses its shadow there.
    detached: HashSet<NodeKey>,
    materialized: HashMap<SharedRef, u64>,
    latest_epoch: u64,
    outcome: PullOutcome,
}

impl<'a, P: Provider + ?Sized> Puller<'a, P> {
    fn new(
        binding: &'a mut Binding,
        provider: &'a P,
        draft: &'a mut SnapshotDraft,
        queue: &[DeltaBatch],
    ) -> Self {
        // Every identity inside a subtree being removed may reappear elsewhere.
        let mut leaving = HashMap::new();
        for span in queue.iter().flat_map(removed_spans) {
            let Some(root) = binding.key_for(&span.shared) else {
                continue;
            };
            for key in binding.shadows.subtree(root) {
                if let Some(shadow) = binding.shadow(&key) {
                    leaving.insert(shadow.identity.clone(), key);
                }
            }
        }
        let latest_epoch = binding.replica.observer_epoch();
        Self {
            binding,
            provider,
            draft,
            parked: HashMap::new(),
            leaving,
            detached: HashSet::new(),
            materialized: HashMap::new(),
            latest_epoch,
            outcome: PullOutcome::default(),
        }
    }

    fn run(&mut self, queue: Vec<DeltaBatch>) {
        let mut queue: VecDeque<DeltaBatch> = queue.into();
        let mut waiting: Vec<DeltaBatch> = Vec::new();

        while let Some(batch) = queue.pop_front() {
            let Some(key) = self.binding.key_for(&batch.target).cloned() else {
                if self.binding.tombstones.contains(&batch.target) {
                    trace!("Dropping batch for removed node {}", batch.target);
                    self.outcome.dropped += 1;
                } else {
                    waiting.push(batch);
                }
                continue;
            };
            if self
                .materialized
                .get(&batch.target)
                .is_some_and(|epoch| batch.id.epoch <= *epoch)
            {
                // Already part of the span it was materialized from.
                self.outcome.dropped += 1;
                continue;
            }
            if !self.draft.contains(&key) {
                self.outcome.dropped += 1;
                continue;
            }

            self.apply(&key, &batch);
            self.outcome.applied += 1;

            if !waiting.is_empty() {
                let (ready, still): (Vec<_>, Vec<_>) = waiting
                    .into_iter()
                    .partition(|b| self.binding.key_for(&b.target).is_some());
                waiting = still;
                for b in ready.into_iter().rev() {
                    queue.push_front(b);
                }
            }
        }
        self.outcome.waiting = waiting;
    }

    /// Drop the shadows of everything the round detached and never re-attached.
    ///
    /// Identities can collide when peers move the same node concurrently, so
    /// the parked map is not the full list; `detached` is.
    fn finish(mut self) -> PullOutcome {
        let mut candidates: Vec<NodeKey> = self.parked.drain().map(|(_, key)| key).collect();
        candidates.extend(self.detached.drain());

        let mut gone = HashSet::new();
        for key in candidates {
            if self.draft.is_attached(&key) {
                continue;
            }
            let mut keys = self.binding.shadows.subtree(&key);
            keys.extend(draft_preorder(self.draft, &key));
            gone.extend(keys.into_iter().filter(|k| !self.draft.is_attached(k)));
        }
        let dropped = self.binding.forget(gone);
        if dropped > 0 {
            trace!("Dropped {} shadows of removed nodes", dropped);
        }
        self.outcome
    }

    fn apply(&mut self, key: &NodeKey, batch: &DeltaBatch) {
        let Some(kind) = self.draft.get(key).map(|n| n.kind) else {
            return;
        };
        let healthy = match kind {
            NodeKind::Text => self.apply_text(key, &batch.ops),
            NodeKind::Element => self.apply_element(key, &batch.ops),
            NodeKind::LineBreak | NodeKind::Decorator => {
                for op in &batch.ops {
                    if let DeltaOp::Attributes(patch) = op {
                        self.apply_attrs(key, patch);
                    }
                }
                true
            }
        };
        let latest = batch.id.epoch == self.latest_epoch;
        if !healthy || (latest && !self.matches_observed(key, &batch.target)) {
            self.heal(key, &batch.target);
        }
    }

    fn apply_text(&mut self, key: &NodeKey, ops: &[DeltaOp]) -> bool {
        let mut healthy = true;
        let mut pos = 0;
        for op in ops {
            let len = text::utf16_len(self.draft.text(key).unwrap_or_default());
            match op {
                DeltaOp::Retain(n) => pos += n,
                DeltaOp::InsertText(s) => {
                    if pos > len {
                        warn!("Insert at {} past end of {} ({} units)", pos, key, len);
                        healthy = false;
                    }
                    self.draft.splice_text(key, pos, 0, s);
                    pos += text::utf16_len(s);
                }
                DeltaOp::Delete(n) => {
                    if pos + n > len {
                        warn!("Delete {}..{} past end of {} ({} units)", pos, pos + n, key, len);
                        healthy = false;
                    }
                    self.draft.splice_text(key, pos, *n, "");
                }
                DeltaOp::Attributes(patch) => self.apply_attrs(key, patch),
                DeltaOp::InsertSpans(_) | DeltaOp::DeleteSpans(_) => {
                    warn!("Ignoring span op on text node {}", key);
                }
            }
        }
        let size = text::utf16_len(self.draft.text(key).unwrap_or_default());
        self.binding.shadows.set_text_size(key, size);
        healthy
    }

    fn apply_element(&mut self, key: &NodeKey, ops: &[DeltaOp]) -> bool {
        let mut healthy = true;
        let mut index = 0;
        for op in ops {
            match op {
                DeltaOp::Retain(n) => index += n,
                DeltaOp::DeleteSpans(spans) => {
                    for span in spans {
                        let Some(child) = self.binding.key_for(&span.shared).cloned() else {
                            // Moved out earlier in this round, or never materialized.
                            continue;
                        };
                        match self.binding.shadows.children(key).iter().position(|k| k == &child) {
                            Some(pos) => {
                                if pos != index {
                                    trace!(
                                        "Delete of {} expected at {} but found at {}",
                                        child,
                                        index,
                                        pos
                                    );
                                }
                                self.unlink(key, &child);
                                self.leaving.remove(&span.identity);
                                self.parked.insert(span.identity.clone(), child);
                            }
                            None => {
                                warn!("Deleted span {} is not a child of {}", child, key);
                                healthy = false;
                            }
                        }
                    }
                }
                DeltaOp::InsertSpans(spans) => {
                    for span in spans {
                        if let Some(existing) = self.binding.key_for(&span.shared).cloned() {
                            let found = self
                                .binding
                                .shadows
                                .children(key)
                                .iter()
                                .position(|k| k == &existing);
                            match found {
                                Some(pos) if pos == index => {}
                                Some(pos) => {
                                    trace!("Moving {} from {} to {}", existing, pos, index);
                                    self.reposition(key, &existing, index);
                                }
                                None => {
                                    warn!("Inserted span {} already lives elsewhere", existing);
                                    healthy = false;
                                    continue;
                                }
                            }
                            index += 1;
                            continue;
                        }
                        let len = self.binding.shadows.children(key).len();
                        if index > len {
                            warn!("Insert at {} past end of {} ({} children)", index, key, len);
                            healthy = false;
                            index = len;
                        }
                        self.place(key, index, span);
                        index += 1;
                    }
                }
                DeltaOp::Attributes(patch) => self.apply_attrs(key, patch),
                DeltaOp::InsertText(_) | DeltaOp::Delete(_) => {
                    warn!("Ignoring text op on element {}", key);
                }
            }
        }
        self.binding.shadows.refresh_size(key);
        healthy
    }

    /// Does the local node agree with what the replica last observed?
    fn matches_observed(&self, key: &NodeKey, shared: &SharedRef) -> bool {
        let Some(state) = self.binding.replica.observed_state(shared) else {
            return true;
        };
        let Some(node) = self.draft.get(key) else {
            return true;
        };
        let filter = &self.binding.filter;
        if filter.filter(&state.attrs) != filter.filter(&node.attrs) {
            return false;
        }
        match node.kind {
            NodeKind::Text => node.text == state.text,
            NodeKind::Element => {
                let children: Vec<&SharedRef> = self
                    .binding
                    .shadows
                    .children(key)
                    .iter()
                    .filter_map(|k| self.binding.shadow(k).map(|s| &s.shared))
                    .collect();
                children.len() == state.children.len()
                    && children.iter().zip(&state.children).all(|(a, b)| *a == b)
            }
            _ => true,
        }
    }

    fn heal(&mut self, key: &NodeKey, shared: &SharedRef) {
        let Some(span) = self.binding.replica.snapshot_span(shared) else {
            return;
        };
        warn!("Rebuilding {} from the shared document", key);
        self.rebuild(key, &span);
        self.outcome.heals += 1;
    }

    /// Remove `child` from `parent`'s local and shadow child lists, keeping its subtree.
    fn unlink(&mut self, parent: &NodeKey, child: &NodeKey) {
        if let Some(children) = self.binding.shadows.children_mut(parent) {
            children.retain(|k| k != child);
        }
        self.draft.detach(child);
        self.detached.insert(child.clone());
        self.binding.shadows.refresh_size(parent);
    }

    /// Move an existing child of `parent` to `index` in both child lists.
    fn reposition(&mut self, parent: &NodeKey, child: &NodeKey, index: usize) {
        if let Some(children) = self.binding.shadows.children_mut(parent) {
            children.retain(|k| k != child);
            let index = index.min(children.len());
            children.insert(index, child.clone());
        }
        self.draft.detach(child);
        if !self.draft.attach(child, parent, index) {
            warn!("Could not move {} to {} under {}", child, index, parent);
            self.detached.insert(child.clone());
        }
    }

    fn place(&mut self, parent: &NodeKey, index: usize, span: &SpanSnapshot) {
        let reuse = self
            .parked
            .remove(&span.identity)
            .or_else(|| self.leaving.remove(&span.identity));
        if let Some(key) = reuse {
            let usable = self.draft.contains(&key)
                && self.binding.has(&key)
                && !key.is_root()
                && key != *parent
                && !self.shadow_is_ancestor(&key, parent);
            if usable {
                if let Some(old_parent) = self.draft.parent(&key).cloned() {
                    self.unlink(&old_parent, &key);
                }
                if self.draft.attach(&key, parent, index) {
                    if let Some(children) = self.binding.shadows.children_mut(parent) {
                        let index = index.min(children.len());
                        children.insert(index, key.clone());
                    }
                    if let Some(shadow) = self.binding.shadows.get_mut(&key) {
                        shadow.parent = Some(parent.clone());
                    }
                    self.rebuild(&key, span);
                    self.binding.shadows.refresh_size(parent);
                    self.outcome.moves += 1;
                    return;
                }
            }
            // A node still in the tree is not ours to park; its own removal handles it.
            if !self.draft.is_attached(&key) {
                self.parked.insert(span.identity.clone(), key);
            }
        }
        self.materialize(parent, index, span);
    }

    fn shadow_is_ancestor(&self, ancestor: &NodeKey, key: &NodeKey) -> bool {
        let mut current = self.binding.shadow(key).and_then(|s| s.parent.as_ref());
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.binding.shadow(parent).and_then(|s| s.parent.as_ref());
        }
        false
    }

    /// Create a local subtree for `span` under `parent` at `index`.
    fn materialize(
        &mut self,
        parent: &NodeKey,
        index: usize,
        span: &SpanSnapshot,
    ) -> Option<NodeKey> {
        let spec = self.spec_for(span);
        let Some(key) = self.draft.insert(parent, index, spec) else {
            warn!("Could not materialize {} under {}", span.shared, parent);
            return None;
        };

        let keys = draft_preorder(self.draft, &key);
        let spans = span_preorder(span);
        for (local, shared) in keys.iter().zip(spans) {
            let Some(node) = self.draft.get(local) else {
                continue;
            };
            let Some(node_parent) = node.parent.clone() else {
                continue;
            };
            let (kind, attrs) = (node.kind, node.attrs.clone());
            let mut variant = ShadowVariant::for_kind(kind, &attrs);
            if let ShadowVariant::Element { children } = &mut variant {
                *children = node.children.clone();
            }
            if let ShadowVariant::Decorator { subdoc: Some(id) } = &variant {
                self.register_subdoc(id);
            }
            let created = self.binding.get_or_create_shadow(
                local,
                &node_parent,
                None,
                shared.shared.clone(),
                &shared.identity,
                kind,
                &attrs,
            );
            match created {
                Ok(shadow) => {
                    shadow.parent = Some(node_parent);
                    shadow.identity = shared.identity.clone();
                    shadow.variant = variant;
                }
                Err(e) => {
                    warn!("Skipping shadow for {}: {}", local, e);
                    continue;
                }
            }
            // A stale shadow under the same key must follow the new shared node.
            self.binding.shadows.rebind(local, shared.shared.clone());
            self.binding.tombstones.remove(&shared.shared);
            self.materialized.insert(shared.shared.clone(), shared.epoch);
        }

        if let Some(children) = self.binding.shadows.children_mut(parent) {
            let index = index.min(children.len());
            children.insert(index, key.clone());
        }
        self.resize(&key);
        self.binding.shadows.refresh_size(parent);
        Some(key)
    }

    /// Bring an existing local subtree in line with `span`, reusing children by identity.
    fn rebuild(&mut self, key: &NodeKey, span: &SpanSnapshot) {
        let Some(node) = self.draft.get(key) else {
            return;
        };
        if node.kind != span.kind || node.node_type != span.node_type {
            self.replace(key, span);
            return;
        }

        self.binding.shadows.rebind(key, span.shared.clone());
        self.binding.tombstones.remove(&span.shared);
        self.materialized.insert(span.shared.clone(), span.epoch);
        if let Some(shadow) = self.binding.shadows.get_mut(key) {
            shadow.identity = span.identity.clone();
        }
        self.sync_local_attrs(key, &span.attrs);

        match span.kind {
            NodeKind::Text => {
                self.draft.set_text(key, &span.text);
            }
            NodeKind::Element => {
                let old = self.draft.children(key).to_vec();
                let mut by_identity: HashMap<String, NodeKey> = old
                    .iter()
                    .filter_map(|c| self.binding.shadow(c).map(|s| (s.identity.clone(), c.clone())))
                    .collect();
                for child in &old {
                    self.draft.detach(child);
                    self.detached.insert(child.clone());
                }
                if let Some(children) = self.binding.shadows.children_mut(key) {
                    children.clear();
                }
                for (i, child_span) in span.children.iter().enumerate() {
                    let Some(child) = by_identity.remove(&child_span.identity) else {
                        self.materialize(key, i, child_span);
                        continue;
                    };
                    if !self.draft.attach(&child, key, i) {
                        self.parked.insert(child_span.identity.clone(), child);
                        self.materialize(key, i, child_span);
                        continue;
                    }
                    if let Some(children) = self.binding.shadows.children_mut(key) {
                        children.push(child.clone());
                    }
                    if let Some(shadow) = self.binding.shadows.get_mut(&child) {
                        shadow.parent = Some(key.clone());
                    }
                    self.rebuild(&child, child_span);
                }
                // Leftovers may still be re-inserted elsewhere this round.
                for (identity, child) in by_identity {
                    self.parked.insert(identity, child);
                }
            }
            NodeKind::LineBreak | NodeKind::Decorator => {}
        }
        self.resize(key);
    }

    /// Swap a node for a fresh one when its kind or type changed.
    fn replace(&mut self, key: &NodeKey, span: &SpanSnapshot) {
        let Some(parent) = self.draft.parent(key).cloned() else {
            warn!("Cannot replace detached node {}", key);
            return;
        };
        let index = self.draft.children(&parent).iter().position(|k| k == key).unwrap_or(0);
        if let Some(children) = self.binding.shadows.children_mut(&parent) {
            children.retain(|k| k != key);
        }
        let mut gone = self.binding.shadows.subtree(key);
        gone.extend(draft_preorder(self.draft, key));
        self.draft.remove(key);
        self.binding.forget(gone);
        self.materialize(&parent, index, span);
    }

    fn spec_for(&self, span: &SpanSnapshot) -> NodeSpec {
        let candidate = NodeKey::from(span.identity.as_str());
        let key = (!span.identity.is_empty()
            && !self.draft.contains(&candidate)
            && !self.binding.has(&candidate))
        .then_some(candidate);
        NodeSpec {
            key,
            kind: span.kind,
            node_type: span.node_type.clone(),
            attrs: self.binding.filter.filter(&span.attrs),
            text: span.text.clone(),
            children: span.children.iter().map(|c| self.spec_for(c)).collect(),
        }
    }

    fn apply_attrs(&mut self, key: &NodeKey, patch: &AttrPatch) {
        let patch = self.binding.filter.filter_patch(patch);
        for name in &patch.removed {
            self.draft.remove_attr(key, name);
        }
        for (name, value) in &patch.set {
            self.draft.set_attr(key, name, value.clone());
        }
        self.refresh_decorator(key);
    }

    fn sync_local_attrs(&mut self, key: &NodeKey, remote: &Attrs) {
        let Some(node) = self.draft.get(key) else {
            return;
        };
        let wanted = self.binding.filter.filter(remote);
        let stale: Vec<String> = node
            .attrs
            .keys()
            .filter(|name| self.binding.filter.allows(name) && !wanted.contains_key(*name))
            .cloned()
            .collect();
        let changed: Vec<(String, serde_json::Value)> = wanted
            .into_iter()
            .filter(|(name, value)| node.attrs.get(name) != Some(value))
            .collect();
        for name in stale {
            self.draft.remove_attr(key, &name);
        }
        for (name, value) in changed {
            self.draft.set_attr(key, &name, value);
        }
        self.refresh_decorator(key);
    }

    fn refresh_decorator(&mut self, key: &NodeKey) {
        let Some(node) = self.draft.get(key) else {
            return;
        };
        if node.kind != NodeKind::Decorator {
            return;
        }
        let variant = ShadowVariant::for_kind(node.kind, &node.attrs);
        if let ShadowVariant::Decorator { subdoc: Some(id) } = &variant {
            self.register_subdoc(id);
        }
        if let Some(shadow) = self.binding.shadows.get_mut(key) {
            shadow.variant = variant;
        }
    }

    /// Create the sub-document on first sight and ask peers for its content.
    fn register_subdoc(&mut self, id: &str) {
        if self.binding.subdocument(id).is_some() {
            return;
        }
        let version = self.binding.get_or_create_subdocument(id).encoded_version();
        if let Err(e) = self.provider.send(CollabMessage::SyncRequest {
            doc: DocTarget::Sub(id.to_string()),
            version,
        }) {
            warn!("Failed to request sub-document {}: {}", id, e);
        }
        debug!("Requested sub-document {}", id);
    }

    /// Recompute sizes bottom-up for `key`'s subtree.
    fn resize(&mut self, key: &NodeKey) {
        let children = self.binding.shadows.children(key).to_vec();
        for child in &children {
            self.resize(child);
        }
        let size = match self.binding.shadow(key).map(|s| s.kind()) {
            Some(NodeKind::Text) => text::utf16_len(self.draft.text(key).unwrap_or_default()),
            Some(NodeKind::Element) => children
                .iter()
                .map(|child| self.binding.shadows.contribution(child))
                .sum(),
            Some(_) => 1,
            None => return,
        };
        if let Some(shadow) = self.binding.shadows.get_mut(key) {
            shadow.size = size;
        }
    }
}

fn removed_spans(batch: &DeltaBatch) -> impl Iterator<Item = &RemovedSpan> {
    batch
        .ops
        .iter()
        .filter_map(|op| match op {
            DeltaOp::DeleteSpans(spans) => Some(spans.iter()),
            _ => None,
        })
        .flatten()
}

fn draft_preorder(draft: &SnapshotDraft, key: &NodeKey) -> Vec<NodeKey> {
    let mut out = Vec::new();
    let mut stack = vec![key.clone()];
    while let Some(current) = stack.pop() {
        for child in draft.children(&current).iter().rev() {
            stack.push(child.clone());
        }
        out.push(current);
    }
    out
}

fn span_preorder(span: &SpanSnapshot) -> Vec<&SpanSnapshot> {
    let mut out = Vec::new();
    let mut stack = vec![span];
    while let Some(current) = stack.pop() {
        for child in current.children.iter().rev() {
            stack.push(child);
        }
        out.push(current);
    }
    out
}
