//! Host-facing collaboration session.
//!
//! Owns the document model, the binding and the undo manager for one shared
//! document. Provider callbacks only enqueue events; `process_inbox` applies
//! them one at a time while holding `&mut self`, so remote changes never
//! interleave with a local update.

use crate::binding::{Binding, SyncStats, create_binding};
use crate::config::{CollabConfig, ConfigError};
use crate::cursor::{CursorBroadcaster, RemoteCursor, Selection, sync_cursor_positions};
use crate::delta::{Origin, SharedRef};
use crate::events::{EventBus, HostSignal, Subscription};
use crate::message::{CollabMessage, DocTarget};
use crate::model::{DocumentModel, LocalUpdate, UpdateTags};
use crate::peer_id::PeerId;
use crate::provider::{Provider, ProviderError, ProviderEvent};
use crate::pull::pull_remote_events;
use crate::push::{PushError, PushReport, push_local_update};
use crate::replica::{Replica, ReplicaError};
use crate::snapshot::{NodeKey, Snapshot, SnapshotDraft};
use crate::undo::{UndoError, UndoManager, create_undo_manager};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Push failed: {0}")]
    Push(#[from] PushError),

    #[error("Undo failed: {0}")]
    Undo(#[from] UndoError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

type Inbox = Arc<Mutex<VecDeque<ProviderEvent>>>;

pub struct CollabSession<M: DocumentModel, P: Provider> {
    binding: Binding,
    model: M,
    provider: Arc<P>,
    inbox: Inbox,
    undo: UndoManager,
    broadcaster: CursorBroadcaster,
    selection: Option<Selection>,
    signals: Arc<EventBus<HostSignal>>,
    config: CollabConfig,
    connected: bool,
    bootstrapped: bool,
    undo_state: (bool, bool),
}

impl<M: DocumentModel, P: Provider> CollabSession<M, P> {
    pub fn new(model: M, provider: Arc<P>, session_id: &str, config: CollabConfig) -> Self {
        Self::with_replica(model, provider, session_id, config, None)
    }

    /// Attach to an existing replica instead of starting from an empty one.
    pub fn with_replica(
        model: M,
        provider: Arc<P>,
        session_id: &str,
        config: CollabConfig,
        replica: Option<Replica>,
    ) -> Self {
        let mut binding =
            create_binding(&model, provider.as_ref(), session_id, replica, HashMap::new());
        binding.configure(config.attributes.clone());

        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        let sink = inbox.clone();
        binding.add_subscription(provider.subscribe(Box::new(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push_back(event);
        })));

        let undo = create_undo_manager(&binding, SharedRef::root())
            .with_limits(config.undo.max_steps, config.undo.merge_interval());

        info!("Session {} created for {}", session_id, provider.client_id());
        Self {
            binding,
            model,
            provider,
            inbox,
            undo,
            broadcaster: CursorBroadcaster::new(),
            selection: None,
            signals: Arc::new(EventBus::new()),
            config,
            connected: false,
            bootstrapped: false,
            undo_state: (false, false),
        }
    }

    pub fn client_id(&self) -> PeerId {
        self.binding.client_id()
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Snapshot {
        self.model.snapshot()
    }

    pub fn stats(&self) -> &SyncStats {
        self.binding.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn subscribe_signals(
        &self,
        callback: impl Fn(HostSignal) + Send + Sync + 'static,
    ) -> Subscription {
        self.signals.subscribe(callback)
    }

    /// Seed an empty shared document from the local one.
    ///
    /// Only runs for sessions configured with `bootstrap`, once. Returns
    /// whether anything was pushed.
    pub fn bootstrap(&mut self) -> Result<bool> {
        if !self.config.bootstrap || self.bootstrapped {
            return Ok(false);
        }
        self.bootstrapped = true;
        if !self.binding.replica().is_empty() {
            debug!("Shared document already has content, not bootstrapping");
            return Ok(false);
        }
        let snapshot = self.model.snapshot();
        if snapshot.is_empty() {
            return Ok(false);
        }
        let update = LocalUpdate::full(snapshot);
        let report = push_local_update(&mut self.binding, self.provider.as_ref(), &update)
            .inspect_err(|_| self.recover())?;
        info!("Bootstrapped shared document with {} changes", report.changes.len());
        Ok(true)
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.bootstrap()?;
        self.provider.connect().await?;
        self.process_inbox()?;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.provider.disconnect().await?;
        self.process_inbox()?;
        Ok(())
    }

    /// Connect if offline, disconnect if online. Returns the new state.
    pub async fn request_toggle_connection(&mut self) -> Result<bool> {
        if self.provider.status().is_connected() {
            self.disconnect().await?;
        } else {
            self.connect().await?;
        }
        Ok(self.connected)
    }

    /// Run one local edit and push it to peers.
    pub fn update(&mut self, edit: impl FnOnce(&mut SnapshotDraft)) -> Result<PushReport> {
        let update = self.model.update(UpdateTags::none(), edit);
        let report = push_local_update(&mut self.binding, self.provider.as_ref(), &update)
            .inspect_err(|_| self.recover())?;
        self.undo.record(&self.binding, &update.next, &report.changes);
        if !report.changes.is_empty() {
            self.broadcaster.mark_dirty();
            self.refresh_cursors();
        }
        self.emit_undo_state();
        Ok(report)
    }

    /// Apply queued provider events in arrival order. Returns how many ran.
    ///
    /// Stops at the first failing event; later events stay queued.
    pub fn process_inbox(&mut self) -> Result<usize> {
        let mut processed = 0;
        loop {
            let event = self.inbox.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            let Some(event) = event else {
                break;
            };
            processed += 1;
            self.handle_event(event)?;
        }
        Ok(processed)
    }

    pub fn pending_events(&self) -> usize {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn handle_event(&mut self, event: ProviderEvent) -> Result<()> {
        match event {
            ProviderEvent::Status(status) => {
                let connected = status.is_connected();
                if connected != self.connected {
                    self.connected = connected;
                    if connected {
                        self.broadcaster.reset();
                    }
                    self.signals.emit(HostSignal::Connected { connected });
                }
            }
            ProviderEvent::Sync(true) => self.request_sync()?,
            ProviderEvent::Sync(false) => trace!("Sync lost"),
            ProviderEvent::Message { from, message } => self.handle_message(from, message)?,
            ProviderEvent::Awareness { peer } => {
                trace!("Presence of {} changed", peer);
                self.refresh_cursors();
            }
            ProviderEvent::Reload => self.reload(),
        }
        Ok(())
    }

    fn request_sync(&mut self) -> Result<()> {
        let mut targets = vec![DocTarget::Root];
        targets.extend(self.binding.subdocument_ids().into_iter().map(DocTarget::Sub));
        for doc in targets {
            let version = self.replica_for(&doc).encoded_version();
            self.provider.send(CollabMessage::SyncRequest { doc, version })?;
        }
        Ok(())
    }

    fn handle_message(&mut self, from: PeerId, message: CollabMessage) -> Result<()> {
        match message {
            CollabMessage::SyncRequest { doc, version } => {
                let replica = self.replica_for(&doc);
                let update = replica.export_since_encoded(&version)?;
                let version = replica.encoded_version();
                self.reply(from, CollabMessage::SyncExchange { doc, update, version });
            }
            CollabMessage::SyncExchange { doc, update, version } => {
                self.import(&doc, &update)?;
                let update = self.replica_for(&doc).export_since_encoded(&version)?;
                self.reply(from, CollabMessage::SyncResponse { doc, update });
            }
            CollabMessage::SyncResponse { doc, update } | CollabMessage::Update { doc, update } => {
                self.import(&doc, &update)?;
            }
            CollabMessage::Awareness { .. } => {
                // Providers route presence through their awareness map.
                trace!("Ignoring raw awareness message from {}", from);
            }
        }
        Ok(())
    }

    /// Answer one peer. A peer that left meanwhile syncs again when it returns.
    fn reply(&self, to: PeerId, message: CollabMessage) {
        let kind = message.kind();
        if let Err(e) = self.provider.send_to(to, message) {
            warn!("Failed to send {} to {}: {}", kind, to, e);
        }
    }

    fn replica_for(&mut self, doc: &DocTarget) -> &mut Replica {
        match doc {
            DocTarget::Root => self.binding.replica_mut(),
            DocTarget::Sub(id) => self.binding.get_or_create_subdocument(id),
        }
    }

    fn import(&mut self, doc: &DocTarget, update: &[u8]) -> Result<()> {
        self.replica_for(doc).import(update)?;
        if *doc == DocTarget::Root {
            self.pull();
        }
        Ok(())
    }

    fn pull(&mut self) {
        let batches = self.binding.replica_mut().observe(Origin::Remote);
        if batches.is_empty() && self.binding.pending.is_empty() {
            return;
        }
        let report =
            pull_remote_events(&mut self.binding, self.provider.as_ref(), &mut self.model, batches);
        if report.update.is_some() {
            self.refresh_cursors();
        }
    }

    fn refresh_cursors(&mut self) {
        let snapshot = self.model.snapshot();
        if sync_cursor_positions(&mut self.binding, self.provider.as_ref(), &snapshot) {
            self.signals.emit(HostSignal::CursorsChanged);
        }
    }

    /// Rebuild after a push that failed part way through.
    fn recover(&mut self) {
        if self.binding.needs_reload() {
            warn!("Local state diverged from the shared document, reloading");
            self.reload();
        }
    }

    /// Drop local state and rebuild it from the shared document.
    pub fn reload(&mut self) {
        info!("Reloading {} from shared document", self.binding.session_id());
        self.binding.clear_shadows();
        self.binding.replica_mut().reset_observer();
        self.model.update(UpdateTags::collaboration(), |draft| {
            draft.clear_children(&NodeKey::root());
        });
        self.pull();
        self.undo.clear();
        self.selection = None;
        self.broadcaster.reset();
        self.emit_undo_state();
        self.signals.emit(HostSignal::Reloaded);
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn set_selection(&mut self, selection: Option<Selection>) {
        if self.selection != selection {
            self.selection = selection;
            self.broadcaster.mark_dirty();
        }
    }

    /// End of an update tick: broadcast our presence if it changed.
    pub fn flush_tick(&mut self) -> Result<bool> {
        let color = self
            .config
            .color
            .clone()
            .unwrap_or_else(|| self.client_id().color().to_string());
        let snapshot = self.model.snapshot();
        let sent = self.broadcaster.flush(
            &self.binding,
            self.provider.as_ref(),
            &snapshot,
            self.selection.as_ref(),
            &self.config.name,
            &color,
        )?;
        Ok(sent)
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let mut cursors: Vec<RemoteCursor> = self.binding.remote_cursors().cloned().collect();
        cursors.sort_by_key(|c| c.peer);
        cursors
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn undo(&mut self) -> Result<bool> {
        let undone = self
            .undo
            .undo(&mut self.binding, self.provider.as_ref(), &mut self.model)
            .inspect_err(|_| self.recover())?;
        self.emit_undo_state();
        Ok(undone)
    }

    pub fn redo(&mut self) -> Result<bool> {
        let redone = self
            .undo
            .redo(&mut self.binding, self.provider.as_ref(), &mut self.model)
            .inspect_err(|_| self.recover())?;
        self.emit_undo_state();
        Ok(redone)
    }

    fn emit_undo_state(&mut self) {
        let state = (self.undo.can_undo(), self.undo.can_redo());
        if state != self.undo_state {
            self.undo_state = state;
            self.signals.emit(HostSignal::UndoStackChanged {
                can_undo: state.0,
                can_redo: state.1,
            });
        }
    }

    /// Leave the session: clear our presence, disconnect and release the binding.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.provider.status().is_connected() {
            if let Err(e) = self.provider.set_local_presence(None) {
                warn!("Failed to clear presence: {}", e);
            }
            self.provider.disconnect().await?;
        }
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.binding.destroy();
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Point;
    use crate::loopback::{LoopbackHub, LoopbackProvider};
    use crate::model::LocalDocument;
    use crate::snapshot::NodeSpec;

    type Session = CollabSession<LocalDocument, LoopbackProvider>;

    fn session(hub: &Arc<LoopbackHub>, id: u64, bootstrap: bool) -> Session {
        let provider = hub.provider(PeerId::from(id));
        let config = CollabConfig::default()
            .with_name(format!("peer-{}", id))
            .with_bootstrap(bootstrap);
        CollabSession::new(LocalDocument::default(), provider, "doc", config)
    }

    fn settle(sessions: &mut [&mut Session]) {
        loop {
            let mut processed = 0;
            for session in sessions.iter_mut() {
                processed += session.process_inbox().unwrap();
            }
            if processed == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_bootstrap_then_join() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, 1, true);
        a.update(|d| {
            d.append(
                &NodeKey::root(),
                NodeSpec::paragraph().with_child(NodeSpec::text("hello")),
            );
        })
        .unwrap();
        a.connect().await.unwrap();

        let mut b = session(&hub, 2, false);
        b.connect().await.unwrap();
        settle(&mut [&mut a, &mut b]);

        assert_eq!(b.snapshot().plain_text(), "hello");
        assert_eq!(a.snapshot().structure(), b.snapshot().structure());
        assert!(b.binding().verify(&b.snapshot()).is_empty());
    }

    #[tokio::test]
    async fn test_connection_signals() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, 1, false);
        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = signals.clone();
        let _sub = a.subscribe_signals(move |signal| sink.lock().unwrap().push(signal));

        assert!(a.request_toggle_connection().await.unwrap());
        assert!(!a.request_toggle_connection().await.unwrap());

        let signals = signals.lock().unwrap();
        assert_eq!(
            *signals,
            vec![
                HostSignal::Connected { connected: true },
                HostSignal::Connected { connected: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_cursor_appears() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, 1, true);
        let mut b = session(&hub, 2, false);
        a.update(|d| {
            d.append(
                &NodeKey::root(),
                NodeSpec::paragraph().with_child(NodeSpec::text("hello").with_key("t")),
            );
        })
        .unwrap();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        settle(&mut [&mut a, &mut b]);

        a.set_selection(Some(Selection::collapsed(Point::new("t", 2))));
        assert!(a.flush_tick().unwrap());
        assert!(!a.flush_tick().unwrap());
        settle(&mut [&mut a, &mut b]);

        let cursors = b.remote_cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].name, "peer-1");
        let selection = cursors[0].selection.clone().unwrap();
        assert_eq!(selection.focus.offset, 2);
        assert_eq!(b.snapshot().text(&selection.focus.key), Some("hello"));
    }

    #[tokio::test]
    async fn test_reload_rebuilds_from_shared() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, 1, true);
        a.update(|d| {
            d.append(
                &NodeKey::root(),
                NodeSpec::paragraph().with_child(NodeSpec::text("keep me")),
            );
        })
        .unwrap();
        let before = a.snapshot().structure();
        a.reload();
        assert_eq!(a.snapshot().structure(), before);
        assert!(!a.can_undo());
        assert!(a.binding().verify(&a.snapshot()).is_empty());
    }

    #[tokio::test]
    async fn test_sync_request_from_departed_peer_is_skipped() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, 1, false);
        let mut b = session(&hub, 2, false);
        let mut c = session(&hub, 3, false);
        a.connect().await.unwrap();
        c.connect().await.unwrap();
        settle(&mut [&mut a, &mut c]);

        // B's sync request lands in A's inbox, then B leaves before A answers.
        b.connect().await.unwrap();
        b.disconnect().await.unwrap();
        c.update(|d| {
            d.append(
                &NodeKey::root(),
                NodeSpec::paragraph().with_child(NodeSpec::text("after")),
            );
        })
        .unwrap();

        assert!(a.pending_events() >= 2);
        a.process_inbox().unwrap();
        assert_eq!(a.pending_events(), 0);
        assert_eq!(a.snapshot().plain_text(), "after");
    }

    #[tokio::test]
    async fn test_failed_push_reloads_from_shared() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, 1, true);
        a.update(|d| {
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("p1"));
            d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("p2"));
        })
        .unwrap();
        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = signals.clone();
        let _sub = a.subscribe_signals(move |signal| sink.lock().unwrap().push(signal));

        // Drop p1 behind the shadows' back so removing p2 hits a missing child.
        a.binding
            .replica_mut()
            .remove_child(&SharedRef::root(), 0)
            .unwrap();
        let result = a.update(|d| {
            d.remove(&NodeKey::from("p2"));
        });

        assert!(matches!(result, Err(SessionError::Push(_))));
        assert!(!a.binding().needs_reload());
        assert!(signals.lock().unwrap().contains(&HostSignal::Reloaded));
        let snapshot = a.snapshot();
        assert_eq!(snapshot.children(&NodeKey::root()).len(), 1);
        assert!(a.binding().verify(&snapshot).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_binding() {
        let hub = LoopbackHub::new();
        let mut a = session(&hub, 1, false);
        a.connect().await.unwrap();
        a.shutdown().await.unwrap();
        assert!(!a.is_connected());
        assert_eq!(a.binding().shadows().len(), 1);
    }
}
