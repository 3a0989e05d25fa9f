//! In-process provider: peers connected through a shared hub.
//!
//! Messages are encoded to bytes and decoded on delivery like a real wire.
//! Delivery is synchronous, to every connected peer the envelope is
//! addressed to. Updates sent while offline wait in an outbox until the
//! next connect; presence sent while offline is dropped.

use crate::cursor::AwarenessState;
use crate::events::{EventBus, Subscription};
use crate::message::{CollabMessage, Envelope};
use crate::peer_id::PeerId;
use crate::provider::{
    Awareness, ConnectionStatus, EventCallback, Provider, ProviderError, ProviderEvent, Result,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, trace, warn};

/// Registry of loopback peers.
#[derive(Default)]
pub struct LoopbackHub {
    peers: Mutex<BTreeMap<PeerId, Weak<LoopbackProvider>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a provider for `client_id`, initially disconnected.
    pub fn provider(self: &Arc<Self>, client_id: PeerId) -> Arc<LoopbackProvider> {
        let provider = Arc::new(LoopbackProvider {
            client_id,
            hub: Arc::downgrade(self),
            status: RwLock::new(ConnectionStatus::Disconnected),
            outbox: Mutex::new(Vec::new()),
            events: Arc::new(EventBus::new()),
            awareness: Awareness::new(),
            sent: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
        });
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id, Arc::downgrade(&provider));
        provider
    }

    fn connected_peers(&self) -> Vec<Arc<LoopbackProvider>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(Weak::upgrade)
            .filter(|p| p.status().is_connected())
            .collect()
    }

    fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let bytes = envelope
            .encode()
            .map_err(|e| ProviderError::SendFailed(e.to_string()))?;
        // The hub lock is released before any recipient runs its callbacks.
        let recipients: Vec<_> = self
            .connected_peers()
            .into_iter()
            .filter(|p| envelope.is_for(p.client_id))
            .collect();
        if let Some(to) = envelope.to {
            if recipients.is_empty() {
                return Err(ProviderError::PeerNotFound(to));
            }
        }
        for recipient in recipients {
            recipient.receive(&bytes);
        }
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| p.strong_count() > 0)
            .count()
    }
}

pub struct LoopbackProvider {
    client_id: PeerId,
    hub: Weak<LoopbackHub>,
    status: RwLock<ConnectionStatus>,
    outbox: Mutex<Vec<Envelope>>,
    events: Arc<EventBus<ProviderEvent>>,
    awareness: Awareness,
    sent: AtomicUsize,
    received: AtomicUsize,
}

impl LoopbackProvider {
    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
        self.events.emit(ProviderEvent::Status(status));
    }

    fn hub(&self) -> Result<Arc<LoopbackHub>> {
        self.hub
            .upgrade()
            .ok_or_else(|| ProviderError::Other("hub dropped".to_string()))
    }

    fn dispatch(&self, envelope: Envelope) -> Result<()> {
        if !self.status().is_connected() {
            match envelope.message {
                CollabMessage::Update { .. } => {
                    trace!("{} offline, queueing update", self.client_id);
                    self.outbox
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(envelope);
                }
                _ => trace!("{} offline, dropping {}", self.client_id, envelope.message.kind()),
            }
            return Ok(());
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.hub()?.deliver(&envelope)
    }

    fn receive(&self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{} dropped undecodable message: {}", self.client_id, e);
                return;
            }
        };
        self.received.fetch_add(1, Ordering::Relaxed);
        match envelope.message {
            CollabMessage::Awareness { peer, state } => self.apply_awareness(peer, state),
            message => self.events.emit(ProviderEvent::Message {
                from: envelope.from,
                message,
            }),
        }
    }

    fn apply_awareness(&self, peer: PeerId, state: Option<AwarenessState>) {
        if peer != self.client_id && self.awareness.apply(peer, state) {
            self.events.emit(ProviderEvent::Awareness { peer });
        }
    }

    /// Ask the host to rebuild from the shared document.
    pub fn request_reload(&self) {
        self.events.emit(ProviderEvent::Reload);
    }

    pub fn messages_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Provider for LoopbackProvider {
    fn client_id(&self) -> PeerId {
        self.client_id
    }

    async fn connect(&self) -> Result<()> {
        if self.status().is_connected() {
            return Ok(());
        }
        let hub = self.hub()?;
        self.set_status(ConnectionStatus::Connecting);
        self.set_status(ConnectionStatus::Connected);
        debug!("{} connected", self.client_id);

        let queued = std::mem::take(&mut *self.outbox.lock().unwrap_or_else(|e| e.into_inner()));
        for envelope in queued {
            hub.deliver(&envelope)?;
        }

        // Exchange presence with everyone already online.
        if let Some(state) = self.awareness.local() {
            hub.deliver(&Envelope::broadcast(
                self.client_id,
                CollabMessage::Awareness {
                    peer: self.client_id,
                    state: Some(state),
                },
            ))?;
        }
        for peer in hub.connected_peers() {
            if peer.client_id != self.client_id {
                if let Some(state) = peer.awareness.local() {
                    self.apply_awareness(peer.client_id, Some(state));
                }
            }
        }

        self.events.emit(ProviderEvent::Sync(true));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.status().is_connected() {
            return Ok(());
        }
        let hub = self.hub()?;
        hub.deliver(&Envelope::broadcast(
            self.client_id,
            CollabMessage::Awareness {
                peer: self.client_id,
                state: None,
            },
        ))?;
        self.set_status(ConnectionStatus::Disconnected);

        let departed: Vec<PeerId> = self.awareness.peers().into_keys().collect();
        self.awareness.clear_peers();
        for peer in departed {
            self.events.emit(ProviderEvent::Awareness { peer });
        }
        self.events.emit(ProviderEvent::Sync(false));
        debug!("{} disconnected", self.client_id);
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(&self, callback: EventCallback) -> Subscription {
        self.events.subscribe(move |event| callback(event))
    }

    fn send(&self, message: CollabMessage) -> Result<()> {
        self.dispatch(Envelope::broadcast(self.client_id, message))
    }

    fn send_to(&self, peer: PeerId, message: CollabMessage) -> Result<()> {
        self.dispatch(Envelope::direct(self.client_id, peer, message))
    }

    fn awareness(&self) -> &Awareness {
        &self.awareness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DocTarget;

    fn collect(provider: &LoopbackProvider) -> (Arc<Mutex<Vec<ProviderEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = provider.subscribe(Box::new(move |event| sink.lock().unwrap().push(event)));
        (seen, sub)
    }

    fn update(byte: u8) -> CollabMessage {
        CollabMessage::Update {
            doc: DocTarget::Root,
            update: vec![byte],
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_peers_only() {
        let hub = LoopbackHub::new();
        let a = hub.provider(PeerId::from(1));
        let b = hub.provider(PeerId::from(2));
        let c = hub.provider(PeerId::from(3));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let (b_events, _b_sub) = collect(&b);
        let (c_events, _c_sub) = collect(&c);

        a.send(update(7)).unwrap();

        let b_events = b_events.lock().unwrap();
        assert!(b_events.contains(&ProviderEvent::Message {
            from: PeerId::from(1),
            message: update(7)
        }));
        assert!(c_events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_updates_flush_on_connect() {
        let hub = LoopbackHub::new();
        let a = hub.provider(PeerId::from(1));
        let b = hub.provider(PeerId::from(2));
        b.connect().await.unwrap();
        let (b_events, _sub) = collect(&b);

        a.send(update(1)).unwrap();
        assert_eq!(a.queued(), 1);
        assert!(b_events.lock().unwrap().is_empty());

        a.connect().await.unwrap();
        assert_eq!(a.queued(), 0);
        assert_eq!(b_events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_presence_on_peers() {
        let hub = LoopbackHub::new();
        let a = hub.provider(PeerId::from(1));
        let b = hub.provider(PeerId::from(2));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        a.set_local_presence(Some(AwarenessState {
            name: "a".into(),
            color: "#000".into(),
            anchor: None,
            focus: None,
            focusing: false,
        }))
        .unwrap();
        assert!(b.awareness().peer(&PeerId::from(1)).is_some());

        a.disconnect().await.unwrap();
        assert!(b.awareness().peer(&PeerId::from(1)).is_none());
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_emits_status_then_sync() {
        let hub = LoopbackHub::new();
        let a = hub.provider(PeerId::from(1));
        let (events, _sub) = collect(&a);
        a.connect().await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ProviderEvent::Status(ConnectionStatus::Connecting),
                ProviderEvent::Status(ConnectionStatus::Connected),
                ProviderEvent::Sync(true),
            ]
        );
    }

    #[tokio::test]
    async fn test_direct_message_to_missing_peer_fails() {
        let hub = LoopbackHub::new();
        let a = hub.provider(PeerId::from(1));
        a.connect().await.unwrap();
        assert!(matches!(
            a.send_to(PeerId::from(9), update(0)),
            Err(ProviderError::PeerNotFound(_))
        ));
    }
}
