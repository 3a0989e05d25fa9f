//! Provider trait: the transport seen by the sync engine.
//!
//! A provider moves `CollabMessage`s between peers, reports connection
//! status and carries the ephemeral awareness channel. Framing,
//! reconnection and backoff are the provider's business.

use crate::cursor::AwarenessState;
use crate::events::Subscription;
use crate::message::CollabMessage;
use crate::peer_id::PeerId;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Not connected")]
    NotConnected,

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Provider error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// What a provider tells its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    /// Initial sync with the network finished (`true`) or was lost.
    Sync(bool),
    Message { from: PeerId, message: CollabMessage },
    /// A peer's presence changed; read it from `Provider::awareness`.
    Awareness { peer: PeerId },
    /// The host should drop local state and rebuild from the shared document.
    Reload,
}

pub type EventCallback = Box<dyn Fn(ProviderEvent) + Send + Sync>;

/// Presence states: ours plus the last one seen from each peer.
#[derive(Default)]
pub struct Awareness {
    local: RwLock<Option<AwarenessState>>,
    peers: RwLock<HashMap<PeerId, AwarenessState>>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> Option<AwarenessState> {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_local(&self, state: Option<AwarenessState>) {
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn peer(&self, peer: &PeerId) -> Option<AwarenessState> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }

    pub fn peers(&self) -> HashMap<PeerId, AwarenessState> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record a peer's state (`None` removes it). Returns whether anything changed.
    pub fn apply(&self, peer: PeerId, state: Option<AwarenessState>) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match state {
            Some(state) => peers.insert(peer, state.clone()).as_ref() != Some(&state),
            None => peers.remove(&peer).is_some(),
        }
    }

    pub fn clear_peers(&self) {
        self.peers.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Provider: Send + Sync {
    /// Our client id; also the replica's writer id.
    fn client_id(&self) -> PeerId;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn status(&self) -> ConnectionStatus;

    /// Register for provider events. Dropping the handle unsubscribes.
    fn subscribe(&self, callback: EventCallback) -> Subscription;

    /// Broadcast to every connected peer.
    fn send(&self, message: CollabMessage) -> Result<()>;

    fn send_to(&self, peer: PeerId, message: CollabMessage) -> Result<()>;

    fn awareness(&self) -> &Awareness;

    /// Publish our presence on the ephemeral channel.
    fn set_local_presence(&self, state: Option<AwarenessState>) -> Result<()> {
        self.awareness().set_local(state.clone());
        self.send(CollabMessage::Awareness {
            peer: self.client_id(),
            state,
        })
    }
}
