//! Wire messages exchanged through a provider.
//!
//! Document payloads are opaque replica update bytes; versions are encoded
//! version vectors. Envelopes are bincode on the wire.

use crate::cursor::AwarenessState;
use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// Which replica a payload belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocTarget {
    Root,
    /// Embedded sub-document, by id.
    Sub(String),
}

impl Display for DocTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DocTarget::Root => write!(f, "root"),
            DocTarget::Sub(id) => write!(f, "sub:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollabMessage {
    /// Ask a peer for what we are missing. Carries our encoded version.
    SyncRequest { doc: DocTarget, version: Vec<u8> },

    /// Answer to a request: the requester's missing updates plus our own
    /// version so the requester can send back what we lack.
    SyncExchange {
        doc: DocTarget,
        update: Vec<u8>,
        version: Vec<u8>,
    },

    /// Final leg of an exchange.
    SyncResponse { doc: DocTarget, update: Vec<u8> },

    /// Incremental update from a local push.
    Update { doc: DocTarget, update: Vec<u8> },

    /// Presence change. `None` means the peer left.
    Awareness {
        peer: PeerId,
        state: Option<AwarenessState>,
    },
}

impl CollabMessage {
    pub fn doc(&self) -> Option<&DocTarget> {
        match self {
            CollabMessage::SyncRequest { doc, .. }
            | CollabMessage::SyncExchange { doc, .. }
            | CollabMessage::SyncResponse { doc, .. }
            | CollabMessage::Update { doc, .. } => Some(doc),
            CollabMessage::Awareness { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CollabMessage::SyncRequest { .. } => "sync-request",
            CollabMessage::SyncExchange { .. } => "sync-exchange",
            CollabMessage::SyncResponse { .. } => "sync-response",
            CollabMessage::Update { .. } => "update",
            CollabMessage::Awareness { .. } => "awareness",
        }
    }
}

/// A message with its routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    /// `None` broadcasts to every connected peer.
    pub to: Option<PeerId>,
    pub message: CollabMessage,
}

impl Envelope {
    pub fn broadcast(from: PeerId, message: CollabMessage) -> Self {
        Self {
            from,
            to: None,
            message,
        }
    }

    pub fn direct(from: PeerId, to: PeerId, message: CollabMessage) -> Self {
        Self {
            from,
            to: Some(to),
            message,
        }
    }

    pub fn is_for(&self, peer: PeerId) -> bool {
        self.from != peer && self.to.is_none_or(|to| to == peer)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MessageError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| MessageError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::direct(
            PeerId::from(1),
            PeerId::from(2),
            CollabMessage::SyncExchange {
                doc: DocTarget::Sub("table".into()),
                update: vec![1, 2, 3],
                version: vec![4],
            },
        );
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_is_for_routing() {
        let broadcast = Envelope::broadcast(
            PeerId::from(1),
            CollabMessage::Update {
                doc: DocTarget::Root,
                update: vec![],
            },
        );
        assert!(!broadcast.is_for(PeerId::from(1)));
        assert!(broadcast.is_for(PeerId::from(3)));

        let direct = Envelope::direct(
            PeerId::from(1),
            PeerId::from(2),
            CollabMessage::SyncRequest {
                doc: DocTarget::Root,
                version: vec![],
            },
        );
        assert!(direct.is_for(PeerId::from(2)));
        assert!(!direct.is_for(PeerId::from(3)));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Envelope::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_doc_target_display() {
        assert_eq!(DocTarget::Root.to_string(), "root");
        assert_eq!(DocTarget::Sub("t".into()).to_string(), "sub:t");
    }
}
