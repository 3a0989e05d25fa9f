//! collab-core: keeps a host editor's document tree in sync with a shared Loro document.
//!
//! This crate provides:
//! - Push sync: diffing local snapshots into shared-document transactions
//! - Pull sync: applying remote deltas to the local tree, including moves
//! - Cursor and presence sync over the provider's awareness channel
//! - Collaborative undo limited to the local client's own changes
//! - A `Provider` transport abstraction with an in-process loopback

pub mod binding;
pub mod config;
pub mod cursor;
pub mod delta;
pub mod diff;
pub mod events;
pub mod loopback;
pub mod message;
pub mod model;
pub mod peer_id;
pub mod provider;
pub mod pull;
pub mod push;
pub mod replica;
pub mod session;
pub mod shadow;
pub mod snapshot;
pub mod text;
pub mod undo;

pub use binding::{Binding, SyncStats, create_binding};
pub use config::{CollabConfig, ConfigError};
pub use cursor::{AwarenessState, Point, RemoteCursor, Selection, sync_cursor_positions};
pub use delta::{DeltaBatch, Origin, SharedRef};
pub use events::{EventBus, HostSignal, Subscription};
pub use loopback::{LoopbackHub, LoopbackProvider};
pub use message::{CollabMessage, DocTarget};
pub use model::{DocumentModel, LocalDocument, LocalUpdate, UpdateTags};
pub use peer_id::{PeerId, PeerIdError};
pub use provider::{ConnectionStatus, Provider, ProviderError, ProviderEvent};
pub use pull::{PullReport, pull_remote_events};
pub use push::{AppliedChange, PushError, PushReport, push_local_update};
pub use replica::{Replica, ReplicaError};
pub use session::{CollabSession, SessionError};
pub use shadow::AttributeFilter;
pub use snapshot::{NodeKey, NodeKind, NodeSpec, Snapshot, SnapshotDraft};
pub use undo::{UndoManager, create_undo_manager};
