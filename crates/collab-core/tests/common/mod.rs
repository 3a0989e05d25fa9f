//! Shared fixtures for the collab-core integration tests.
#![allow(dead_code)]

use collab_core::{
    CollabConfig, CollabSession, LocalDocument, LoopbackHub, LoopbackProvider, NodeKey, NodeSpec,
    PeerId, Snapshot,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub type Session = CollabSession<LocalDocument, LoopbackProvider>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two paragraphs: `p1` holding text `t1` and `p2` holding text `t2`.
pub fn seed_document(first: &str, second: &str) -> Snapshot {
    Snapshot::from_specs([
        NodeSpec::paragraph()
            .with_key("p1")
            .with_child(NodeSpec::text(first).with_key("t1")),
        NodeSpec::paragraph()
            .with_key("p2")
            .with_child(NodeSpec::text(second).with_key("t2")),
    ])
}

fn config(id: u64, bootstrap: bool) -> CollabConfig {
    CollabConfig::default()
        .with_name(format!("peer-{}", id))
        .with_bootstrap(bootstrap)
        .with_undo(100, Duration::ZERO)
}

/// A session for `id`. The first peer carries `seed` and bootstraps the shared document.
pub fn peer(hub: &Arc<LoopbackHub>, id: u64, seed: Option<Snapshot>) -> Session {
    let provider = hub.provider(PeerId::from(id));
    let bootstrap = seed.is_some();
    let model = seed.map(LocalDocument::new).unwrap_or_default();
    CollabSession::new(model, provider, "doc", config(id, bootstrap))
}

/// `count` connected peers, all synced to `seed`.
pub async fn network(count: u64, seed: Snapshot) -> (Arc<LoopbackHub>, Vec<Session>) {
    init_tracing();
    let hub = LoopbackHub::new();
    let mut peers: Vec<Session> = (1..=count)
        .map(|id| peer(&hub, id, (id == 1).then(|| seed.clone())))
        .collect();
    for session in peers.iter_mut() {
        session.connect().await.expect("connect");
    }
    settle(&mut peers);
    (hub, peers)
}

/// Drain every inbox until no peer has anything left to process.
pub fn settle(peers: &mut [Session]) {
    for _ in 0..1000 {
        let mut processed = 0;
        for session in peers.iter_mut() {
            processed += session.process_inbox().expect("process inbox");
        }
        if processed == 0 {
            return;
        }
    }
    panic!("network did not settle");
}

pub fn assert_converged(peers: &[Session]) {
    let expected = peers[0].snapshot().structure();
    for session in peers {
        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.structure(),
            expected,
            "peer {} diverged",
            session.client_id()
        );
        let problems = session.binding().verify(&snapshot);
        assert!(problems.is_empty(), "peer {}: {:?}", session.client_id(), problems);
    }
}

pub fn text_of(session: &Session, key: &str) -> String {
    session
        .snapshot()
        .text(&NodeKey::from(key))
        .unwrap_or_default()
        .to_string()
}

pub fn root_children(session: &Session) -> Vec<String> {
    session
        .snapshot()
        .children(&NodeKey::root())
        .iter()
        .map(|k| k.to_string())
        .collect()
}
