//! Sync guarantees: idempotence, no echo, UTF-16 offsets, cursors, undo and ordering.

mod common;

use collab_core::cursor::block_offset;
use collab_core::{
    Binding, DocumentModel, LocalDocument, LoopbackHub, LoopbackProvider, NodeKey, NodeSpec,
    Origin, PeerId, Point, Replica, Selection, SnapshotDraft, UpdateTags, pull_remote_events,
    push_local_update,
};
use common::{assert_converged, network, seed_document, settle, text_of};
use std::collections::HashMap;
use std::sync::Arc;

struct Peer {
    binding: Binding,
    doc: LocalDocument,
    provider: Arc<LoopbackProvider>,
}

fn peer(hub: &Arc<LoopbackHub>, id: u64) -> Peer {
    let client = PeerId::from(id);
    Peer {
        binding: Binding::new(client, "props", Replica::new(client), HashMap::new()),
        doc: LocalDocument::default(),
        provider: hub.provider(client),
    }
}

fn edit(peer: &mut Peer, f: impl FnOnce(&mut SnapshotDraft)) {
    let update = peer.doc.update(UpdateTags::none(), f);
    push_local_update(&mut peer.binding, peer.provider.as_ref(), &update).unwrap();
}

#[test]
fn test_pull_is_idempotent() {
    let hub = LoopbackHub::new();
    let mut a = peer(&hub, 1);
    let mut b = peer(&hub, 2);
    edit(&mut a, |d| {
        d.append(
            &NodeKey::root(),
            NodeSpec::paragraph()
                .with_key("p")
                .with_child(NodeSpec::text("once").with_key("t")),
        );
    });

    let bytes = a.binding.replica().export_since_encoded(&[]).unwrap();
    b.binding.replica_mut().import(&bytes).unwrap();
    let batches = b.binding.replica_mut().observe(Origin::Remote);
    assert!(!batches.is_empty());

    let first =
        pull_remote_events(&mut b.binding, b.provider.as_ref(), &mut b.doc, batches.clone());
    assert!(first.update.is_some());
    let after_first = b.doc.snapshot().structure();

    let second =
        pull_remote_events(&mut b.binding, b.provider.as_ref(), &mut b.doc, batches.clone());
    assert_eq!(second.duplicates_dropped, batches.len());
    assert!(second.update.is_none());
    assert_eq!(b.doc.snapshot().structure(), after_first);
    assert_eq!(b.doc.snapshot().structure(), a.doc.snapshot().structure());
}

#[test]
fn test_own_changes_are_not_applied_back() {
    let hub = LoopbackHub::new();
    let mut a = peer(&hub, 1);
    let update = a.doc.update(UpdateTags::none(), |d| {
        d.append(&NodeKey::root(), NodeSpec::paragraph().with_child(NodeSpec::text("mine")));
    });
    let report = push_local_update(&mut a.binding, a.provider.as_ref(), &update).unwrap();
    assert_eq!(a.binding.stats().pushes, 1);
    assert!(!report.echo.is_empty());

    let before = a.doc.snapshot().epoch();
    let pulled =
        pull_remote_events(&mut a.binding, a.provider.as_ref(), &mut a.doc, report.echo.clone());
    assert_eq!(pulled.echoes_dropped, report.echo.len());
    assert_eq!(pulled.applied, 0);
    assert!(pulled.update.is_none());
    assert_eq!(a.doc.snapshot().epoch(), before);
}

#[tokio::test]
async fn test_no_echo_over_the_network() {
    let (_hub, mut peers) = network(2, seed_document("x", "y")).await;
    let pushes = peers[0].stats().pushes;
    let pulls = peers[0].stats().pulls;

    peers[0]
        .update(|d| {
            d.set_text(&NodeKey::from("t1"), "xx");
        })
        .unwrap();
    settle(&mut peers);

    assert_eq!(peers[0].stats().pushes, pushes + 1);
    assert_eq!(peers[0].stats().pulls, pulls);
    assert_eq!(text_of(&peers[1], "t1"), "xx");
}

#[tokio::test]
async fn test_surrogate_pairs_round_trip() {
    let (_hub, mut peers) = network(2, seed_document("ab", "")).await;

    peers[0]
        .update(|d| {
            d.splice_text(&NodeKey::from("t1"), 1, 0, "😀");
        })
        .unwrap();
    settle(&mut peers);
    assert_eq!(text_of(&peers[1], "t1"), "a😀b");
    assert_eq!(peers[1].binding().shadows().size(&NodeKey::from("t1")), 4);

    // Delete the emoji from the other side: two UTF-16 units at offset 1.
    peers[1]
        .update(|d| {
            d.splice_text(&NodeKey::from("t1"), 1, 2, "");
        })
        .unwrap();
    settle(&mut peers);
    assert_eq!(text_of(&peers[0], "t1"), "ab");
    assert_eq!(peers[0].binding().shadows().size(&NodeKey::from("t1")), 2);
    assert_converged(&peers);
}

#[tokio::test]
async fn test_remote_cursor_shifts_after_insert_before_it() {
    let (_hub, mut peers) = network(2, seed_document("hello world", "")).await;

    peers[1].set_selection(Some(Selection::collapsed(Point::new("t1", 6))));
    assert!(peers[1].flush_tick().unwrap());
    settle(&mut peers);

    let cursor = peers[0].remote_cursors().pop().unwrap();
    let point = cursor.selection.unwrap().focus;
    assert_eq!(point, Point::new("t1", 6));

    peers[0]
        .update(|d| {
            d.splice_text(&NodeKey::from("t1"), 0, 0, "12345");
        })
        .unwrap();

    let cursor = peers[0].remote_cursors().pop().unwrap();
    let point = cursor.selection.unwrap().focus;
    assert_eq!(point.offset, 11);
    assert_eq!(block_offset(peers[0].binding(), &point), 11);
}

#[tokio::test]
async fn test_departed_peer_cursor_is_removed() {
    let (_hub, mut peers) = network(2, seed_document("hi", "")).await;
    peers[1].set_selection(Some(Selection::collapsed(Point::new("t1", 1))));
    peers[1].flush_tick().unwrap();
    settle(&mut peers);
    assert_eq!(peers[0].remote_cursors().len(), 1);

    peers[1].disconnect().await.unwrap();
    settle(&mut peers);
    assert!(peers[0].remote_cursors().is_empty());
}

#[tokio::test]
async fn test_undo_leaves_peer_edits_alone() {
    let (_hub, mut peers) = network(2, seed_document("hello", "")).await;

    peers[0]
        .update(|d| {
            d.splice_text(&NodeKey::from("t1"), 5, 0, " world");
        })
        .unwrap();
    settle(&mut peers);
    peers[1]
        .update(|d| {
            d.splice_text(&NodeKey::from("t1"), 0, 0, "X");
        })
        .unwrap();
    settle(&mut peers);
    assert_eq!(text_of(&peers[0], "t1"), "Xhello world");

    assert!(peers[0].undo().unwrap());
    settle(&mut peers);
    assert_eq!(text_of(&peers[0], "t1"), "Xhello");
    assert_eq!(text_of(&peers[1], "t1"), "Xhello");

    assert!(peers[0].redo().unwrap());
    settle(&mut peers);
    assert_eq!(text_of(&peers[1], "t1"), "Xhello world");

    // The peer's own history is unaffected by ours.
    assert!(peers[1].undo().unwrap());
    settle(&mut peers);
    assert_eq!(text_of(&peers[0], "t1"), "hello world");
    assert_converged(&peers);
}

#[tokio::test]
async fn test_remote_updates_never_enter_undo_history() {
    let (_hub, mut peers) = network(2, seed_document("a", "b")).await;
    peers[1]
        .update(|d| {
            d.set_text(&NodeKey::from("t2"), "bb");
        })
        .unwrap();
    settle(&mut peers);
    assert!(!peers[0].can_undo());
    assert!(!peers[0].undo().unwrap());
    assert_eq!(text_of(&peers[0], "t2"), "bb");
}

#[test]
fn test_updates_arriving_out_of_order() {
    let hub = LoopbackHub::new();
    let mut a = peer(&hub, 1);
    let mut b = peer(&hub, 2);

    let v0 = a.binding.replica().version();
    edit(&mut a, |d| {
        d.append(&NodeKey::root(), NodeSpec::paragraph().with_key("p"));
    });
    let v1 = a.binding.replica().version();
    edit(&mut a, |d| {
        d.append(&NodeKey::from("p"), NodeSpec::text("late").with_key("t"));
    });
    let first = a.binding.replica().export_since(&v0).unwrap();
    let second = a.binding.replica().export_since(&v1).unwrap();

    b.binding.replica_mut().import(&second).unwrap();
    let batches = b.binding.replica_mut().observe(Origin::Remote);
    pull_remote_events(&mut b.binding, b.provider.as_ref(), &mut b.doc, batches);

    b.binding.replica_mut().import(&first).unwrap();
    let batches = b.binding.replica_mut().observe(Origin::Remote);
    pull_remote_events(&mut b.binding, b.provider.as_ref(), &mut b.doc, batches);

    assert_eq!(b.doc.snapshot().structure(), a.doc.snapshot().structure());
    assert_eq!(b.doc.snapshot().text(&NodeKey::from("t")), Some("late"));
    assert!(b.binding.verify(&b.doc.snapshot()).is_empty());
}
