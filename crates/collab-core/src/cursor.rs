//! Cursor and presence sync.
//!
//! Local selections are encoded as positions anchored to the shared
//! document so they survive concurrent edits. Remote positions are decoded
//! against the receiver's current snapshot; a position that cannot be
//! resolved yet hides the cursor instead of guessing.

use crate::binding::Binding;
use crate::delta::SharedRef;
use crate::peer_id::PeerId;
use crate::provider::{Provider, ProviderError};
use crate::snapshot::{NodeKey, NodeKind, Snapshot};
use crate::text;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// A point in the local tree: UTF-16 offset in a text node, child index in an element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub key: NodeKey,
    pub offset: usize,
}

impl Point {
    pub fn new(key: impl Into<NodeKey>, offset: usize) -> Self {
        Self {
            key: key.into(),
            offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

/// A point anchored to the shared document.
///
/// `cursor` is the replica's relocatable encoding; `offset` is the position
/// at encode time, used only when no cursor could be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativePosition {
    pub node: SharedRef,
    pub cursor: Option<Vec<u8>>,
    pub offset: usize,
}

/// Presence published on the awareness channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub name: String,
    pub color: String,
    pub anchor: Option<RelativePosition>,
    pub focus: Option<RelativePosition>,
    pub focusing: bool,
}

/// A peer's cursor as resolved against our snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCursor {
    pub peer: PeerId,
    pub name: String,
    pub color: String,
    pub anchor: Option<RelativePosition>,
    pub focus: Option<RelativePosition>,
    /// `None` while the position cannot be resolved locally.
    pub selection: Option<Selection>,
}

impl RemoteCursor {
    pub fn is_visible(&self) -> bool {
        self.selection.is_some()
    }
}

/// Encode `point` as a position anchored to the shared document.
pub fn encode_point(
    binding: &Binding,
    snapshot: &Snapshot,
    point: &Point,
) -> Option<RelativePosition> {
    let shadow = binding.shadow(&point.key)?;
    let replica = binding.replica();
    match shadow.kind() {
        NodeKind::Text => {
            let content = snapshot.text(&point.key).unwrap_or_default();
            let len = text::utf16_len(content);
            if point.offset > len {
                warn!(
                    "Selection offset {} past end of {} ({} units), clamping",
                    point.offset, point.key, len
                );
            }
            let offset = point.offset.min(len);
            Some(RelativePosition {
                node: shadow.shared.clone(),
                cursor: replica.text_cursor(&shadow.shared, offset),
                offset,
            })
        }
        NodeKind::Element => {
            let offset = point.offset.min(shadow.children().len());
            Some(RelativePosition {
                node: shadow.shared.clone(),
                cursor: replica.child_cursor(&shadow.shared, offset),
                offset,
            })
        }
        // Leaves without content anchor before or after themselves in the parent.
        NodeKind::LineBreak | NodeKind::Decorator => {
            let parent = shadow.parent.as_ref()?;
            let index = binding.shadows().children(parent).iter().position(|k| k == &point.key)?;
            let parent_shadow = binding.shadow(parent)?;
            let offset = index + point.offset.min(1);
            Some(RelativePosition {
                node: parent_shadow.shared.clone(),
                cursor: replica.child_cursor(&parent_shadow.shared, offset),
                offset,
            })
        }
    }
}

/// Resolve a relative position against `snapshot`. `None` if not materialized here.
pub fn decode_point(
    binding: &Binding,
    snapshot: &Snapshot,
    position: &RelativePosition,
) -> Option<Point> {
    let key = binding.key_for(&position.node)?;
    let node = snapshot.get(key)?;
    let replica = binding.replica();
    let offset = match node.kind {
        NodeKind::Text => {
            let resolved = match &position.cursor {
                Some(cursor) => replica.resolve_text_cursor(&position.node, cursor)?.offset,
                None => position.offset,
            };
            resolved.min(text::utf16_len(&node.text))
        }
        NodeKind::Element => {
            let resolved = match &position.cursor {
                Some(cursor) => replica.resolve_child_cursor(&position.node, cursor)?.offset,
                None => position.offset,
            };
            resolved.min(node.children.len())
        }
        NodeKind::LineBreak | NodeKind::Decorator => return None,
    };
    Some(Point {
        key: key.clone(),
        offset,
    })
}

/// Offset of `point` within its enclosing block: prior siblings plus the point offset.
pub fn block_offset(binding: &Binding, point: &Point) -> usize {
    match binding.shadow(&point.key) {
        Some(shadow) if shadow.kind() == NodeKind::Text => {
            binding.shadows().offset(&point.key) + point.offset
        }
        _ => point.offset,
    }
}

/// Build the presence state for our selection.
pub fn encode_selection(
    binding: &Binding,
    snapshot: &Snapshot,
    selection: Option<&Selection>,
    name: &str,
    color: &str,
) -> AwarenessState {
    let (anchor, focus) = match selection {
        Some(selection) => (
            encode_point(binding, snapshot, &selection.anchor),
            encode_point(binding, snapshot, &selection.focus),
        ),
        None => (None, None),
    };
    AwarenessState {
        name: name.to_string(),
        color: color.to_string(),
        focusing: anchor.is_some() && focus.is_some(),
        anchor,
        focus,
    }
}

/// Refresh the remote cursor table from the provider's awareness map.
///
/// Every position is decoded against `snapshot`. Returns whether the table changed.
pub fn sync_cursor_positions<P: Provider + ?Sized>(
    binding: &mut Binding,
    provider: &P,
    snapshot: &Snapshot,
) -> bool {
    let client_id = provider.client_id();
    let states = provider.awareness().peers();
    let mut changed = false;
    let mut live = HashSet::new();

    for (peer, state) in states {
        if peer == client_id {
            continue;
        }
        live.insert(peer);
        let selection = if state.focusing {
            match (&state.anchor, &state.focus) {
                (Some(anchor), Some(focus)) => {
                    match (
                        decode_point(binding, snapshot, anchor),
                        decode_point(binding, snapshot, focus),
                    ) {
                        (Some(anchor), Some(focus)) => Some(Selection { anchor, focus }),
                        _ => {
                            trace!("Hiding cursor of {}: position not resolvable yet", peer);
                            None
                        }
                    }
                }
                _ => None,
            }
        } else {
            None
        };
        let cursor = RemoteCursor {
            peer,
            name: state.name,
            color: state.color,
            anchor: state.anchor,
            focus: state.focus,
            selection,
        };
        if binding.cursors.get(&peer) != Some(&cursor) {
            binding.cursors.insert(peer, cursor);
            changed = true;
        }
    }

    let before = binding.cursors.len();
    binding.cursors.retain(|peer, _| live.contains(peer));
    if binding.cursors.len() != before {
        debug!("Dropped {} departed cursors", before - binding.cursors.len());
        changed = true;
    }
    changed
}

/// Coalesces local selection broadcasts to at most one per tick.
#[derive(Debug, Default)]
pub struct CursorBroadcaster {
    dirty: bool,
    last_sent: Option<AwarenessState>,
}

impl CursorBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Send our presence if something was marked since the last flush and it
    /// differs from what peers last saw. Returns whether a message went out.
    pub fn flush<P: Provider + ?Sized>(
        &mut self,
        binding: &Binding,
        provider: &P,
        snapshot: &Snapshot,
        selection: Option<&Selection>,
        name: &str,
        color: &str,
    ) -> Result<bool, ProviderError> {
        if !self.dirty {
            return Ok(false);
        }
        self.dirty = false;
        let state = encode_selection(binding, snapshot, selection, name, color);
        if self.last_sent.as_ref() == Some(&state) {
            return Ok(false);
        }
        provider.set_local_presence(Some(state.clone()))?;
        self.last_sent = Some(state);
        Ok(true)
    }

    /// Forget what was sent so the next flush goes out unconditionally.
    pub fn reset(&mut self) {
        self.last_sent = None;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_collapsed() {
        let selection = Selection::collapsed(Point::new("t1", 3));
        assert!(selection.is_collapsed());
        let range = Selection {
            anchor: Point::new("t1", 0),
            focus: Point::new("t1", 3),
        };
        assert!(!range.is_collapsed());
    }

    #[test]
    fn test_awareness_state_bincode_roundtrip() {
        let state = AwarenessState {
            name: "ana".into(),
            color: "#e6194b".into(),
            anchor: Some(RelativePosition {
                node: SharedRef::new("cid:1@2:Map"),
                cursor: Some(vec![1, 2, 3]),
                offset: 4,
            }),
            focus: None,
            focusing: true,
        };
        let bytes = bincode::serialize(&state).unwrap();
        let back: AwarenessState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, state);
    }
}
