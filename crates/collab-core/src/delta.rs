//! Delta batches observed on the shared document.
//!
//! A batch targets one shared node and lists sequence operations against
//! either its children (counted in nodes) or its text (counted in UTF-16
//! code units), plus an attribute patch.

use crate::snapshot::{Attrs, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Stable reference to one node in the shared document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SharedRef(String);

impl SharedRef {
    pub const ROOT: &'static str = "root";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SharedRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a batch in the observation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId {
    pub epoch: u64,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    /// Produced by this client's own push.
    Local,
    Remote,
}

/// Attribute changes: keys to set and keys to delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrPatch {
    pub set: BTreeMap<String, serde_json::Value>,
    pub removed: Vec<String>,
}

impl AttrPatch {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    pub fn apply_to(&self, attrs: &mut Attrs) {
        for key in &self.removed {
            attrs.remove(key);
        }
        for (key, value) in &self.set {
            attrs.insert(key.clone(), value.clone());
        }
    }
}

/// Shared state of an inserted subtree at observation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSnapshot {
    pub shared: SharedRef,
    /// Identity carried across moves; the creating client's node key.
    pub identity: String,
    pub kind: NodeKind,
    pub node_type: String,
    pub attrs: Attrs,
    pub text: String,
    pub children: Vec<SpanSnapshot>,
    /// Observer epoch the snapshot was taken in.
    pub epoch: u64,
}

impl SpanSnapshot {
    /// Shared refs of this span and all descendants.
    pub fn shared_refs(&self) -> Vec<SharedRef> {
        let mut out = vec![self.shared.clone()];
        for child in &self.children {
            out.extend(child.shared_refs());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedSpan {
    pub shared: SharedRef,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaOp {
    Retain(usize),
    InsertText(String),
    InsertSpans(Vec<SpanSnapshot>),
    /// Delete UTF-16 code units of text.
    Delete(usize),
    DeleteSpans(Vec<RemovedSpan>),
    Attributes(AttrPatch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub id: BatchId,
    pub origin: Origin,
    pub target: SharedRef,
    pub ops: Vec<DeltaOp>,
}

impl DeltaBatch {
    /// Identities of every span this batch deletes.
    pub fn removed_identities(&self) -> impl Iterator<Item = &str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DeltaOp::DeleteSpans(spans) => Some(spans.iter()),
                _ => None,
            })
            .flatten()
            .map(|span| span.identity.as_str())
    }

    pub fn inserted_spans(&self) -> impl Iterator<Item = &SpanSnapshot> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DeltaOp::InsertSpans(spans) => Some(spans.iter()),
                _ => None,
            })
            .flatten()
    }
}
