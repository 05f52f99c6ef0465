//! Branching source routes.
//!
//! A multipath is a tree of peer ids describing where a message should fan
//! out. Linear paths that share a head splice into one tree, so a single wire
//! packet can describe a whole forwarding plan and common prefixes are never
//! repeated.
//!
//! Invariants: children are strictly ordered by id, no child equals its
//! parent, and equality is recursive structural equality.

use broker_core::{
    wire::{self, Decode, Encode},
    Error, PeerId, Result,
};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decoder recursion limit; no sane forwarding plan nests deeper.
const MAX_DEPTH: usize = 2048;

/// A node in a branching source route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multipath {
    id: PeerId,
    children: Vec<Multipath>,
}

impl Multipath {
    /// Create a leaf node.
    pub fn new(id: PeerId) -> Self {
        Self { id, children: Vec::new() }
    }

    /// Build a chain from a linear path. Returns `None` for an empty path.
    pub fn from_linear(path: &[PeerId]) -> Option<Self> {
        let (head, rest) = path.split_first()?;
        let mut root = Self::new(head.clone());
        let mut node = &mut root;
        for id in rest {
            node = node.emplace_node(id.clone()).0;
        }
        Some(root)
    }

    /// This node's peer id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The children of this node, in strictly increasing id order.
    pub fn children(&self) -> &[Multipath] {
        &self.children
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Find or insert the child with the given id. Returns the child and
    /// whether it was newly inserted.
    pub fn emplace_node(&mut self, id: PeerId) -> (&mut Multipath, bool) {
        debug_assert_ne!(id, self.id, "a multipath child must not equal its parent");
        match self.children.binary_search_by(|child| child.id.cmp(&id)) {
            Ok(at) => (&mut self.children[at], false),
            Err(at) => {
                self.children.insert(at, Multipath::new(id));
                (&mut self.children[at], true)
            },
        }
    }

    /// Remove the direct child with the given id, dropping its subtree.
    pub fn remove_node(&mut self, id: &PeerId) -> bool {
        match self.children.binary_search_by(|child| child.id.cmp(id)) {
            Ok(at) => {
                self.children.remove(at);
                true
            },
            Err(_) => false,
        }
    }

    /// Merge a linear path into this tree. An empty path is a no-op reported
    /// as success; a path whose head differs from this node is rejected.
    pub fn splice(&mut self, linear: &[PeerId]) -> bool {
        let Some((head, rest)) = linear.split_first() else {
            return true;
        };
        if *head != self.id {
            return false;
        }
        let mut node = self;
        for id in rest {
            node = node.emplace_node(id.clone()).0;
        }
        true
    }

    fn decode_at_depth<B: Buf>(buf: &mut B, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(Error::wire("multipath nests too deeply"));
        }
        let id = PeerId::decode(buf)?;
        let count = wire::get_varint(buf)?;
        if count as usize > buf.remaining() {
            return Err(Error::wire(format!("child count {count} exceeds remaining input")));
        }
        let mut node = Self::new(id);
        for _ in 0..count {
            let child = Self::decode_at_depth(buf, depth + 1)?;
            if child.id == node.id {
                return Err(Error::wire("multipath child equals its parent"));
            }
            match node.children.last() {
                Some(last) if last.id >= child.id => {
                    return Err(Error::wire("multipath children out of order"));
                },
                _ => node.children.push(child),
            }
        }
        Ok(node)
    }
}

impl Encode for Multipath {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.id.encode(buf);
        wire::put_varint(buf, self.children.len() as u64);
        for child in &self.children {
            child.encode(buf);
        }
    }
}

impl Decode for Multipath {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Self::decode_at_depth(buf, 0)
    }
}

impl fmt::Display for Multipath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.id)?;
        if !self.children.is_empty() {
            write!(f, ", [")?;
            for (i, child) in self.children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{child}")?;
            }
            write!(f, "]")?;
        }
        write!(f, ")")
    }
}
