//! B+tree over 48-bit keys.
//!
//! Objects and arrays are both stored as these trees; object keys are
//! interned strings, array keys are indices. Nodes live in 256-byte blocks.
//! The root block address identifies the tree and never changes: root
//! splits move the old root content aside and rewrite the root block as an
//! internal node, root collapses pull the last child back in.

pub(crate) mod internal;
pub(crate) mod leaf;
pub mod node;
pub mod read;

use std::collections::BTreeMap;

use internal::InternalW;
use leaf::LeafW;
use node::{image_is_leaf, InternalNode, LeafNode, NODE_SIZE};

use crate::db::Transaction;
use crate::error::Result;
use crate::model::Value;
use crate::types::{Addr, Key, Writes, BLOCK_HDR_SIZE};

/// Behavior of `insert` towards an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// Fail if the key exists.
    Insert,
    /// Fail unless the key exists.
    Update,
    /// Insert or replace.
    Upsert,
}

/// Result of an insertion flowing back up the tree. Replacing a value with
/// a narrower one can shrink a leaf below its minimum, so insertion reports
/// underflow just like removal.
pub(crate) enum InsertUp {
    Done { stored: bool, underflow: bool },
    /// The child split; `right` is the new sibling covering keys >= `sep`.
    Split { sep: Key, right: NodeW },
}

/// Result of a removal flowing back up the tree.
pub(crate) struct Removed {
    pub found: bool,
    /// The reporting node fell below its minimum fill.
    pub underflow: bool,
}

// ============================================================================
// Writable nodes
// ============================================================================

pub(crate) enum NodeW {
    Leaf(LeafW),
    Internal(InternalW),
}

impl NodeW {
    pub(crate) fn addr(&self) -> Addr {
        match self {
            NodeW::Leaf(leaf) => leaf.addr,
            NodeW::Internal(internal) => internal.addr,
        }
    }

    /// Re-home a materialized node to a different block.
    fn set_addr(&mut self, addr: Addr) {
        match self {
            NodeW::Leaf(leaf) => {
                debug_assert!(leaf.node.is_some());
                leaf.addr = addr;
            }
            NodeW::Internal(internal) => {
                debug_assert!(internal.node.is_some());
                internal.addr = addr;
            }
        }
    }

    fn insert(
        &mut self,
        ta: &mut Transaction,
        key: Key,
        val: &Value,
        ow: Overwrite,
    ) -> Result<InsertUp> {
        match self {
            NodeW::Leaf(leaf) => leaf.insert(ta, key, val, ow),
            NodeW::Internal(internal) => internal.insert(ta, key, val, ow),
        }
    }

    fn append(&mut self, ta: &mut Transaction, val: &Value) -> Result<(Key, InsertUp)> {
        match self {
            NodeW::Leaf(leaf) => leaf.append(ta, val),
            NodeW::Internal(internal) => internal.append(ta, val),
        }
    }

    fn remove(&mut self, ta: &mut Transaction, key: Key) -> Result<Removed> {
        match self {
            NodeW::Leaf(leaf) => leaf.remove(ta, key),
            NodeW::Internal(internal) => internal.remove(ta, key),
        }
    }

    pub(crate) fn destroy(self, ta: &mut Transaction) -> Result<()> {
        match self {
            NodeW::Leaf(leaf) => leaf.destroy(ta),
            NodeW::Internal(internal) => internal.destroy(ta),
        }
    }

    pub(crate) fn collect_writes(&self, out: &mut Writes) {
        match self {
            NodeW::Leaf(leaf) => leaf.collect_writes(out),
            NodeW::Internal(internal) => internal.collect_writes(out),
        }
    }
}

/// Open the node stored at `addr` as a writable.
pub(crate) fn open_node(ta: &mut Transaction, addr: Addr) -> Result<NodeW> {
    let image = ta.load_array::<NODE_SIZE>(addr + BLOCK_HDR_SIZE as u64)?;
    if image_is_leaf(&image) {
        let node = LeafNode::from_bytes(&image)?;
        let len = node.find_len()?;
        Ok(NodeW::Leaf(LeafW::from_parts(addr, Some(Box::new(node)), len)))
    } else {
        let node = InternalNode::from_bytes(&image)?;
        Ok(NodeW::Internal(InternalW::from_parts(
            addr,
            Some(Box::new(node)),
        )))
    }
}

// ============================================================================
// Writable tree
// ============================================================================

/// A B+tree opened for mutation inside a transaction. Mutations accumulate
/// in writable nodes; `collect_writes` drains the whole tree for commit.
pub struct BtreeWritable {
    root_addr: Addr,
    root: NodeW,
}

impl BtreeWritable {
    /// Create a new empty tree (a single root leaf).
    pub fn create(ta: &mut Transaction) -> Result<BtreeWritable> {
        let root = LeafW::create(ta, 0)?;
        Ok(BtreeWritable {
            root_addr: root.addr,
            root: NodeW::Leaf(root),
        })
    }

    /// Open the tree rooted at `addr`.
    pub fn open(ta: &mut Transaction, addr: Addr) -> Result<BtreeWritable> {
        Ok(BtreeWritable {
            root_addr: addr,
            root: open_node(ta, addr)?,
        })
    }

    /// The tree's identity: its root block address.
    pub fn addr(&self) -> Addr {
        self.root_addr
    }

    pub fn insert(
        &mut self,
        ta: &mut Transaction,
        key: Key,
        val: &Value,
        ow: Overwrite,
    ) -> Result<bool> {
        let stored = match self.root.insert(ta, key, val, ow)? {
            // root node underflow is allowed; a shrunken internal root may
            // still need collapsing below
            InsertUp::Done { stored, .. } => stored,
            InsertUp::Split { sep, right } => {
                self.split_root(ta, sep, right)?;
                true
            }
        };
        if stored {
            self.collapse_if_empty(ta)?;
        }
        Ok(stored)
    }

    /// Insert at largest key + 1; returns the new key.
    pub fn append(&mut self, ta: &mut Transaction, val: &Value) -> Result<Key> {
        let (key, up) = self.root.append(ta, val)?;
        if let InsertUp::Split { sep, right } = up {
            self.split_root(ta, sep, right)?;
        }
        Ok(key)
    }

    /// Remove a key and destroy its value. Returns false if absent.
    pub fn remove(&mut self, ta: &mut Transaction, key: Key) -> Result<bool> {
        let found = match &mut self.root {
            // a root leaf may become arbitrarily small
            NodeW::Leaf(leaf) => leaf.remove(ta, key)?.found,
            NodeW::Internal(internal) => internal.remove(ta, key)?.found,
        };
        if found {
            self.collapse_if_empty(ta)?;
        }
        Ok(found)
    }

    /// An internal root left without separators adopts its sole child.
    fn collapse_if_empty(&mut self, ta: &mut Transaction) -> Result<()> {
        let new_root = match &mut self.root {
            NodeW::Internal(internal) => internal.collapse_root(ta)?,
            NodeW::Leaf(_) => None,
        };
        if let Some(leaf) = new_root {
            self.root = NodeW::Leaf(leaf);
        }
        Ok(())
    }

    /// Free every block of the tree, values included.
    pub fn destroy(self, ta: &mut Transaction) -> Result<()> {
        self.root.destroy(ta)
    }

    pub fn collect_writes(&self, out: &mut Writes) {
        self.root.collect_writes(out);
    }

    /// All writes of the tree as a fresh batch.
    pub fn writes(&self) -> Writes {
        let mut out = Writes::new();
        self.collect_writes(&mut out);
        out
    }

    /// The old root moves to a fresh block and becomes the left child; the
    /// root block is rewritten as an internal node, keeping the tree's
    /// address stable.
    fn split_root(&mut self, ta: &mut Transaction, sep: Key, right: NodeW) -> Result<()> {
        let block = ta.alloc(NODE_SIZE)?;
        let right_addr = right.addr();
        let mut left = std::mem::replace(&mut self.root, NodeW::Leaf(LeafW::detached()));
        left.set_addr(block.addr);

        let mut children = BTreeMap::new();
        children.insert(block.addr, left);
        children.insert(right_addr, right);
        self.root = NodeW::Internal(InternalW::new_root(
            self.root_addr,
            block.addr,
            sep,
            right_addr,
            children,
        ));
        Ok(())
    }
}
