//! Writable internal nodes.
//!
//! An internal node owns the writable children opened below it, keyed by
//! block address. Splits and underflow propagate upward as return values;
//! a parent rebalances its own children since it owns both sides.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use log::debug;

use super::leaf::{self, LeafW};
use super::node::{
    InternalNode, Pair, MAX_INTERNAL_ENTRIES, MAX_LEAF_WORDS, MIN_INTERNAL_ENTRIES, NODE_SIZE,
};
use super::{open_node, InsertUp, NodeW, Removed};
use crate::db::Transaction;
use crate::error::{Error, Result};
use crate::model::Value;
use crate::storage::btree::Overwrite;
use crate::types::{Addr, Key, Write, Writes, BLOCK_HDR_SIZE, MAX_KEY};

pub(crate) struct InternalW {
    pub(super) addr: Addr,
    pub(super) node: Option<Box<InternalNode>>,
    pub(super) children: BTreeMap<Addr, NodeW>,
}

impl InternalW {
    pub(super) fn from_parts(addr: Addr, node: Option<Box<InternalNode>>) -> InternalW {
        InternalW {
            addr,
            node,
            children: BTreeMap::new(),
        }
    }

    /// The root block turned internal after a root split: one separator,
    /// two children.
    pub(super) fn new_root(
        addr: Addr,
        left: Addr,
        sep: Key,
        right: Addr,
        children: BTreeMap<Addr, NodeW>,
    ) -> InternalW {
        InternalW {
            addr,
            node: Some(Box::new(InternalNode::new(
                left,
                vec![Pair {
                    key: sep,
                    addr: right,
                }],
            ))),
            children,
        }
    }

    pub(super) fn init(&mut self, ta: &mut Transaction) -> Result<()> {
        if self.node.is_none() {
            let image = ta.load_array::<NODE_SIZE>(self.addr + BLOCK_HDR_SIZE as u64)?;
            self.node = Some(Box::new(InternalNode::from_bytes(&image)?));
        }
        Ok(())
    }

    fn node(&self) -> Result<&InternalNode> {
        self.node
            .as_deref()
            .ok_or(Error::Corrupt("internal node not materialized"))
    }

    fn node_mut(&mut self) -> Result<&mut InternalNode> {
        self.node
            .as_deref_mut()
            .ok_or(Error::Corrupt("internal node not materialized"))
    }

    pub(super) fn num_entries(&mut self, ta: &mut Transaction) -> Result<usize> {
        self.init(ta)?;
        Ok(self.node()?.pairs.len())
    }

    fn child_mut(&mut self, ta: &mut Transaction, addr: Addr) -> Result<&mut NodeW> {
        Ok(match self.children.entry(addr) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(open_node(ta, addr)?),
        })
    }

    pub(super) fn collect_writes(&self, out: &mut Writes) {
        if let Some(node) = &self.node {
            out.push(Write::bytes(
                self.addr + BLOCK_HDR_SIZE as u64,
                node.to_bytes().to_vec(),
            ));
        }
        for child in self.children.values() {
            child.collect_writes(out);
        }
    }

    pub(super) fn insert(
        &mut self,
        ta: &mut Transaction,
        key: Key,
        val: &Value,
        ow: Overwrite,
    ) -> Result<InsertUp> {
        self.init(ta)?;
        let child_addr = self.node()?.search_child(key);
        let child = self.child_mut(ta, child_addr)?;
        match child.insert(ta, key, val, ow)? {
            InsertUp::Done { stored, underflow } => {
                // a replacement narrower than the old value can shrink the
                // child below its minimum
                if stored && underflow {
                    self.rebalance_child(ta, key, child_addr)?;
                }
                Ok(InsertUp::Done {
                    stored,
                    underflow: self.node()?.pairs.len() < MIN_INTERNAL_ENTRIES,
                })
            }
            InsertUp::Split { sep, right } => self.add_child(ta, sep, right),
        }
    }

    pub(super) fn append(&mut self, ta: &mut Transaction, val: &Value) -> Result<(Key, InsertUp)> {
        self.init(ta)?;
        let child_addr = self.node()?.search_child(MAX_KEY);
        let child = self.child_mut(ta, child_addr)?;
        let (key, up) = child.append(ta, val)?;
        match up {
            InsertUp::Done { stored, .. } => Ok((
                key,
                InsertUp::Done {
                    stored,
                    underflow: false,
                },
            )),
            InsertUp::Split { sep, right } => Ok((key, self.add_child(ta, sep, right)?)),
        }
    }

    /// Adopt a freshly split-off child, splitting this node when full.
    pub(super) fn add_child(
        &mut self,
        ta: &mut Transaction,
        sep: Key,
        right: NodeW,
    ) -> Result<InsertUp> {
        self.init(ta)?;
        if self.node()?.pairs.len() < MAX_INTERNAL_ENTRIES {
            let addr = right.addr();
            self.node_mut()?.insert_pair(sep, addr);
            self.children.insert(addr, right);
            return Ok(InsertUp::Done {
                stored: true,
                underflow: false,
            });
        }

        // split around the middle separator, which moves up
        let mid = self.node()?.pairs.len() / 2;
        let mid_key = self.node()?.pairs[mid].key;
        let sib_first = self.node()?.pairs[mid].addr;
        let sib_pairs = self.node()?.pairs[mid + 1..].to_vec();
        debug!("splitting internal node {:#x}", self.addr);

        let block = ta.alloc(NODE_SIZE)?;
        let mut sibling = InternalW {
            addr: block.addr,
            node: Some(Box::new(InternalNode::new(sib_first, sib_pairs.clone()))),
            children: BTreeMap::new(),
        };
        for moved in std::iter::once(sib_first).chain(sib_pairs.iter().map(|p| p.addr)) {
            if let Some(child) = self.children.remove(&moved) {
                sibling.children.insert(moved, child);
            }
        }
        self.node_mut()?.pairs.truncate(mid);

        if sep < mid_key {
            self.add_child(ta, sep, right)?;
        } else {
            sibling.add_child(ta, sep, right)?;
        }

        Ok(InsertUp::Split {
            sep: mid_key,
            right: NodeW::Internal(sibling),
        })
    }

    pub(super) fn remove(&mut self, ta: &mut Transaction, key: Key) -> Result<Removed> {
        self.init(ta)?;
        let child_addr = self.node()?.search_child(key);
        let child = self.child_mut(ta, child_addr)?;
        let removed = child.remove(ta, key)?;
        if removed.found && removed.underflow {
            self.rebalance_child(ta, key, child_addr)?;
        }
        Ok(Removed {
            found: removed.found,
            underflow: self.node()?.pairs.len() < MIN_INTERNAL_ENTRIES,
        })
    }

    /// Merge or redistribute an under-full child with a sibling, preferring
    /// the left neighbour.
    fn rebalance_child(&mut self, ta: &mut Transaction, key: Key, child_addr: Addr) -> Result<()> {
        let sibling_addr = self.node()?.search_sibling(key);
        self.child_mut(ta, child_addr)?;
        self.child_mut(ta, sibling_addr)?;
        let child = self
            .children
            .remove(&child_addr)
            .ok_or(Error::Corrupt("rebalanced child not materialized"))?;
        let sibling = self
            .children
            .remove(&sibling_addr)
            .ok_or(Error::Corrupt("rebalance sibling not materialized"))?;

        let (left, right) = if self.position_of(child_addr)? < self.position_of(sibling_addr)? {
            (child, sibling)
        } else {
            (sibling, child)
        };

        match (left, right) {
            (NodeW::Leaf(mut left), NodeW::Leaf(mut right)) => {
                left.init(ta)?;
                right.init(ta)?;
                let right_addr = right.addr;
                let left_addr = left.addr;
                if left.len() + right.len() <= MAX_LEAF_WORDS {
                    left.merge_from_right(ta, right)?;
                    self.remove_pair_for(right_addr)?;
                    self.children.insert(left_addr, NodeW::Leaf(left));
                } else {
                    let sep = leaf::redistribute(ta, &mut left, &mut right)?;
                    self.update_pair_key(right_addr, sep)?;
                    self.children.insert(left_addr, NodeW::Leaf(left));
                    self.children.insert(right_addr, NodeW::Leaf(right));
                }
            }
            (NodeW::Internal(mut left), NodeW::Internal(mut right)) => {
                left.init(ta)?;
                right.init(ta)?;
                let right_addr = right.addr;
                let left_addr = left.addr;
                let sep_idx = self.pair_index(right_addr)?;
                let sep_key = self.node()?.pairs[sep_idx].key;
                if left.node()?.pairs.len() + right.node()?.pairs.len() + 1
                    <= MAX_INTERNAL_ENTRIES
                {
                    // pull the separator down and concatenate
                    debug!("merging internal {:#x} into {:#x}", right_addr, left_addr);
                    let right_first = right.node()?.first;
                    left.node_mut()?.pairs.push(Pair {
                        key: sep_key,
                        addr: right_first,
                    });
                    let mut right_pairs = std::mem::take(&mut right.node_mut()?.pairs);
                    left.node_mut()?.pairs.append(&mut right_pairs);
                    left.children.append(&mut right.children);
                    ta.free(right.addr)?;
                    self.node_mut()?.pairs.remove(sep_idx);
                    self.children.insert(left_addr, NodeW::Internal(left));
                } else {
                    let sep = redistribute_internal(&mut left, &mut right, sep_key)?;
                    self.node_mut()?.pairs[sep_idx].key = sep;
                    self.children.insert(left_addr, NodeW::Internal(left));
                    self.children.insert(right_addr, NodeW::Internal(right));
                }
            }
            _ => return Err(Error::Corrupt("sibling node type mismatch")),
        }
        Ok(())
    }

    /// Collapse an empty root: adopt the sole child's content. Returns the
    /// replacement leaf when the tree shrinks to a single leaf.
    pub(super) fn collapse_root(&mut self, ta: &mut Transaction) -> Result<Option<LeafW>> {
        self.init(ta)?;
        if !self.node()?.pairs.is_empty() {
            return Ok(None);
        }
        let child_addr = self.node()?.first;
        self.child_mut(ta, child_addr)?;
        let child = self
            .children
            .remove(&child_addr)
            .ok_or(Error::Corrupt("collapsed child not materialized"))?;

        match child {
            NodeW::Internal(mut inner) => {
                inner.init(ta)?;
                self.node = inner.node;
                self.children = inner.children;
                ta.free(inner.addr)?;
                Ok(None)
            }
            NodeW::Leaf(mut inner) => {
                inner.init(ta)?;
                let leaf = LeafW {
                    addr: self.addr,
                    node: inner.node,
                    len: inner.len,
                    linked: inner.linked,
                };
                ta.free(inner.addr)?;
                Ok(Some(leaf))
            }
        }
    }

    /// Free every child subtree, then this node's block.
    pub(super) fn destroy(mut self, ta: &mut Transaction) -> Result<()> {
        self.init(ta)?;
        let node = self
            .node
            .take()
            .ok_or(Error::Corrupt("internal node not materialized"))?;
        for addr in std::iter::once(node.first).chain(node.pairs.iter().map(|p| p.addr)) {
            match self.children.remove(&addr) {
                Some(child) => child.destroy(ta)?,
                None => open_node(ta, addr)?.destroy(ta)?,
            }
        }
        ta.free(self.addr)
    }

    /// Child order position: `first` is 0, pair `i` is `i + 1`.
    fn position_of(&self, addr: Addr) -> Result<usize> {
        let node = self.node()?;
        if node.first == addr {
            return Ok(0);
        }
        node.pairs
            .iter()
            .position(|p| p.addr == addr)
            .map(|i| i + 1)
            .ok_or(Error::Corrupt("child address not in its parent"))
    }

    fn pair_index(&self, addr: Addr) -> Result<usize> {
        self.node()?
            .pairs
            .iter()
            .position(|p| p.addr == addr)
            .ok_or(Error::Corrupt("separator for child address missing"))
    }

    fn remove_pair_for(&mut self, addr: Addr) -> Result<()> {
        let idx = self.pair_index(addr)?;
        self.node_mut()?.pairs.remove(idx);
        Ok(())
    }

    fn update_pair_key(&mut self, addr: Addr, key: Key) -> Result<()> {
        let idx = self.pair_index(addr)?;
        self.node_mut()?.pairs[idx].key = key;
        Ok(())
    }
}

/// Move separator pairs between two adjacent internal nodes until both hold
/// at least the minimum. Returns the parent's new separator key.
fn redistribute_internal(
    left: &mut InternalW,
    right: &mut InternalW,
    old_sep: Key,
) -> Result<Key> {
    let ln = left.node()?.pairs.len();
    let rn = right.node()?.pairs.len();

    if ln > rn {
        // move the tail of the left node; its first moved pair is promoted
        let to_pull = (ln - rn) / 2;
        let moved = left.node_mut()?.pairs.split_off(ln - to_pull);
        let new_sep = moved[0].key;

        let right_first = right.node()?.first;
        let mut pairs: Vec<Pair> = moved[1..].to_vec();
        pairs.push(Pair {
            key: old_sep,
            addr: right_first,
        });
        pairs.append(&mut right.node_mut()?.pairs);
        right.node_mut()?.pairs = pairs;
        right.node_mut()?.first = moved[0].addr;

        for pair in &moved {
            if let Some(child) = left.children.remove(&pair.addr) {
                right.children.insert(pair.addr, child);
            }
        }
        Ok(new_sep)
    } else {
        // pull the head of the right node; its pair past the pulled range
        // is promoted
        let to_pull = (rn - ln) / 2;
        let promoted = right.node()?.pairs[to_pull];
        let right_first = right.node()?.first;

        left.node_mut()?.pairs.push(Pair {
            key: old_sep,
            addr: right_first,
        });
        let pulled: Vec<Pair> = right.node()?.pairs[..to_pull].to_vec();
        left.node_mut()?.pairs.extend_from_slice(&pulled);

        right.node_mut()?.first = promoted.addr;
        right.node_mut()?.pairs.drain(..=to_pull);

        for addr in std::iter::once(right_first).chain(pulled.iter().map(|p| p.addr)) {
            if let Some(child) = right.children.remove(&addr) {
                left.children.insert(addr, child);
            }
        }
        Ok(promoted.key)
    }
}
