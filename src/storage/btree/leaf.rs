//! Writable leaf nodes.
//!
//! A leaf buffers its 248-byte node image on first mutation and keeps the
//! out-of-line values created under it in a `linked` map keyed by entry key,
//! so one `collect_writes` pass drains the whole subtree.

use std::collections::BTreeMap;

use log::debug;

use super::node::{entry_size, LeafEntry, LeafNode, MAX_LEAF_WORDS, MIN_LEAF_WORDS, NODE_SIZE};
use super::{InsertUp, NodeW, Removed};
use crate::db::Transaction;
use crate::error::{Error, Result};
use crate::model::Value;
use crate::storage::btree::Overwrite;
use crate::storage::value::{
    build_out_of_line, destroy_stored, extra_words, is_stored_out_of_line, scalar_words,
    value_tag, ValueW,
};
use crate::types::{Addr, Key, Write, Writes, BLOCK_HDR_SIZE};

pub(crate) struct LeafW {
    pub(super) addr: Addr,
    pub(super) node: Option<Box<LeafNode>>,
    pub(super) len: usize,
    pub(super) linked: BTreeMap<Key, ValueW>,
}

impl LeafW {
    /// Allocate a fresh, empty leaf chaining to `next`.
    pub(super) fn create(ta: &mut Transaction, next: Addr) -> Result<LeafW> {
        let block = ta.alloc(NODE_SIZE)?;
        Ok(LeafW {
            addr: block.addr,
            node: Some(Box::new(LeafNode::new(next))),
            len: 0,
            linked: BTreeMap::new(),
        })
    }

    /// An opened, not yet materialized leaf.
    pub(super) fn from_parts(addr: Addr, node: Option<Box<LeafNode>>, len: usize) -> LeafW {
        LeafW {
            addr,
            node,
            len,
            linked: BTreeMap::new(),
        }
    }

    /// Placeholder used while swapping the tree root.
    pub(super) fn detached() -> LeafW {
        LeafW::from_parts(0, None, 0)
    }

    pub(super) fn init(&mut self, ta: &mut Transaction) -> Result<()> {
        if self.node.is_none() {
            let image = ta.load_array::<NODE_SIZE>(self.addr + BLOCK_HDR_SIZE as u64)?;
            let node = LeafNode::from_bytes(&image)?;
            self.len = node.find_len()?;
            self.node = Some(Box::new(node));
        }
        Ok(())
    }

    fn node(&self) -> Result<&LeafNode> {
        self.node
            .as_deref()
            .ok_or(Error::Corrupt("leaf node not materialized"))
    }

    fn node_mut(&mut self) -> Result<&mut LeafNode> {
        self.node
            .as_deref_mut()
            .ok_or(Error::Corrupt("leaf node not materialized"))
    }

    pub(super) fn first_key(&self) -> Result<Key> {
        Ok(LeafEntry::from_word(self.node()?.words[0])?.key)
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    pub(super) fn collect_writes(&self, out: &mut Writes) {
        if let Some(node) = &self.node {
            out.push(Write::bytes(
                self.addr + BLOCK_HDR_SIZE as u64,
                node.to_bytes().to_vec(),
            ));
        }
        for value in self.linked.values() {
            value.collect_writes(out);
        }
    }

    /// Serialize and insert a value, splitting the leaf when it does not
    /// fit. Replacing an existing value destroys the old storage and
    /// installs the new entry in the same operation.
    pub(super) fn insert(
        &mut self,
        ta: &mut Transaction,
        key: Key,
        val: &Value,
        ow: Overwrite,
    ) -> Result<InsertUp> {
        self.init(ta)?;
        let tag = value_tag(val);
        let needed = 1 + extra_words(tag)?;

        let pos = self.node()?.search(key)?;
        let exists = pos < self.len && LeafEntry::from_word(self.node()?.words[pos])?.key == key;
        match ow {
            Overwrite::Insert if exists => return Ok(self.done(false)),
            Overwrite::Update if !exists => return Ok(self.done(false)),
            _ => {}
        }

        if exists {
            let old = entry_size(self.node()?.words[pos])?;
            if self.len - old + needed <= MAX_LEAF_WORDS {
                // rewrite in place
                self.destroy_value_at(ta, pos)?;
                let diff = needed as isize - old as isize;
                self.node_mut()?.shift(pos + old, diff);
                self.len = (self.len as isize + diff) as usize;
                self.node_mut()?.words[pos] = LeafEntry::new(key, tag).word();
                return self.write_payload(ta, pos + 1, key, val);
            }
            // the replacement does not fit beside the other entries: drop
            // the old entry, then insert like a fresh key
            self.destroy_value_at(ta, pos)?;
            self.node_mut()?.shift(pos + old, -(old as isize));
            self.len -= old;
        }

        if self.len + needed > MAX_LEAF_WORDS {
            return self.split(ta, key, val);
        }

        let pos = self.node()?.search(key)?;
        self.node_mut()?.shift(pos, needed as isize);
        self.len += needed;
        self.node_mut()?.words[pos] = LeafEntry::new(key, tag).word();
        self.write_payload(ta, pos + 1, key, val)
    }

    /// Insert at largest key + 1. Only valid on the rightmost leaf.
    pub(super) fn append(&mut self, ta: &mut Transaction, val: &Value) -> Result<(Key, InsertUp)> {
        self.init(ta)?;
        debug_assert_eq!(self.node()?.next, 0);

        let mut key = 0;
        let mut pos = 0;
        while pos < self.len {
            let entry = LeafEntry::from_word(self.node()?.words[pos])?;
            key = entry.key + 1;
            pos += 1 + entry.extra_words()?;
        }

        let up = self.insert(ta, key, val, Overwrite::Insert)?;
        Ok((key, up))
    }

    /// Destroy the value and remove its entry. Reports whether the leaf is
    /// now under-full; the parent decides about rebalancing.
    pub(super) fn remove(&mut self, ta: &mut Transaction, key: Key) -> Result<Removed> {
        self.init(ta)?;
        let pos = self.node()?.search(key)?;
        let found = pos < self.len && LeafEntry::from_word(self.node()?.words[pos])?.key == key;
        if !found {
            return Ok(Removed {
                found: false,
                underflow: false,
            });
        }
        let width = self.destroy_value_at(ta, pos)?;
        self.node_mut()?.shift(pos + width, -(width as isize));
        self.len -= width;
        Ok(Removed {
            found: true,
            underflow: self.len < MIN_LEAF_WORDS,
        })
    }

    /// Free every value in this leaf and the leaf's own block.
    pub(super) fn destroy(mut self, ta: &mut Transaction) -> Result<()> {
        self.init(ta)?;
        let mut pos = 0;
        while pos < self.len {
            pos += self.destroy_value_at(ta, pos)?;
        }
        ta.free(self.addr)
    }

    /// Free the out-of-line storage of the entry at `pos` without touching
    /// the entry words. Returns the entry width.
    fn destroy_value_at(&mut self, ta: &mut Transaction, pos: usize) -> Result<usize> {
        let entry = LeafEntry::from_word(self.node()?.words[pos])?;
        if is_stored_out_of_line(entry.tag) {
            match self.linked.remove(&entry.key) {
                Some(value) => value.destroy(ta)?,
                None => {
                    let addr = self.node()?.words[pos + 1];
                    destroy_stored(ta, entry.tag, addr)?;
                }
            }
        }
        Ok(1 + entry.extra_words()?)
    }

    fn write_payload(
        &mut self,
        ta: &mut Transaction,
        at: usize,
        key: Key,
        val: &Value,
    ) -> Result<InsertUp> {
        if let Some(value) = build_out_of_line(ta, val)? {
            self.node_mut()?.words[at] = value.addr();
            self.linked.insert(key, value);
        } else {
            let words = scalar_words(val);
            self.node_mut()?.words[at..at + words.len()].copy_from_slice(&words);
        }
        Ok(self.done(true))
    }

    fn done(&self, stored: bool) -> InsertUp {
        InsertUp::Done {
            stored,
            underflow: self.len < MIN_LEAF_WORDS,
        }
    }

    /// Split off a right leaf so both halves keep at least the minimum
    /// fill with the new entry included, then insert the entry into the
    /// half covering its key.
    fn split(&mut self, ta: &mut Transaction, key: Key, val: &Value) -> Result<InsertUp> {
        let needed = 1 + extra_words(value_tag(val))?;
        let mut right = LeafW::create(ta, self.node()?.next)?;
        debug!("splitting leaf {:#x} into {:#x}", self.addr, right.addr);

        // cut so both halves end up near half full, counting the new entry
        let mut half = (self.len + needed) / 2;
        let mut cut = 0;
        let mut new_left = false;
        while cut < half {
            let word = self.node()?.words[cut];
            if !new_left && key < LeafEntry::from_word(word)?.key {
                new_left = true;
                half = half.saturating_sub(needed);
            } else {
                cut += entry_size(word)?;
            }
        }

        let split_key = LeafEntry::from_word(self.node()?.words[cut])?.key;
        let moved = self.node()?.words[cut..self.len].to_vec();
        right.append_raw(&moved)?;
        right.linked = self.linked.split_off(&split_key);
        {
            let node = self.node_mut()?;
            node.words[cut..].fill(0);
            node.next = right.addr;
        }
        self.len = cut;

        let up = if new_left {
            self.insert(ta, key, val, Overwrite::Upsert)?
        } else {
            right.insert(ta, key, val, Overwrite::Upsert)?
        };
        debug_assert!(matches!(up, InsertUp::Done { stored: true, .. }));

        let sep = right.first_key()?;
        Ok(InsertUp::Split {
            sep,
            right: NodeW::Leaf(right),
        })
    }

    pub(super) fn append_raw(&mut self, words: &[u64]) -> Result<()> {
        if self.len + words.len() > MAX_LEAF_WORDS {
            return Err(Error::Corrupt("leaf overflow while moving entries"));
        }
        let len = self.len;
        self.node_mut()?.words[len..len + words.len()].copy_from_slice(words);
        self.len += words.len();
        Ok(())
    }

    fn prepend_raw(&mut self, words: &[u64]) -> Result<()> {
        if self.len + words.len() > MAX_LEAF_WORDS {
            return Err(Error::Corrupt("leaf overflow while moving entries"));
        }
        let node = self.node_mut()?;
        node.shift(0, words.len() as isize);
        node.words[..words.len()].copy_from_slice(words);
        self.len += words.len();
        Ok(())
    }

    /// Concatenate `right` into this leaf, fix the chain and free the right
    /// block. The caller removes the parent separator.
    pub(super) fn merge_from_right(&mut self, ta: &mut Transaction, mut right: LeafW) -> Result<()> {
        self.init(ta)?;
        right.init(ta)?;
        debug!("merging leaf {:#x} into {:#x}", right.addr, self.addr);
        let moved = right.node()?.words[..right.len].to_vec();
        self.append_raw(&moved)?;
        self.linked.append(&mut right.linked);
        self.node_mut()?.next = right.node()?.next;
        ta.free(right.addr)
    }
}

/// Move entries between two adjacent leaves until both hold at least the
/// minimum fill. Returns the right leaf's new first key, the parent's new
/// separator.
pub(super) fn redistribute(
    ta: &mut Transaction,
    left: &mut LeafW,
    right: &mut LeafW,
) -> Result<Key> {
    left.init(ta)?;
    right.init(ta)?;
    let total = left.len + right.len;
    debug_assert!(total > MAX_LEAF_WORDS);

    if left.len < right.len {
        // pull the lowest entries of the right leaf
        let mut take = 0;
        while left.len + take < total / 2 {
            take += entry_size(right.node()?.words[take])?;
        }
        let boundary = LeafEntry::from_word(right.node()?.words[take])?.key;
        let keep = right.linked.split_off(&boundary);
        let mut moved_linked = std::mem::replace(&mut right.linked, keep);
        left.linked.append(&mut moved_linked);

        let moved = right.node()?.words[..take].to_vec();
        left.append_raw(&moved)?;
        right.node_mut()?.shift(take, -(take as isize));
        right.len -= take;
    } else {
        // move the tail of the left leaf in front of the right one
        let mut cut = 0;
        while right.len + (left.len - cut) > total / 2 {
            cut += entry_size(left.node()?.words[cut])?;
        }
        let boundary = LeafEntry::from_word(left.node()?.words[cut])?.key;
        let mut moved_linked = left.linked.split_off(&boundary);
        right.linked.append(&mut moved_linked);

        let moved = left.node()?.words[cut..left.len].to_vec();
        right.prepend_raw(&moved)?;
        left.node_mut()?.words[cut..].fill(0);
        left.len = cut;
    }

    debug_assert!(left.len >= MIN_LEAF_WORDS && right.len >= MIN_LEAF_WORDS);
    right.first_key()
}
