//! Read-only tree traversal.
//!
//! Readers work against the committed state through the page cache, copying
//! node images out and recursing into child trees and string chains.

use super::node::{image_is_leaf, InternalNode, LeafEntry, LeafNode, NODE_SIZE};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::Value;
use crate::storage::alloc::BlockHdr;
use crate::storage::value::{
    unpack_short_string, SHORT_STRING_BIT, STRING_CHAIN_CAP, STRING_FIRST_CAP, STRING_HDR_MAGIC,
    STRING_SIZE_MASK, TAG_ARRAY, TAG_FALSE, TAG_NULL, TAG_NUMBER, TAG_OBJECT, TAG_STRING,
    TAG_TRUE,
};
use crate::types::{Addr, Key, BLOCK_HDR_SIZE, NULL_ADDR};

fn load_node(db: &Database, addr: Addr) -> Result<[u8; NODE_SIZE]> {
    db.load_array::<NODE_SIZE>(addr + BLOCK_HDR_SIZE as u64)
}

/// Every key/value pair of the tree in ascending key order: leftmost
/// descent, then the leaf chain.
pub fn get_all(db: &Database, addr: Addr) -> Result<Vec<(Key, Value)>> {
    let mut node_addr = addr;
    loop {
        let image = load_node(db, node_addr)?;
        if image_is_leaf(&image) {
            break;
        }
        node_addr = InternalNode::from_bytes(&image)?.first;
    }

    let mut out = Vec::new();
    loop {
        let node = LeafNode::from_bytes(&load_node(db, node_addr)?)?;
        let len = node.find_len()?;
        let mut pos = 0;
        while pos < len {
            out.push(read_value(db, &node.words, &mut pos)?);
        }
        if node.next == NULL_ADDR {
            break;
        }
        node_addr = node.next;
    }
    Ok(out)
}

/// Value stored under `key`, or `None`.
pub fn get(db: &Database, addr: Addr, key: Key) -> Result<Option<Value>> {
    let mut node_addr = addr;
    loop {
        let image = load_node(db, node_addr)?;
        if image_is_leaf(&image) {
            let node = LeafNode::from_bytes(&image)?;
            let len = node.find_len()?;
            let mut pos = node.search(key)?;
            if pos >= len || LeafEntry::from_word(node.words[pos])?.key != key {
                return Ok(None);
            }
            return Ok(Some(read_value(db, &node.words, &mut pos)?.1));
        }
        node_addr = InternalNode::from_bytes(&image)?.search_child(key);
    }
}

/// Root address and tag of the collection stored under `key`; `None` when
/// absent or not an object/array.
pub fn get_child_collection(db: &Database, addr: Addr, key: Key) -> Result<Option<(u8, Addr)>> {
    let mut node_addr = addr;
    loop {
        let image = load_node(db, node_addr)?;
        if image_is_leaf(&image) {
            let node = LeafNode::from_bytes(&image)?;
            let len = node.find_len()?;
            let pos = node.search(key)?;
            if pos >= len {
                return Ok(None);
            }
            let entry = LeafEntry::from_word(node.words[pos])?;
            if entry.key != key || !matches!(entry.tag, TAG_OBJECT | TAG_ARRAY) {
                return Ok(None);
            }
            return Ok(Some((entry.tag, node.words[pos + 1])));
        }
        node_addr = InternalNode::from_bytes(&image)?.search_child(key);
    }
}

/// Materialize the object rooted at `addr`, fields sorted by name.
pub fn read_object(db: &Database, addr: Addr) -> Result<Value> {
    let pairs = get_all(db, addr)?;
    let mut fields = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        fields.push((db.resolve_key(key)?, value));
    }
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(Value::Object(fields))
}

/// Materialize the array rooted at `addr`; missing indices read as null.
pub fn read_array(db: &Database, addr: Addr) -> Result<Value> {
    let pairs = get_all(db, addr)?;
    let len = pairs.last().map_or(0, |(key, _)| *key as usize + 1);
    let mut items = vec![Value::Null; len];
    for (key, value) in pairs {
        items[key as usize] = value;
    }
    Ok(Value::Array(items))
}

/// Decode the entry at `*pos`, advancing past it.
fn read_value(db: &Database, words: &[u64], pos: &mut usize) -> Result<(Key, Value)> {
    let entry = LeafEntry::from_word(words[*pos])?;
    *pos += 1;

    if entry.tag & SHORT_STRING_BIT != 0 {
        let len = (entry.tag & 0b0011_1111) as usize;
        let nwords = (len + 7) / 8;
        let s = unpack_short_string(len, &words[*pos..*pos + nwords])?;
        *pos += nwords;
        return Ok((entry.key, Value::String(s)));
    }

    let value = match entry.tag {
        TAG_NULL => Value::Null,
        TAG_TRUE => Value::Bool(true),
        TAG_FALSE => Value::Bool(false),
        TAG_NUMBER => {
            let bits = words[*pos];
            *pos += 1;
            Value::Number(f64::from_bits(bits))
        }
        TAG_OBJECT => {
            let child = words[*pos];
            *pos += 1;
            read_object(db, child)?
        }
        TAG_ARRAY => {
            let child = words[*pos];
            *pos += 1;
            read_array(db, child)?
        }
        TAG_STRING => {
            let child = words[*pos];
            *pos += 1;
            Value::String(read_long_string(db, child)?)
        }
        _ => return Err(Error::Corrupt("unknown value type tag")),
    };
    Ok((entry.key, value))
}

/// Reassemble a long string by walking its block chain.
pub fn read_long_string(db: &Database, addr: Addr) -> Result<String> {
    let first_hdr = BlockHdr::from_word(db.load_word(addr)?)?;
    let string_hdr = db.load_word(addr + BLOCK_HDR_SIZE as u64)?;
    if string_hdr & !STRING_SIZE_MASK != STRING_HDR_MAGIC {
        return Err(Error::Corrupt("no magic bytes in string header"));
    }
    let mut size = (string_hdr & STRING_SIZE_MASK) as usize;
    let mut bytes = Vec::with_capacity(size);

    let take = size.min(STRING_FIRST_CAP);
    bytes.extend(db.load_bytes(addr + 2 * BLOCK_HDR_SIZE as u64, take)?);
    size -= take;

    let mut next = first_hdr.next;
    while next != NULL_ADDR {
        if size == 0 {
            return Err(Error::Corrupt("string chain longer than its size"));
        }
        let hdr = BlockHdr::from_word(db.load_word(next)?)?;
        let take = size.min(STRING_CHAIN_CAP);
        bytes.extend(db.load_bytes(next + BLOCK_HDR_SIZE as u64, take)?);
        size -= take;
        next = hdr.next;
    }
    if size != 0 {
        return Err(Error::Corrupt("string chain shorter than its size"));
    }
    String::from_utf8(bytes).map_err(|_| Error::Corrupt("stored string is not UTF-8"))
}
