//! Structural invariants, checked against the raw file between sessions:
//! live blocks and free-list blocks partition the allocated file exactly,
//! free blocks sit on the right list with the right alignment, and every
//! tree keeps its ordering, fill bounds and leaf chain.

use std::collections::BTreeMap;
use std::path::Path;

use cheesebase::storage::alloc::BlockTier;
use cheesebase::storage::btree::node::{
    entry_size, image_is_leaf, InternalNode, LeafEntry, LeafNode, MAX_INTERNAL_ENTRIES,
    MAX_LEAF_WORDS, MIN_INTERNAL_ENTRIES, MIN_LEAF_WORDS, NODE_SIZE,
};
use cheesebase::storage::value::{
    SHORT_STRING_BIT, TAG_ARRAY, TAG_OBJECT, TAG_STRING,
};
use cheesebase::storage::Storage;
use cheesebase::types::{
    Addr, Key, OpenMode, BLOCK_HDR_SIZE, HDR_EOF_OFFSET, HDR_FREE_OFFSETS, KEY_CACHE_SEED,
    MAX_KEY, PAGE_SIZE, ROOT_ADDR,
};
use cheesebase::{Cheesebase, PathSegment};

fn field(name: &str) -> PathSegment {
    PathSegment::Field(name.to_string())
}

/// Raw read-only view of a closed database file.
struct Inspector {
    store: Storage,
}

impl Inspector {
    fn open(path: &Path) -> Inspector {
        Inspector {
            store: Storage::open(path, OpenMode::OpenExisting, 256).unwrap(),
        }
    }

    fn word(&self, addr: Addr) -> u64 {
        self.store.load_word(addr).unwrap()
    }

    fn node(&self, addr: Addr) -> [u8; NODE_SIZE] {
        self.store
            .load_array::<NODE_SIZE>(addr + BLOCK_HDR_SIZE as u64)
            .unwrap()
    }

    fn block_tier(&self, addr: Addr) -> BlockTier {
        let word = self.word(addr);
        BlockTier::from_tag((word >> 56) as u8)
            .unwrap_or_else(|| panic!("bad block tag at {addr:#x}"))
    }

    fn block_next(&self, addr: Addr) -> Addr {
        self.word(addr) & ((1 << 56) - 1)
    }

    fn record(&self, blocks: &mut BTreeMap<Addr, usize>, addr: Addr, size: usize) {
        assert_eq!(addr % size as u64, 0, "misaligned block at {addr:#x}");
        assert!(
            blocks.insert(addr, size).is_none(),
            "block {addr:#x} referenced twice"
        );
    }

    /// Record every block of the tree at `addr`, including out-of-line
    /// values, while checking node invariants.
    fn collect_tree(&self, addr: Addr, blocks: &mut BTreeMap<Addr, usize>) {
        assert_eq!(self.block_tier(addr), BlockTier::T4);
        self.record(blocks, addr, BlockTier::T4.size());

        let image = self.node(addr);
        if image_is_leaf(&image) {
            let node = LeafNode::from_bytes(&image).unwrap();
            let len = node.find_len().unwrap();
            let mut pos = 0;
            while pos < len {
                let entry = LeafEntry::from_word(node.words[pos]).unwrap();
                match entry.tag {
                    TAG_OBJECT | TAG_ARRAY => {
                        self.collect_tree(node.words[pos + 1], blocks);
                    }
                    TAG_STRING => self.collect_string(node.words[pos + 1], blocks),
                    _ => {}
                }
                pos += entry_size(node.words[pos]).unwrap();
            }
        } else {
            let node = InternalNode::from_bytes(&image).unwrap();
            self.collect_tree(node.first, blocks);
            for pair in &node.pairs {
                self.collect_tree(pair.addr, blocks);
            }
        }
    }

    fn collect_string(&self, addr: Addr, blocks: &mut BTreeMap<Addr, usize>) {
        let mut next = addr;
        while next != 0 {
            let tier = self.block_tier(next);
            self.record(blocks, next, tier.size());
            next = self.block_next(next);
        }
    }

    /// Blocks of the key-cache chain past the seed block on page 0.
    fn collect_key_chain(&self, blocks: &mut BTreeMap<Addr, usize>) {
        let mut next = self.block_next(KEY_CACHE_SEED);
        while next != 0 {
            let tier = self.block_tier(next);
            self.record(blocks, next, tier.size());
            next = self.block_next(next);
        }
    }

    /// Blocks on the free lists, checked for tag and alignment.
    fn collect_free(&self, blocks: &mut BTreeMap<Addr, usize>) {
        for (tier_idx, offset) in HDR_FREE_OFFSETS.iter().enumerate() {
            let mut next = self.word(*offset);
            while next != 0 {
                let tier = self.block_tier(next);
                assert_eq!(
                    tier.index(),
                    tier_idx,
                    "free block {next:#x} on the wrong tier list"
                );
                self.record(blocks, next, tier.size());
                next = self.block_next(next);
            }
        }
    }

    /// Live and free blocks must tile [page_size, end_of_file) exactly.
    fn check_partition(&self) {
        let eof = self.word(HDR_EOF_OFFSET);
        let mut blocks = BTreeMap::new();
        self.collect_tree(ROOT_ADDR, &mut blocks);
        self.collect_key_chain(&mut blocks);
        self.collect_free(&mut blocks);

        let mut cursor = PAGE_SIZE as u64;
        for (addr, size) in &blocks {
            assert_eq!(*addr, cursor, "gap or overlap before block {addr:#x}");
            cursor += *size as u64;
        }
        assert_eq!(cursor, eof, "blocks do not reach end of file");
    }

    /// Key order, fill bounds and the leaf chain of the tree at `addr`,
    /// recursing into child collections.
    fn check_tree(&self, addr: Addr) {
        let mut leaves = Vec::new();
        self.check_node(addr, true, 0, MAX_KEY, &mut leaves);

        // the chain from the leftmost leaf visits exactly the in-order
        // leaves and ends at null
        let mut chained = Vec::new();
        let mut next = *leaves.first().unwrap();
        while next != 0 {
            chained.push(next);
            let node = LeafNode::from_bytes(&self.node(next)).unwrap();
            next = node.next;
        }
        assert_eq!(chained, leaves, "leaf chain out of order");
    }

    fn check_node(
        &self,
        addr: Addr,
        is_root: bool,
        lower: Key,
        upper: Key,
        leaves: &mut Vec<Addr>,
    ) {
        let image = self.node(addr);
        if image_is_leaf(&image) {
            let node = LeafNode::from_bytes(&image).unwrap();
            let len = node.find_len().unwrap();
            assert!(len <= MAX_LEAF_WORDS);
            if !is_root {
                assert!(len >= MIN_LEAF_WORDS, "under-full leaf {addr:#x}");
            }

            let mut pos = 0;
            let mut last: Option<Key> = None;
            while pos < len {
                let entry = LeafEntry::from_word(node.words[pos]).unwrap();
                assert!(entry.key >= lower && entry.key <= upper, "key out of range");
                if let Some(last) = last {
                    assert!(entry.key > last, "keys not strictly ascending");
                }
                last = Some(entry.key);

                if matches!(entry.tag, TAG_OBJECT | TAG_ARRAY) {
                    self.check_tree(node.words[pos + 1]);
                } else {
                    assert!(
                        entry.tag & SHORT_STRING_BIT != 0
                            || matches!(entry.tag, b'N' | b'S' | b'T' | b'F' | b'0'),
                        "unknown tag"
                    );
                }
                pos += entry_size(node.words[pos]).unwrap();
            }
            leaves.push(addr);
        } else {
            let node = InternalNode::from_bytes(&image).unwrap();
            assert!(node.pairs.len() <= MAX_INTERNAL_ENTRIES);
            if !is_root {
                assert!(
                    node.pairs.len() >= MIN_INTERNAL_ENTRIES,
                    "under-full internal node {addr:#x}"
                );
            }
            for window in node.pairs.windows(2) {
                assert!(window[0].key < window[1].key, "separators not ascending");
            }

            let first_sep = node.pairs[0].key;
            self.check_node(node.first, false, lower, first_sep.saturating_sub(1), leaves);
            for (i, pair) in node.pairs.iter().enumerate() {
                let child_upper = match node.pairs.get(i + 1) {
                    Some(next) => next.key.saturating_sub(1),
                    None => upper,
                };
                self.check_node(pair.addr, false, pair.key, child_upper, leaves);
            }
        }
    }
}

fn verify(path: &Path) {
    let inspector = Inspector::open(path);
    inspector.check_partition();
    inspector.check_tree(ROOT_ADDR);
}

#[test]
fn test_invariants_across_operation_mix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inv.db");

    // phase 1: build a mixed document
    {
        let db = Cheesebase::open(&path).unwrap();
        let long: String = std::iter::repeat("xyz-0123456789").take(700).collect();
        assert!(db
            .insert(&[field("doc")], r#"{"kind": "mixed", "tags": [1, 2, 3]}"#)
            .unwrap());
        assert!(db.insert(&[field("blob")], &format!("{long:?}")).unwrap());
        assert!(db.insert(&[field("nums")], "{}").unwrap());
        for i in 0..200 {
            let name = format!("n{i:03}");
            assert!(db.insert(&[field("nums"), field(&name)], &i.to_string()).unwrap());
        }
        assert!(db.insert(&[field("list")], "[]").unwrap());
        for i in 0..40 {
            assert_eq!(db.append(&[field("list")], &i.to_string()).unwrap(), Some(i));
        }
    }
    verify(&path);

    // phase 2: delete half the keys, punch holes in the array, replace the
    // long string with a short one and back
    {
        let db = Cheesebase::open(&path).unwrap();
        for i in (0..200).step_by(2) {
            let name = format!("n{i:03}");
            assert!(db.remove(&[field("nums"), field(&name)]).unwrap());
        }
        for i in [3u64, 7, 11, 13] {
            assert!(db.remove(&[field("list"), PathSegment::Index(i)]).unwrap());
        }
        // narrowing updates shrink leaves and must rebalance like removals
        for i in (1..40).step_by(2) {
            let name = format!("n{i:03}");
            assert!(db.update(&[field("nums"), field(&name)], "null").unwrap());
        }
        assert!(db.update(&[field("blob")], r#""tiny""#).unwrap());
        let long: String = std::iter::repeat("ABCDEFG.").take(1500).collect();
        assert!(db.update(&[field("blob")], &format!("{long:?}")).unwrap());
    }
    verify(&path);

    // phase 3: drop whole subtrees
    {
        let db = Cheesebase::open(&path).unwrap();
        assert!(db.remove(&[field("nums")]).unwrap());
        assert!(db.remove(&[field("doc")]).unwrap());
    }
    verify(&path);
}
