//! Model-based property tests: the store must agree with an in-memory
//! reference for any operation sequence, and committed state must survive
//! reopening.

use std::collections::BTreeMap;

use proptest::prelude::*;

use cheesebase::storage::alloc::{Allocator, BlockHdr, BlockTier, HdrState};
use cheesebase::storage::keycache::KeyCache;
use cheesebase::storage::Storage;
use cheesebase::types::{Block, Write, HDR_EOF_OFFSET, KEY_CACHE_SEED, PAGE_SIZE};
use cheesebase::{Cheesebase, OpenMode, PathSegment};

fn field(name: &str) -> PathSegment {
    PathSegment::Field(name.to_string())
}

fn json_value() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::Bool),
        (-1.0e9f64..1.0e9).prop_map(|n| serde_json::json!(n)),
        "[a-z ]{0,40}".prop_map(serde_json::Value::String),
    ];
    leaf.prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(serde_json::Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

#[derive(Debug, Clone)]
enum Op {
    Upsert(String, serde_json::Value),
    Insert(String, serde_json::Value),
    Update(String, serde_json::Value),
    Remove(String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // a handful of names so operations collide on keys
    let name = "[a-e]";
    prop_oneof![
        (name, json_value()).prop_map(|(n, v)| Op::Upsert(n, v)),
        (name, json_value()).prop_map(|(n, v)| Op::Insert(n, v)),
        (name, json_value()).prop_map(|(n, v)| Op::Update(n, v)),
        name.prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_operation_sequences_match_reference(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.db");
        let db = Cheesebase::open(&path).unwrap();
        let mut reference: BTreeMap<String, serde_json::Value> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Upsert(name, value) => {
                    prop_assert!(db.upsert(&[field(name)], &value.to_string()).unwrap());
                    reference.insert(name.clone(), value.clone());
                }
                Op::Insert(name, value) => {
                    let stored = db.insert(&[field(name)], &value.to_string()).unwrap();
                    prop_assert_eq!(stored, !reference.contains_key(name));
                    reference.entry(name.clone()).or_insert_with(|| value.clone());
                }
                Op::Update(name, value) => {
                    let stored = db.update(&[field(name)], &value.to_string()).unwrap();
                    prop_assert_eq!(stored, reference.contains_key(name));
                    if let Some(slot) = reference.get_mut(name) {
                        *slot = value.clone();
                    }
                }
                Op::Remove(name) => {
                    let removed = db.remove(&[field(name)]).unwrap();
                    prop_assert_eq!(removed, reference.remove(name).is_some());
                }
            }
        }

        let expected = cheesebase::Value::from(serde_json::Value::Object(
            reference.clone().into_iter().collect(),
        ));
        prop_assert_eq!(db.get(&[]).unwrap().unwrap(), expected.clone());

        // committed state survives close and reopen
        drop(db);
        let db = Cheesebase::open(&path).unwrap();
        prop_assert_eq!(db.get(&[]).unwrap().unwrap(), expected);
    }

    #[test]
    fn prop_string_values_roundtrip(chars in prop::collection::vec(any::<char>(), 0..3000)) {
        let s: String = chars.into_iter().collect();
        let dir = tempfile::tempdir().unwrap();
        let db = Cheesebase::open(&dir.path().join("s.db")).unwrap();

        let json = serde_json::Value::String(s.clone()).to_string();
        prop_assert!(db.insert(&[field("s")], &json).unwrap());
        prop_assert_eq!(
            db.get(&[field("s")]).unwrap(),
            Some(cheesebase::Value::String(s))
        );
    }

    #[test]
    fn prop_key_cache_roundtrips(names in prop::collection::vec("\\PC{0,60}", 1..50)) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Storage::open(&dir.path().join("k.db"), OpenMode::CreateAlways, 64).unwrap();
        store
            .store_write(vec![
                Write::word(HDR_EOF_OFFSET, PAGE_SIZE as u64),
                Write::word(KEY_CACHE_SEED, BlockHdr::new(BlockTier::T1, 0).word()),
                Write::bytes(KEY_CACHE_SEED + 8, vec![0, 0]),
            ])
            .unwrap();
        let seed = Block {
            addr: KEY_CACHE_SEED,
            size: BlockTier::T1.size(),
        };
        let keys = KeyCache::open(&store, seed).unwrap();
        let alloc = Allocator::new(HdrState {
            eof: PAGE_SIZE as u64,
            free: [0; 5],
        });

        let mut assigned = Vec::new();
        {
            let mut ta = alloc.begin(&store);
            let mut tk = keys.begin_txn();
            for name in &names {
                assigned.push(tk.get_key(name).unwrap());
            }
            let mut writes = tk.commit(&mut ta).unwrap();
            writes.extend(ta.commit());
            store.store_write(writes).unwrap();
        }

        for (name, key) in names.iter().zip(&assigned) {
            prop_assert_eq!(keys.get_string(*key).unwrap(), name.clone());
            prop_assert_eq!(keys.get_key(name), Some(*key));
        }

        // and again from disk
        let reopened = KeyCache::open(&store, seed).unwrap();
        for (name, key) in names.iter().zip(&assigned) {
            prop_assert_eq!(reopened.get_string(*key).unwrap(), name.clone());
        }
    }
}
