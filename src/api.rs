//! Path-addressed document API.
//!
//! Paths are pre-parsed segment lists addressing into the root object;
//! text parsing lives in the CLI. Writers resolve all but the last segment
//! against the committed state, then mutate the addressed collection's own
//! tree. Collection root addresses are stable, so the parent needs no
//! rewrite.

use std::path::Path;

use crate::db::{Database, Options};
use crate::error::{Error, Result};
use crate::model::Value;
use crate::storage::btree::{read, BtreeWritable, Overwrite};
use crate::storage::value::{TAG_ARRAY, TAG_OBJECT};
use crate::types::{Addr, Key, MAX_KEY, ROOT_ADDR};

/// One step of a document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Object field name.
    Field(String),
    /// Array index.
    Index(u64),
}

pub type Location = Vec<PathSegment>;

/// An open document store.
pub struct Cheesebase {
    db: Database,
}

impl Cheesebase {
    pub fn open(path: &Path) -> Result<Cheesebase> {
        Ok(Cheesebase {
            db: Database::open(path)?,
        })
    }

    pub fn open_with(path: &Path, options: Options) -> Result<Cheesebase> {
        Ok(Cheesebase {
            db: Database::open_with(path, options)?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Store `json` at `path`; fails if the path already holds a value.
    pub fn insert(&self, path: &[PathSegment], json: &str) -> Result<bool> {
        self.put(path, json, Overwrite::Insert)
    }

    /// Replace the value at `path`; fails if the path holds nothing.
    pub fn update(&self, path: &[PathSegment], json: &str) -> Result<bool> {
        self.put(path, json, Overwrite::Update)
    }

    /// Store `json` at `path`, replacing any existing value.
    pub fn upsert(&self, path: &[PathSegment], json: &str) -> Result<bool> {
        self.put(path, json, Overwrite::Upsert)
    }

    /// Value at `path`; the empty path reads the whole root object.
    pub fn get(&self, path: &[PathSegment]) -> Result<Option<Value>> {
        if path.is_empty() {
            return read::read_object(&self.db, ROOT_ADDR).map(Some);
        }
        let (parent, last) = split_last(path);
        let target = match self.resolve(parent)? {
            Some(target) => target,
            None => return Ok(None),
        };
        let key = match self.key_for(target.0, last)? {
            Some(key) => key,
            None => return Ok(None),
        };
        read::get(&self.db, target.1, key)
    }

    /// Remove the value at `path`, freeing its storage.
    pub fn remove(&self, path: &[PathSegment]) -> Result<bool> {
        if path.is_empty() {
            return Ok(false);
        }
        let (parent, last) = split_last(path);

        // resolving under the writer lock keeps the walk consistent with
        // the state the mutation will commit against
        let mut ta = self.db.transaction();
        let target = match self.resolve(parent)? {
            Some(target) => target,
            None => return Ok(false),
        };
        let key = match self.key_for(target.0, last)? {
            Some(key) => key,
            None => return Ok(false),
        };

        let mut tree = BtreeWritable::open(&mut ta, target.1)?;
        let removed = tree.remove(&mut ta, key)?;
        if removed {
            ta.commit(tree.writes())?;
        }
        Ok(removed)
    }

    /// Append `json` to the array at `path`; returns the new index.
    pub fn append(&self, path: &[PathSegment], json: &str) -> Result<Option<u64>> {
        let value = Value::parse(json)?;

        let mut ta = self.db.transaction();
        let target = match self.resolve(path)? {
            Some(target) => target,
            None => return Ok(None),
        };
        if target.0 != TAG_ARRAY {
            return Ok(None);
        }

        let mut tree = BtreeWritable::open(&mut ta, target.1)?;
        let key = tree.append(&mut ta, &value)?;
        ta.commit(tree.writes())?;
        Ok(Some(key))
    }

    fn put(&self, path: &[PathSegment], json: &str, ow: Overwrite) -> Result<bool> {
        let value = Value::parse(json)?;
        if path.is_empty() {
            return Ok(false);
        }
        let (parent, last) = split_last(path);

        let mut ta = self.db.transaction();
        let target = match self.resolve(parent)? {
            Some(target) => target,
            None => return Ok(false),
        };
        let key = match (target.0, last) {
            (TAG_OBJECT, PathSegment::Field(name)) => match ow {
                // updating never interns a new string
                Overwrite::Update => match self.db.get_key(name) {
                    Some(key) => key,
                    None => return Ok(false),
                },
                _ => ta.key(name)?,
            },
            (TAG_ARRAY, PathSegment::Index(index)) => index_key(*index)?,
            _ => return Ok(false),
        };

        let mut tree = BtreeWritable::open(&mut ta, target.1)?;
        let stored = tree.insert(&mut ta, key, &value, ow)?;
        if stored {
            ta.commit(tree.writes())?;
        }
        Ok(stored)
    }

    /// Walk `path` from the root object down to a collection, read-only.
    fn resolve(&self, path: &[PathSegment]) -> Result<Option<(u8, Addr)>> {
        let mut current = (TAG_OBJECT, ROOT_ADDR);
        for segment in path {
            let key = match self.key_for(current.0, segment)? {
                Some(key) => key,
                None => return Ok(None),
            };
            current = match read::get_child_collection(&self.db, current.1, key)? {
                Some(next) => next,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// Entry key of `segment` within a collection of kind `tag`; `None` on
    /// a type mismatch or an unknown field name.
    fn key_for(&self, tag: u8, segment: &PathSegment) -> Result<Option<Key>> {
        match (tag, segment) {
            (TAG_OBJECT, PathSegment::Field(name)) => Ok(self.db.get_key(name)),
            (TAG_ARRAY, PathSegment::Index(index)) => index_key(*index).map(Some),
            _ => Ok(None),
        }
    }
}

fn index_key(index: u64) -> Result<Key> {
    if index > MAX_KEY {
        return Err(Error::IndexOutOfRange);
    }
    Ok(index)
}

fn split_last(path: &[PathSegment]) -> (&[PathSegment], &PathSegment) {
    (&path[..path.len() - 1], &path[path.len() - 1])
}
