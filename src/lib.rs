//! Cheesebase - embedded transactional JSON document store.
//!
//! A single process opens one database file and performs transactional
//! insert / update / upsert / remove / append operations against a nested
//! tree of objects, arrays and scalars addressable by path. Storage is a
//! file of 4 KiB pages: a tiered block allocator, an LRU page cache, a
//! key-interning table and B+trees of 256-byte nodes.

pub mod api;
pub mod db;
pub mod error;
pub mod model;
pub mod os;
pub mod storage;
pub mod types;

pub use api::{Cheesebase, Location, PathSegment};
pub use db::{Database, Options, Transaction};
pub use error::{Error, Result};
pub use model::Value;
pub use types::OpenMode;
