#![warn(missing_docs)]

//! A persistent, copy-on-write radix trie backed by a segmented,
//! compacting, memory-mapped object store.
//!
//! Keys and values live in one of four node shapes (binary, setlist,
//! inner, full) packed into fixed-size segments; mutation never overwrites
//! a reachable object in place unless it holds the only reference to it.
//! A background compactor reclaims segments that have gone mostly dead by
//! relocating their surviving objects, coordinating with live readers
//! through a hazard-pointer-style session protocol instead of a global
//! lock.

mod checksum;
mod compactor;
mod db;
mod error;
mod id_alloc;
mod mapping;
mod meta;
mod node;
mod options;
mod seg_alloc;
mod segment;
mod store;
mod trie;

pub use db::{Cursor, Database, DbStats, ReadLock, Session, Version, ValueView, WriteSession};
pub use error::{Error, Result};
pub use meta::ObjectId;
pub use options::{Options, SyncMode};
