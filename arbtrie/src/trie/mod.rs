//! The persistent radix trie itself: a thin root-tracking wrapper around
//! [`crate::store::NodeStore`] and the recursive operations in [`ops`].

pub mod iter;
pub mod ops;

use crate::error::Result;
use crate::meta::ObjectId;
use crate::node::Value;
use crate::store::NodeStore;

/// A single trie rooted at an (possibly absent) [`ObjectId`]. Holding a
/// `Trie` does not itself pin any segment against compaction — callers that
/// need a stable view across multiple calls should do so through a
/// [`crate::seg_alloc::Session`]'s read lock (§4.6).
pub struct Trie<'a> {
    store: NodeStore<'a>,
    region: u16,
    root: Option<ObjectId>,
}

impl<'a> Trie<'a> {
    pub fn new(store: NodeStore<'a>, region: u16, root: Option<ObjectId>) -> Self {
        Trie { store, region, root }
    }

    pub fn root(&self) -> Option<ObjectId> {
        self.root
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        ops::get(&self.store, self.root, key)
    }

    /// Insert or overwrite `key`, replacing `self.root` with the new root
    /// of the resulting trie.
    pub fn upsert(&mut self, key: &[u8], value: Value) -> Result<()> {
        self.root = Some(ops::upsert(&self.store, self.region, self.root, key, value)?);
        Ok(())
    }

    /// Remove `key` if present, replacing `self.root` with the new root
    /// (`None` if the trie is now empty).
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.root = ops::remove(&self.store, self.region, self.root, key)?;
        Ok(())
    }

    /// Release this trie's root reference without replacing it, e.g. when
    /// discarding a whole tree (§6 `Database::drop_tree`-style operation).
    pub fn clear(&mut self) -> Result<()> {
        if let Some(root) = self.root.take() {
            self.store.release(root)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> Result<Vec<(Vec<u8>, Value)>> {
        iter::collect(&self.store, self.root)
    }
}
