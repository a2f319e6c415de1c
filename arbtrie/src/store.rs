//! Bridges the node layer ([`crate::node`]) to the allocator layers
//! ([`crate::seg_alloc`], [`crate::id_alloc`]): encode/decode nodes to and
//! from segment bytes, and carry out the refcounting side of copy-on-write
//! (§8: "every reachable object's refcount equals its in-tree reference
//! count").

use crate::error::{Error, Result};
use crate::meta::ObjectId;
use crate::node::{self, Node, NodeKind};
use crate::seg_alloc::SegAllocator;

pub struct NodeStore<'a> {
    pub seg: &'a SegAllocator,
}

impl<'a> NodeStore<'a> {
    pub fn new(seg: &'a SegAllocator) -> Self {
        NodeStore { seg }
    }

    /// Load and decode the node at `id`.
    pub fn load(&self, id: ObjectId) -> Result<Node> {
        let loc = self
            .seg
            .ids
            .location(id, self.seg.segment_size())
            .ok_or_else(|| Error::integrity(Some(id), "id has no published location"))?;
        self.seg.ids.with_meta(id, |m| m.mark_read());
        let preamble = self.seg.with_bytes(loc.segment, loc.offset as u64, node::OBJECT_HEADER_LEN as u64, |b| b.to_vec());
        let body_len = u32::from_le_bytes(preamble[16..20].try_into().unwrap()) as usize;
        let total = node::total_len(body_len);
        let full = self.seg.with_bytes(loc.segment, loc.offset as u64, total as u64, |b| b.to_vec());
        let (kind, stored_id, body) = node::decode_header(&full)
            .ok_or_else(|| Error::integrity(Some(id), "checksum or framing invalid"))?;
        if stored_id != id {
            return Err(Error::integrity(Some(id), "id stamped in object body does not match"));
        }
        Node::decode(kind, body).ok_or_else(|| Error::integrity(Some(id), "node body decode failed"))
    }

    /// Allocate a fresh id and store `node` as its initial (and, for this
    /// id, only) version.
    pub fn store_new(&self, region: u16, kind: NodeKind, node_body: &[u8]) -> Result<ObjectId> {
        let id = self.seg.ids.allocate(region)?;
        let bytes = node::encode(kind, id, node_body);
        let (seg, off) = self.seg.append(bytes.len() as u64)?;
        self.seg.with_bytes_mut(seg, off, bytes.len() as u64, |dst| dst.copy_from_slice(&bytes));
        self.seg.ids.publish_location(
            id,
            crate::meta::NodeLocation {
                segment: seg,
                offset: off as u32,
            },
            self.seg.segment_size(),
        );
        Ok(id)
    }

    pub fn store_node(&self, region: u16, node: &Node) -> Result<ObjectId> {
        self.store_new(region, node.kind(), &node.encode_body())
    }

    /// Overwrite `id`'s on-disk bytes with `new`'s encoding instead of
    /// allocating a fresh id, when doing so is provably safe (§4.5 upsert
    /// step 1 "modify in place": `clean -> dirty -> clean` under the
    /// modify-lock).
    ///
    /// Two conditions gate this: `id` must be exclusively owned
    /// (refcount == 1, so no sibling version or retained snapshot can
    /// observe the overwrite — only the caller's own in-flight update
    /// path references it), and `new`'s encoded footprint must round up to
    /// the exact same alignment unit as `old`'s. The latter isn't just a
    /// capacity check: a segment has no notion of a node's reserved slot
    /// size independent of its stamped body length, so the compactor's
    /// scan (`compactor.rs`) recomputes the gap to the next object from
    /// *this* object's body length — shrinking it without moving the
    /// following bytes would make that scan walk into the wrong offset.
    ///
    /// Returns `Ok(true)` if applied in place (the id's refcount is left
    /// unchanged by this call; callers must `retain` it themselves before
    /// handing it back up as the new version's reference, exactly as they
    /// would for any other node carried forward unchanged). Returns
    /// `Ok(false)` when the caller must fall back to `store_node` and
    /// allocate a fresh id instead.
    pub fn try_modify_in_place(&self, id: ObjectId, old: &Node, new: &Node) -> Result<bool> {
        if old.kind() != new.kind() {
            return Ok(false);
        }
        if node::aligned_total_len(new.encode_body().len())
            != node::aligned_total_len(old.encode_body().len())
        {
            return Ok(false);
        }
        let segment_size = self.seg.segment_size();
        let loc = match self.seg.ids.location(id, segment_size) {
            Some(l) => l,
            None => return Ok(false),
        };
        let refcount_one = self
            .seg
            .ids
            .with_meta(id, |m| m.load(std::sync::atomic::Ordering::Acquire).refcount() == 1);
        if !refcount_one {
            return Ok(false);
        }
        if self.seg.ids.with_meta(id, |m| m.start_modify()).is_none() {
            // Lost the race to the compactor (already Moving) or to
            // another modify; caller falls back to the normal clone path.
            return Ok(false);
        }
        let bytes = node::encode(new.kind(), id, &new.encode_body());
        self.seg
            .with_bytes_mut(loc.segment, loc.offset as u64, bytes.len() as u64, |dst| {
                dst[..bytes.len()].copy_from_slice(&bytes);
            });
        self.seg.ids.with_meta(id, |m| m.end_modify(None));
        Ok(true)
    }

    /// Store `bytes` as a standalone blob object, for values too large to
    /// inline into their parent binary node (§4.5 "Value storage").
    pub fn store_blob(&self, region: u16, bytes: &[u8]) -> Result<ObjectId> {
        self.store_new(region, NodeKind::Blob, bytes)
    }

    /// Load the raw bytes of a blob previously written by
    /// [`NodeStore::store_blob`].
    pub fn load_blob(&self, id: ObjectId) -> Result<Vec<u8>> {
        let loc = self
            .seg
            .ids
            .location(id, self.seg.segment_size())
            .ok_or_else(|| Error::integrity(Some(id), "id has no published location"))?;
        self.seg.ids.with_meta(id, |m| m.mark_read());
        let preamble = self.seg.with_bytes(loc.segment, loc.offset as u64, node::OBJECT_HEADER_LEN as u64, |b| b.to_vec());
        let body_len = u32::from_le_bytes(preamble[16..20].try_into().unwrap()) as usize;
        let total = node::total_len(body_len);
        let full = self.seg.with_bytes(loc.segment, loc.offset as u64, total as u64, |b| b.to_vec());
        let (kind, stored_id, body) = node::decode_header(&full)
            .ok_or_else(|| Error::integrity(Some(id), "checksum or framing invalid"))?;
        if kind != NodeKind::Blob || stored_id != id {
            return Err(Error::integrity(Some(id), "id is not a blob object"));
        }
        Ok(body.to_vec())
    }

    /// Add one reference to `id`. Returns an overflow error past the
    /// 15-bit saturating refcount (§7).
    pub fn retain(&self, id: ObjectId) -> Result<()> {
        if self.seg.ids.retain(id) {
            Ok(())
        } else {
            Err(Error::RefcountOverflow { id })
        }
    }

    /// Drop one reference to `id`. If this was the last one, recursively
    /// releases every child the node holds (§8 refcount-conservation
    /// invariant) before the slot is recycled.
    pub fn release(&self, id: ObjectId) -> Result<()> {
        if id.is_null() {
            return Ok(());
        }
        let segment_size = self.seg.segment_size();
        let prior = self.seg.ids.release(id);
        let prior = match prior {
            Some(p) => p,
            None => return Ok(()),
        };
        let loc = prior
            .location(segment_size)
            .ok_or_else(|| Error::integrity(Some(id), "freed id had no location to clean up"))?;
        self.seg.dec_object_count(loc.segment);
        let preamble = self.seg.with_bytes(loc.segment, loc.offset as u64, node::OBJECT_HEADER_LEN as u64, |b| b.to_vec());
        let body_len = u32::from_le_bytes(preamble[16..20].try_into().unwrap()) as usize;
        let total = node::total_len(body_len);
        let full = self.seg.with_bytes(loc.segment, loc.offset as u64, total as u64, |b| b.to_vec());
        if let Some((kind, _, body)) = node::decode_header(&full) {
            if let Some(n) = Node::decode(kind, body) {
                let mut err = None;
                n.visit_children(|child| {
                    if err.is_none() {
                        if let Err(e) = self.release(child) {
                            err = Some(e);
                        }
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{BinaryNode, Value};
    use crate::options::Options;

    #[test]
    fn store_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let seg = SegAllocator::open(dir.path(), &opts).unwrap();
        let store = NodeStore::new(&seg);
        let bn = BinaryNode::new(vec![(b"k".to_vec(), Value::Inline(b"v".to_vec()))]);
        let id = store.store_node(0, &Node::Binary(bn)).unwrap();
        let loaded = store.load(id).unwrap();
        match loaded {
            Node::Binary(b) => assert_eq!(b.get(b"k"), Some(&Value::Inline(b"v".to_vec()))),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn release_cascades_to_children() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let seg = SegAllocator::open(dir.path(), &opts).unwrap();
        let store = NodeStore::new(&seg);
        let leaf = store
            .store_node(0, &Node::Binary(BinaryNode::new(vec![(b"x".to_vec(), Value::Inline(b"1".to_vec()))])))
            .unwrap();
        let parent = crate::node::SetlistNode::new(vec![], vec![(b'a', leaf)], None);
        let parent_id = store.store_node(0, &Node::Setlist(parent)).unwrap();
        store.release(parent_id).unwrap();
        assert!(seg.ids.location(leaf, seg.segment_size()).is_none());
    }

    #[test]
    fn modify_in_place_reuses_id_and_location() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let seg = SegAllocator::open(dir.path(), &opts).unwrap();
        let store = NodeStore::new(&seg);

        let old = Node::Binary(BinaryNode::new(vec![(b"k".to_vec(), Value::Inline(b"v1".to_vec()))]));
        let id = store.store_node(0, &old).unwrap();
        let loc_before = seg.ids.location(id, seg.segment_size());

        let new = Node::Binary(BinaryNode::new(vec![(b"k".to_vec(), Value::Inline(b"v2".to_vec()))]));
        assert!(store.try_modify_in_place(id, &old, &new).unwrap());

        assert_eq!(seg.ids.location(id, seg.segment_size()), loc_before);
        match store.load(id).unwrap() {
            Node::Binary(b) => assert_eq!(b.get(b"k"), Some(&Value::Inline(b"v2".to_vec()))),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn modify_in_place_refuses_when_shared() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let seg = SegAllocator::open(dir.path(), &opts).unwrap();
        let store = NodeStore::new(&seg);

        let old = Node::Binary(BinaryNode::new(vec![(b"k".to_vec(), Value::Inline(b"v1".to_vec()))]));
        let id = store.store_node(0, &old).unwrap();
        store.retain(id).unwrap(); // refcount now 2: another path still owns it

        let new = Node::Binary(BinaryNode::new(vec![(b"k".to_vec(), Value::Inline(b"v2".to_vec()))]));
        assert!(!store.try_modify_in_place(id, &old, &new).unwrap());
    }

    #[test]
    fn modify_in_place_refuses_when_footprint_grows_past_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let seg = SegAllocator::open(dir.path(), &opts).unwrap();
        let store = NodeStore::new(&seg);

        let old = Node::Binary(BinaryNode::new(vec![(b"k".to_vec(), Value::Inline(b"v".to_vec()))]));
        let id = store.store_node(0, &old).unwrap();

        let new = Node::Binary(BinaryNode::new(vec![(
            b"k".to_vec(),
            Value::Inline(vec![0u8; 200]),
        )]));
        assert!(!store.try_modify_in_place(id, &old, &new).unwrap());
    }
}
