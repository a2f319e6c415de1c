//! The binary node (§4.4.1): a small, sorted run of literal key/value
//! pairs, used for leaves and small subtries where branching overhead
//! isn't worth it yet.
//!
//! Grounded on `original_source/.../binary_node.hpp`: a per-entry 8-bit key
//! hash array that lets lookups reject most non-matches without touching
//! the key bytes themselves, followed by the sorted key/value pairs.

use crate::checksum::key_hash8;
use crate::meta::ObjectId;
use crate::node::Value;

#[derive(Clone, Debug, Default)]
pub struct BinaryNode {
    /// Sorted by key, ascending. Small (bounded by
    /// [`crate::node::BINARY_MAX_ENTRIES`] in practice, but decode accepts
    /// whatever was encoded).
    pub entries: Vec<(Vec<u8>, Value)>,
}

impl BinaryNode {
    pub fn new(mut entries: Vec<(Vec<u8>, Value)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        BinaryNode { entries }
    }

    fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() < key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        let hash = key_hash8(key);
        let idx = self.lower_bound(key);
        if idx < self.entries.len() && self.entries[idx].0 == key {
            debug_assert_eq!(key_hash8(&self.entries[idx].0), hash);
            return Some(&self.entries[idx].1);
        }
        None
    }

    /// Return a copy with `key` set to `value`, preserving sort order
    /// (copy-on-write: callers always work on the returned clone).
    pub fn with_upsert(&self, key: &[u8], value: Value) -> Self {
        let idx = self.lower_bound(key);
        let mut entries = self.entries.clone();
        if idx < entries.len() && entries[idx].0 == key {
            entries[idx].1 = value;
        } else {
            entries.insert(idx, (key.to_vec(), value));
        }
        BinaryNode { entries }
    }

    pub fn with_removed(&self, key: &[u8]) -> Option<Self> {
        let idx = self.lower_bound(key);
        if idx < self.entries.len() && self.entries[idx].0 == key {
            let mut entries = self.entries.clone();
            entries.remove(idx);
            Some(BinaryNode { entries })
        } else {
            None
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for (k, _) in &self.entries {
            buf.push(key_hash8(k));
        }
        for (k, v) in &self.entries {
            buf.extend_from_slice(&(k.len() as u16).to_le_bytes());
            buf.extend_from_slice(k);
            match v {
                Value::Inline(bytes) => {
                    buf.push(0);
                    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                    buf.extend_from_slice(bytes);
                }
                Value::Indirect(id) => {
                    buf.push(1);
                    buf.extend_from_slice(&id.pack().to_le_bytes());
                }
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut pos = 0usize;
        let count = u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?) as usize;
        pos += 2;
        pos += count; // skip hash acceleration array
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let klen = u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?) as usize;
            pos += 2;
            let key = buf.get(pos..pos + klen)?.to_vec();
            pos += klen;
            let tag = *buf.get(pos)?;
            pos += 1;
            let value = match tag {
                0 => {
                    let vlen = u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?) as usize;
                    pos += 2;
                    let v = buf.get(pos..pos + vlen)?.to_vec();
                    pos += vlen;
                    Value::Inline(v)
                }
                1 => {
                    let raw = u64::from_le_bytes(buf.get(pos..pos + 8)?.try_into().ok()?);
                    pos += 8;
                    Value::Indirect(ObjectId::unpack(raw))
                }
                _ => return None,
            };
            entries.push((key, value));
        }
        Some(BinaryNode { entries })
    }

    /// Whether this node has grown past the point where a setlist/inner
    /// shape would do better (§4.4 "refactor").
    pub fn needs_refactor(&self) -> bool {
        self.entries.len() > super::BINARY_MAX_ENTRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_get_remove() {
        let n = BinaryNode::default();
        let n = n.with_upsert(b"b", Value::Inline(b"2".to_vec()));
        let n = n.with_upsert(b"a", Value::Inline(b"1".to_vec()));
        assert_eq!(n.get(b"a"), Some(&Value::Inline(b"1".to_vec())));
        assert_eq!(n.get(b"b"), Some(&Value::Inline(b"2".to_vec())));
        assert_eq!(n.get(b"c"), None);
        let n2 = n.with_removed(b"a").unwrap();
        assert_eq!(n2.get(b"a"), None);
        assert_eq!(n2.entries.len(), 1);
    }

    #[test]
    fn roundtrip_encode_decode() {
        let n = BinaryNode::new(vec![
            (b"k1".to_vec(), Value::Inline(b"v1".to_vec())),
            (b"k2".to_vec(), Value::Indirect(ObjectId { region: 1, index: 2 })),
        ]);
        let decoded = BinaryNode::decode(&n.encode()).unwrap();
        assert_eq!(decoded.entries, n.entries);
    }
}
