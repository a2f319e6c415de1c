//! The inner node (§4.4.3): a prefix plus a dense bitmap of which of the
//! 256 possible branch bytes are present, backed by a packed array of only
//! the present children (no wasted slots for absent branches, unlike
//! [`super::full::FullNode`]).

use crate::meta::ObjectId;
use crate::node::setlist::{decode_value, encode_value};
use crate::node::Value;

#[derive(Clone, Debug)]
pub struct InnerNode {
    pub prefix: Vec<u8>,
    /// Bit `i` set means branch byte `i` has a child, stored at
    /// `children[popcount(bitmap[..i])]`.
    pub(crate) bitmap: [u64; 4],
    pub children: Vec<ObjectId>,
    pub value: Option<Value>,
}

impl Default for InnerNode {
    fn default() -> Self {
        InnerNode {
            prefix: Vec::new(),
            bitmap: [0; 4],
            children: Vec::new(),
            value: None,
        }
    }
}

fn bit_index(branch: u8) -> (usize, u32) {
    (branch as usize / 64, branch as u32 % 64)
}

impl InnerNode {
    pub fn branch_count(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn slot_of(&self, branch: u8) -> Option<usize> {
        let (word, bit) = bit_index(branch);
        if self.bitmap[word] & (1 << bit) == 0 {
            return None;
        }
        let mut idx = 0usize;
        for w in 0..word {
            idx += self.bitmap[w].count_ones() as usize;
        }
        idx += (self.bitmap[word] & ((1u64 << bit) - 1)).count_ones() as usize;
        Some(idx)
    }

    pub fn get(&self, branch: u8) -> Option<ObjectId> {
        self.slot_of(branch).map(|i| self.children[i])
    }

    pub fn with_branch(&self, branch: u8, child: ObjectId) -> Self {
        let (word, bit) = bit_index(branch);
        let mut n = self.clone();
        if let Some(i) = n.slot_of(branch) {
            n.children[i] = child;
        } else {
            let i = n.slot_of_insert_pos(branch);
            n.bitmap[word] |= 1 << bit;
            n.children.insert(i, child);
        }
        n
    }

    fn slot_of_insert_pos(&self, branch: u8) -> usize {
        let (word, bit) = bit_index(branch);
        let mut idx = 0usize;
        for w in 0..word {
            idx += self.bitmap[w].count_ones() as usize;
        }
        idx += (self.bitmap[word] & ((1u64 << bit) - 1)).count_ones() as usize;
        idx
    }

    pub fn without_branch(&self, branch: u8) -> Self {
        let mut n = self.clone();
        if let Some(i) = n.slot_of(branch) {
            let (word, bit) = bit_index(branch);
            n.bitmap[word] &= !(1 << bit);
            n.children.remove(i);
        }
        n
    }

    pub fn with_value(&self, value: Option<Value>) -> Self {
        let mut n = self.clone();
        n.value = value;
        n
    }

    pub fn needs_refactor(&self) -> bool {
        self.branch_count() > super::INNER_MAX_CHILDREN
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.prefix.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.prefix);
        for w in &self.bitmap {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        for id in &self.children {
            buf.extend_from_slice(&id.pack().to_le_bytes());
        }
        encode_value(&mut buf, &self.value);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut pos = 0usize;
        let plen = u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?) as usize;
        pos += 2;
        let prefix = buf.get(pos..pos + plen)?.to_vec();
        pos += plen;
        let mut bitmap = [0u64; 4];
        for w in bitmap.iter_mut() {
            *w = u64::from_le_bytes(buf.get(pos..pos + 8)?.try_into().ok()?);
            pos += 8;
        }
        let count: usize = bitmap.iter().map(|w| w.count_ones() as usize).sum();
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = u64::from_le_bytes(buf.get(pos..pos + 8)?.try_into().ok()?);
            pos += 8;
            children.push(ObjectId::unpack(raw));
        }
        let value = decode_value(buf, &mut pos)?;
        Some(InnerNode {
            prefix,
            bitmap,
            children,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_branches_roundtrip() {
        let n = InnerNode::default();
        let n = n.with_branch(5, ObjectId { region: 0, index: 1 });
        let n = n.with_branch(200, ObjectId { region: 0, index: 2 });
        let n = n.with_branch(0, ObjectId { region: 0, index: 3 });
        assert_eq!(n.get(5), Some(ObjectId { region: 0, index: 1 }));
        assert_eq!(n.get(200), Some(ObjectId { region: 0, index: 2 }));
        assert_eq!(n.get(0), Some(ObjectId { region: 0, index: 3 }));
        assert_eq!(n.get(1), None);
        let decoded = InnerNode::decode(&n.encode()).unwrap();
        assert_eq!(decoded.children, n.children);
        let n2 = n.without_branch(5);
        assert_eq!(n2.get(5), None);
        assert_eq!(n2.branch_count(), 2);
    }
}
