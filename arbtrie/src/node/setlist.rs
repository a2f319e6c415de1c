//! The setlist node (§4.4.2): a prefix plus a sparse, sorted list of
//! `(branch byte, child id)` pairs. Used once a subtrie has too many
//! distinct branches for a binary node but still few enough that a linear
//! scan beats a dense 256-slot array.

use crate::meta::ObjectId;
use crate::node::Value;

#[derive(Clone, Debug, Default)]
pub struct SetlistNode {
    pub prefix: Vec<u8>,
    /// Sorted by branch byte, ascending.
    pub children: Vec<(u8, ObjectId)>,
    pub value: Option<Value>,
}

impl SetlistNode {
    pub fn new(prefix: Vec<u8>, children: Vec<(u8, ObjectId)>, value: Option<Value>) -> Self {
        let mut children = children;
        children.sort_by_key(|(b, _)| *b);
        SetlistNode {
            prefix,
            children,
            value,
        }
    }

    pub fn get(&self, branch: u8) -> Option<ObjectId> {
        self.children
            .binary_search_by_key(&branch, |(b, _)| *b)
            .ok()
            .map(|i| self.children[i].1)
    }

    pub fn with_branch(&self, branch: u8, child: ObjectId) -> Self {
        let mut children = self.children.clone();
        match children.binary_search_by_key(&branch, |(b, _)| *b) {
            Ok(i) => children[i].1 = child,
            Err(i) => children.insert(i, (branch, child)),
        }
        SetlistNode {
            prefix: self.prefix.clone(),
            children,
            value: self.value.clone(),
        }
    }

    pub fn without_branch(&self, branch: u8) -> Self {
        let mut children = self.children.clone();
        if let Ok(i) = children.binary_search_by_key(&branch, |(b, _)| *b) {
            children.remove(i);
        }
        SetlistNode {
            prefix: self.prefix.clone(),
            children,
            value: self.value.clone(),
        }
    }

    pub fn with_value(&self, value: Option<Value>) -> Self {
        SetlistNode {
            prefix: self.prefix.clone(),
            children: self.children.clone(),
            value,
        }
    }

    pub fn needs_refactor(&self) -> bool {
        self.children.len() > super::SETLIST_MAX_CHILDREN
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.prefix.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.prefix);
        buf.extend_from_slice(&(self.children.len() as u16).to_le_bytes());
        for (b, id) in &self.children {
            buf.push(*b);
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
        let count = u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?) as usize;
        pos += 2;
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            let b = *buf.get(pos)?;
            pos += 1;
            let raw = u64::from_le_bytes(buf.get(pos..pos + 8)?.try_into().ok()?);
            pos += 8;
            children.push((b, ObjectId::unpack(raw)));
        }
        let value = decode_value(buf, &mut pos)?;
        Some(SetlistNode {
            prefix,
            children,
            value,
        })
    }
}

/// Shared value-tail encoding used by setlist/inner/full (§4.4: every
/// branching node may additionally terminate a key at its own prefix).
pub(super) fn encode_value(buf: &mut Vec<u8>, value: &Option<Value>) {
    match value {
        None => buf.push(0),
        Some(Value::Inline(bytes)) => {
            buf.push(1);
            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        Some(Value::Indirect(id)) => {
            buf.push(2);
            buf.extend_from_slice(&id.pack().to_le_bytes());
        }
    }
}

pub(super) fn decode_value(buf: &[u8], pos: &mut usize) -> Option<Option<Value>> {
    let tag = *buf.get(*pos)?;
    *pos += 1;
    Some(match tag {
        0 => None,
        1 => {
            let vlen = u16::from_le_bytes(buf.get(*pos..*pos + 2)?.try_into().ok()?) as usize;
            *pos += 2;
            let v = buf.get(*pos..*pos + vlen)?.to_vec();
            *pos += vlen;
            Some(Value::Inline(v))
        }
        2 => {
            let raw = u64::from_le_bytes(buf.get(*pos..*pos + 8)?.try_into().ok()?);
            *pos += 8;
            Some(Value::Indirect(ObjectId::unpack(raw)))
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_roundtrip() {
        let n = SetlistNode::new(b"pre".to_vec(), vec![], None);
        let n = n.with_branch(b'a', ObjectId { region: 0, index: 1 });
        let n = n.with_branch(b'z', ObjectId { region: 0, index: 2 });
        assert_eq!(n.get(b'a'), Some(ObjectId { region: 0, index: 1 }));
        let decoded = SetlistNode::decode(&n.encode()).unwrap();
        assert_eq!(decoded.children, n.children);
        assert_eq!(decoded.prefix, n.prefix);
    }
}
