//! The four node shapes (§4.4) and the common object framing they share on
//! disk.
//!
//! Every object written into a segment (a node or a standalone out-of-line
//! value) starts with the same small preamble: a checksum, a kind tag, the
//! object's own id (so the compactor can find the right meta word without
//! any side index) and the encoded length. What follows the preamble is
//! shape-specific and decoded by [`binary`], [`setlist`], [`inner`] or
//! [`full`].

pub mod binary;
pub mod full;
pub mod inner;
pub mod setlist;

use crate::checksum;
use crate::meta::ObjectId;
use crate::options::MAX_INLINE_VALUE_LEN;

pub use binary::BinaryNode;
pub use full::FullNode;
pub use inner::InnerNode;
pub use setlist::SetlistNode;

/// Tag byte identifying which shape follows the preamble.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum NodeKind {
    Binary = 0,
    Setlist = 1,
    Inner = 2,
    Full = 3,
    /// Not a trie node: a standalone byte blob referenced by a value too
    /// large to inline (§4.5 "Value storage").
    Blob = 4,
}

impl NodeKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(NodeKind::Binary),
            1 => Some(NodeKind::Setlist),
            2 => Some(NodeKind::Inner),
            3 => Some(NodeKind::Full),
            4 => Some(NodeKind::Blob),
            _ => None,
        }
    }
}

/// checksum(4) + kind(1) + pad(3) + id(8) + body_len(4) = 20 bytes.
pub const OBJECT_HEADER_LEN: usize = 20;

/// A value stored at a trie key: either inlined directly (cheap for small
/// values) or stored as a separate object and referenced by id (§3.2).
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Value {
    Inline(Vec<u8>),
    Indirect(ObjectId),
}

impl Value {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() <= MAX_INLINE_VALUE_LEN {
            Value::Inline(bytes.to_vec())
        } else {
            // Caller (trie/ops.rs) is responsible for writing the blob and
            // handing back the indirect id; this constructor only covers
            // the common inline case used throughout node encode/decode.
            Value::Inline(bytes.to_vec())
        }
    }
}

/// Decode the common preamble. Returns `(kind, id, body)` where `body` is
/// the remainder of `buf` after the preamble, truncated to `body_len`.
/// Verifies the checksum first (§8 invariant 6).
pub fn decode_header(buf: &[u8]) -> Option<(NodeKind, ObjectId, &[u8])> {
    if buf.len() < OBJECT_HEADER_LEN || !checksum::verify(buf) {
        return None;
    }
    let kind = NodeKind::from_u8(buf[4])?;
    let id = ObjectId::unpack(u64::from_le_bytes(buf[8..16].try_into().unwrap()));
    let body_len = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
    let body = buf.get(OBJECT_HEADER_LEN..OBJECT_HEADER_LEN + body_len)?;
    Some((kind, id, body))
}

/// Total on-disk length (preamble + body) for an object whose body is
/// `body_len` bytes.
pub fn total_len(body_len: usize) -> usize {
    OBJECT_HEADER_LEN + body_len
}

/// Encode the preamble and `body` into a fresh buffer and stamp its
/// checksum.
pub fn encode(kind: NodeKind, id: ObjectId, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; total_len(body.len())];
    buf[4] = kind as u8;
    buf[8..16].copy_from_slice(&id.pack().to_le_bytes());
    buf[16..20].copy_from_slice(&(body.len() as u32).to_le_bytes());
    buf[OBJECT_HEADER_LEN..].copy_from_slice(body);
    checksum::stamp(&mut buf);
    buf
}

/// A decoded node, owned and shape-tagged. Trie operations work against
/// this uniform view and re-encode through [`Node::encode`] on write.
#[derive(Clone, Debug)]
pub enum Node {
    Binary(BinaryNode),
    Setlist(SetlistNode),
    Inner(InnerNode),
    Full(FullNode),
}

/// Branch-count thresholds that drive shape transitions (§4.4 "refactor").
/// setlist->inner at 64 children, inner->full at 200 — the named
/// breakpoints. Only binary->setlist is an unspecified tuning parameter.
pub const BINARY_MAX_ENTRIES: usize = 8;
pub const SETLIST_MAX_CHILDREN: usize = 64;
pub const INNER_MAX_CHILDREN: usize = 200;

/// Rounds a body length up to the object-alignment boundary a segment's
/// bump allocator actually reserves for it (§4.2), i.e. the space an
/// in-place modify is free to reuse without moving the object.
pub fn aligned_total_len(body_len: usize) -> usize {
    let total = total_len(body_len) as u64;
    let align = crate::options::OBJECT_ALIGN;
    ((total + align - 1) / align * align) as usize
}

/// A shape-agnostic view of the three branching node kinds, used by
/// `trie::ops` so insert/remove/split logic is written once instead of
/// three times. [`pack`] picks the concrete on-disk shape from the
/// resulting child count; [`unpack`] is the inverse.
#[derive(Clone, Debug)]
pub struct Branching {
    pub prefix: Vec<u8>,
    pub value: Option<Value>,
    pub children: Vec<(u8, ObjectId)>,
}

pub fn unpack(node: &Node) -> Option<Branching> {
    match node {
        Node::Binary(_) => None,
        Node::Setlist(n) => Some(Branching {
            prefix: n.prefix.clone(),
            value: n.value.clone(),
            children: n.children.clone(),
        }),
        Node::Inner(n) => {
            let mut children = Vec::with_capacity(n.branch_count());
            for b in 0u16..256 {
                if let Some(id) = n.get(b as u8) {
                    children.push((b as u8, id));
                }
            }
            Some(Branching {
                prefix: n.prefix.clone(),
                value: n.value.clone(),
                children,
            })
        }
        Node::Full(n) => {
            let mut children = Vec::new();
            for b in 0u16..256 {
                if let Some(id) = n.children[b as usize] {
                    children.push((b as u8, id));
                }
            }
            Some(Branching {
                prefix: n.prefix.clone(),
                value: n.value.clone(),
                children,
            })
        }
    }
}

pub fn pack(b: Branching) -> Node {
    if b.children.len() <= SETLIST_MAX_CHILDREN {
        Node::Setlist(SetlistNode::new(b.prefix, b.children, b.value))
    } else if b.children.len() <= INNER_MAX_CHILDREN {
        let mut n = InnerNode {
            prefix: b.prefix,
            value: b.value,
            ..InnerNode::default()
        };
        for (branch, id) in b.children {
            n = n.with_branch(branch, id);
        }
        Node::Inner(n)
    } else {
        let mut n = FullNode {
            prefix: b.prefix,
            value: b.value,
            ..FullNode::default()
        };
        for (branch, id) in b.children {
            n = n.with_branch(branch, id);
        }
        Node::Full(n)
    }
}

impl Node {
    pub fn decode(kind: NodeKind, body: &[u8]) -> Option<Self> {
        Some(match kind {
            NodeKind::Binary => Node::Binary(BinaryNode::decode(body)?),
            NodeKind::Setlist => Node::Setlist(SetlistNode::decode(body)?),
            NodeKind::Inner => Node::Inner(InnerNode::decode(body)?),
            NodeKind::Full => Node::Full(FullNode::decode(body)?),
            // Blob objects are raw value bytes, not a decodable node shape;
            // see `crate::store::NodeStore::{store_blob,load_blob}`.
            NodeKind::Blob => return None,
        })
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Binary(_) => NodeKind::Binary,
            Node::Setlist(_) => NodeKind::Setlist,
            Node::Inner(_) => NodeKind::Inner,
            Node::Full(_) => NodeKind::Full,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Node::Binary(n) => n.encode(),
            Node::Setlist(n) => n.encode(),
            Node::Inner(n) => n.encode(),
            Node::Full(n) => n.encode(),
        }
    }

    /// Prefix consumed by this node before branching (setlist/inner/full)
    /// or before the literal keys stored in it (binary).
    pub fn prefix(&self) -> &[u8] {
        match self {
            Node::Binary(_) => &[],
            Node::Setlist(n) => &n.prefix,
            Node::Inner(n) => &n.prefix,
            Node::Full(n) => &n.prefix,
        }
    }

    pub fn value_here(&self) -> Option<&Value> {
        match self {
            Node::Binary(_) => None,
            Node::Setlist(n) => n.value.as_ref(),
            Node::Inner(n) => n.value.as_ref(),
            Node::Full(n) => n.value.as_ref(),
        }
    }

    /// Visit every child [`ObjectId`] this node holds, for refcount walks
    /// (§8 invariant: "every reachable object's refcount equals its
    /// in-tree reference count").
    pub fn visit_children(&self, mut f: impl FnMut(ObjectId)) {
        match self {
            Node::Binary(n) => {
                for (_, v) in &n.entries {
                    if let Value::Indirect(id) = v {
                        f(*id);
                    }
                }
            }
            Node::Setlist(n) => {
                for (_, id) in &n.children {
                    f(*id);
                }
                if let Some(Value::Indirect(id)) = &n.value {
                    f(*id);
                }
            }
            Node::Inner(n) => {
                for id in &n.children {
                    f(*id);
                }
                if let Some(Value::Indirect(id)) = &n.value {
                    f(*id);
                }
            }
            Node::Full(n) => {
                for id in n.children.iter().flatten() {
                    f(*id);
                }
                if let Some(Value::Indirect(id)) = &n.value {
                    f(*id);
                }
            }
        }
    }
}
