//! Full-trie key/value iteration.
//!
//! A true lazy `Iterator` over this structure would need to hold a
//! `NodeStore` borrow alive across `next()` calls while stacking partially
//! consumed branching nodes — workable, but it adds a stack-of-cursors type
//! for marginal benefit given this engine's expected tree sizes (a few
//! thousand keys per prefix, not a log-structured scan over billions of
//! rows). This collects eagerly into a sorted `Vec` instead; documented here
//! as a deliberate simplification rather than an oversight.

use crate::error::Result;
use crate::meta::ObjectId;
use crate::node::{self, Node, Value};
use crate::store::NodeStore;

/// Depth-first, lexicographic-by-key walk of the subtree rooted at `root`.
pub fn collect(store: &NodeStore, root: Option<ObjectId>) -> Result<Vec<(Vec<u8>, Value)>> {
    let mut out = Vec::new();
    if let Some(root) = root {
        walk(store, root, &mut Vec::new(), &mut out)?;
    }
    Ok(out)
}

fn walk(
    store: &NodeStore,
    id: ObjectId,
    prefix: &mut Vec<u8>,
    out: &mut Vec<(Vec<u8>, Value)>,
) -> Result<()> {
    let node = store.load(id)?;
    match &node {
        Node::Binary(bn) => {
            for (k, v) in &bn.entries {
                let mut full = prefix.clone();
                full.extend_from_slice(k);
                out.push((full, v.clone()));
            }
        }
        _ => {
            let br = node::unpack(&node).expect("non-binary node unpacks");
            prefix.extend_from_slice(&br.prefix);
            if let Some(v) = &br.value {
                out.push((prefix.clone(), v.clone()));
            }
            for (b, child) in &br.children {
                prefix.push(*b);
                walk(store, *child, prefix, out)?;
                prefix.pop();
            }
            prefix.truncate(prefix.len() - br.prefix.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::node::Value;
    use crate::options::Options;
    use crate::seg_alloc::SegAllocator;
    use crate::store::NodeStore;

    #[test]
    fn collects_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let seg = SegAllocator::open(dir.path(), &opts).unwrap();
        let mut trie = crate::trie::Trie::new(NodeStore::new(&seg), 0, None);
        for (k, v) in [
            (b"b".to_vec(), b"2".to_vec()),
            (b"a".to_vec(), b"1".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ] {
            trie.upsert(&k, Value::Inline(v)).unwrap();
        }
        let all = trie.iter().unwrap();
        let mut keys: Vec<_> = all.iter().map(|(k, _)| k.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
