//! Recursive get/upsert/remove over the persistent, copy-on-write trie
//! (§4.3, §8).
//!
//! Mutating operations build the *entire* new root-to-leaf path bottom-up
//! without touching the old path's refcounts at all, then release the old
//! root exactly once at the very end. That single release cascades
//! generically through [`crate::store::NodeStore::release`]'s children walk
//! and correctly tears down the whole replaced path, including nodes two or
//! more levels down — which is why every node along the new path that
//! keeps pointing at an *unchanged* sibling subtree must
//! [`crate::store::NodeStore::retain`] it first: the final single release
//! of the old root will walk through that sibling too and drop a reference
//! to it, and the retain is what keeps it alive afterwards. Skipping that
//! retain, or releasing an old node's id more than once, both violate the
//! refcount-conservation invariant (§8).

use crate::error::Result;
use crate::meta::ObjectId;
use crate::node::{self, BinaryNode, Branching, Node, Value};
use crate::store::NodeStore;

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn common_prefix_of_all(keys: &[&[u8]]) -> usize {
    if keys.is_empty() {
        return 0;
    }
    let mut len = keys[0].len();
    for k in &keys[1..] {
        len = common_prefix_len(&keys[0][..len], k);
    }
    len
}

fn retain_unless(store: &NodeStore, children: &[(u8, ObjectId)], skip: Option<u8>) -> Result<()> {
    for (b, id) in children {
        if Some(*b) != skip {
            store.retain(*id)?;
        }
    }
    Ok(())
}

fn retain_value(store: &NodeStore, value: &Option<Value>) -> Result<()> {
    if let Some(Value::Indirect(id)) = value {
        store.retain(*id)?;
    }
    Ok(())
}

/// Split an over-full binary node into a branching node with binary-node
/// children, the way `needs_refactor` triggers a shape change (§4.4).
fn convert_binary_to_branching(store: &NodeStore, region: u16, bn: &BinaryNode) -> Result<Node> {
    let keys: Vec<&[u8]> = bn.entries.iter().map(|(k, _)| k.as_slice()).collect();
    let common = common_prefix_of_all(&keys);
    let mut value_here = None;
    let mut groups: std::collections::BTreeMap<u8, Vec<(Vec<u8>, Value)>> =
        std::collections::BTreeMap::new();
    for (k, v) in &bn.entries {
        let rest = &k[common..];
        if rest.is_empty() {
            value_here = Some(v.clone());
        } else {
            groups.entry(rest[0]).or_default().push((rest[1..].to_vec(), v.clone()));
        }
    }
    let mut children = Vec::with_capacity(groups.len());
    for (b, entries) in groups {
        let child_id = store.store_node(region, &Node::Binary(BinaryNode::new(entries)))?;
        children.push((b, child_id));
    }
    Ok(node::pack(Branching {
        prefix: bn.entries[0].0[..common].to_vec(),
        value: value_here,
        children,
    }))
}

pub fn get(store: &NodeStore, node_id: Option<ObjectId>, key: &[u8]) -> Result<Option<Value>> {
    let id = match node_id {
        None => return Ok(None),
        Some(id) => id,
    };
    let node = store.load(id)?;
    match &node {
        Node::Binary(bn) => Ok(bn.get(key).cloned()),
        _ => {
            let br = node::unpack(&node).expect("non-binary node unpacks");
            if !key.starts_with(&br.prefix) {
                return Ok(None);
            }
            let rest = &key[br.prefix.len()..];
            if rest.is_empty() {
                return Ok(br.value.clone());
            }
            match br.children.iter().find(|(b, _)| *b == rest[0]) {
                None => Ok(None),
                Some((_, child)) => get(store, Some(*child), &rest[1..]),
            }
        }
    }
}

/// Public entry point: build the new path, then drop the caller's
/// reference to the old root exactly once.
pub fn upsert(
    store: &NodeStore,
    region: u16,
    root: Option<ObjectId>,
    key: &[u8],
    value: Value,
) -> Result<ObjectId> {
    let new_root = upsert_rec(store, region, root, key, value)?;
    if let Some(old_root) = root {
        store.release(old_root)?;
    }
    Ok(new_root)
}

fn upsert_rec(
    store: &NodeStore,
    region: u16,
    node_id: Option<ObjectId>,
    key: &[u8],
    value: Value,
) -> Result<ObjectId> {
    let id = match node_id {
        None => {
            return store.store_node(
                region,
                &Node::Binary(BinaryNode::new(vec![(key.to_vec(), value)])),
            )
        }
        Some(id) => id,
    };
    let node = store.load(id)?;
    match &node {
        Node::Binary(bn) => {
            let old_value = bn.get(key).cloned();
            let new_bn = bn.with_upsert(key, value);
            if new_bn.needs_refactor() {
                // Every entry except the one `key` touches keeps pointing
                // at whatever it already pointed at; the old root's
                // eventual single teardown will walk through this same
                // id's entries and drop one reference to each surviving
                // indirect value, so each needs a compensating retain now.
                // The entry for `key` itself is fresh ownership handed in
                // by the caller and needs no retain.
                for (k, v) in &bn.entries {
                    if k.as_slice() != key {
                        if let Value::Indirect(vid) = v {
                            store.retain(*vid)?;
                        }
                    }
                }
                let new_node = convert_binary_to_branching(store, region, &new_bn)?;
                store.store_node(region, &new_node)
            } else {
                let new_node = Node::Binary(new_bn);
                if store.try_modify_in_place(id, &node, &new_node)? {
                    // Same id now serves both the (about-to-be-torn-down)
                    // old path and the new one, so it needs its own
                    // compensating retain, exactly like an unchanged
                    // sibling would. The value `key` used to hold, if
                    // stored out-of-line, is gone the moment these bytes
                    // are overwritten — it won't be visited by the old
                    // root's teardown the way the clone path's untouched
                    // copy would visit it, so release it explicitly here.
                    store.retain(id)?;
                    if let Some(Value::Indirect(old_vid)) = old_value {
                        store.release(old_vid)?;
                    }
                    Ok(id)
                } else {
                    for (k, v) in &bn.entries {
                        if k.as_slice() != key {
                            if let Value::Indirect(vid) = v {
                                store.retain(*vid)?;
                            }
                        }
                    }
                    store.store_node(region, &new_node)
                }
            }
        }
        _ => {
            let br = node::unpack(&node).expect("non-binary node unpacks");
            if !key.starts_with(&br.prefix) {
                store_split(store, region, &br, key, value)
            } else {
                let rest = &key[br.prefix.len()..];
                if rest.is_empty() {
                    retain_unless(store, &br.children, None)?;
                    let parent = Branching {
                        prefix: br.prefix.clone(),
                        value: Some(value),
                        children: br.children.clone(),
                    };
                    store.store_node(region, &node::pack(parent))
                } else {
                    let branch = rest[0];
                    let child_rest = &rest[1..];
                    let existing = br.children.iter().find(|(b, _)| *b == branch).map(|(_, c)| *c);
                    let new_child = upsert_rec(store, region, existing, child_rest, value)?;
                    retain_unless(store, &br.children, Some(branch))?;
                    retain_value(store, &br.value)?;
                    let mut children: Vec<_> =
                        br.children.iter().filter(|(b, _)| *b != branch).cloned().collect();
                    children.push((branch, new_child));
                    let parent = Branching {
                        prefix: br.prefix.clone(),
                        value: br.value.clone(),
                        children,
                    };
                    store.store_node(region, &node::pack(parent))
                }
            }
        }
    }
}

/// `key` diverges from `br.prefix` partway through; split into a shorter
/// shared-prefix parent with two children (the existing subtree, rehung
/// under its remaining suffix, and a fresh leaf for `key`). The caller's
/// node (whose fields `br` was unpacked from) is not released here — its
/// single release happens via [`upsert`]'s top-level cleanup.
fn store_split(
    store: &NodeStore,
    region: u16,
    br: &Branching,
    key: &[u8],
    value: Value,
) -> Result<ObjectId> {
    let common = common_prefix_len(&br.prefix, key);
    let old_branch = br.prefix[common];
    let old_suffix = Branching {
        prefix: br.prefix[common + 1..].to_vec(),
        value: br.value.clone(),
        children: br.children.clone(),
    };
    retain_unless(store, &br.children, None)?;
    retain_value(store, &br.value)?;
    let old_suffix_id = store.store_node(region, &node::pack(old_suffix))?;

    let new_rest = &key[common..];
    let mut children = vec![(old_branch, old_suffix_id)];
    let value_here = if new_rest.is_empty() {
        Some(value)
    } else {
        let new_branch = new_rest[0];
        let leaf = store.store_node(
            region,
            &Node::Binary(BinaryNode::new(vec![(new_rest[1..].to_vec(), value)])),
        )?;
        children.push((new_branch, leaf));
        None
    };
    let parent = Branching {
        prefix: br.prefix[..common].to_vec(),
        value: value_here,
        children,
    };
    store.store_node(region, &node::pack(parent))
}

/// Outcome of a remove at one level of recursion.
enum RemoveOutcome {
    /// The key wasn't present under this subtree; nothing changed.
    Unchanged,
    /// The subtree changed; `None` means it's now empty and should be
    /// unlinked from the parent entirely.
    Removed(Option<ObjectId>),
}

/// Public entry point: returns the new root (`None` if the trie is now
/// empty), releasing the caller's reference to the old root exactly once
/// if anything actually changed.
pub fn remove(
    store: &NodeStore,
    region: u16,
    root: Option<ObjectId>,
    key: &[u8],
) -> Result<Option<ObjectId>> {
    match remove_rec(store, region, root, key)? {
        RemoveOutcome::Unchanged => Ok(root),
        RemoveOutcome::Removed(new_root) => {
            if let Some(old_root) = root {
                store.release(old_root)?;
            }
            Ok(new_root)
        }
    }
}

fn remove_rec(
    store: &NodeStore,
    region: u16,
    node_id: Option<ObjectId>,
    key: &[u8],
) -> Result<RemoveOutcome> {
    let id = match node_id {
        None => return Ok(RemoveOutcome::Unchanged),
        Some(id) => id,
    };
    let node = store.load(id)?;
    match &node {
        Node::Binary(bn) => match bn.with_removed(key) {
            None => Ok(RemoveOutcome::Unchanged),
            Some(new_bn) => {
                // Surviving entries carry their indirect values into the
                // new version; the old id's eventual single teardown will
                // drop one reference to every entry it holds (including
                // the removed one, correctly freeing it), so survivors
                // need a compensating retain now.
                for (k, v) in &bn.entries {
                    if k.as_slice() != key {
                        if let Value::Indirect(vid) = v {
                            store.retain(*vid)?;
                        }
                    }
                }
                if new_bn.entries.is_empty() {
                    Ok(RemoveOutcome::Removed(None))
                } else {
                    let new_id = store.store_node(region, &Node::Binary(new_bn))?;
                    Ok(RemoveOutcome::Removed(Some(new_id)))
                }
            }
        },
        _ => {
            let br = node::unpack(&node).expect("non-binary node unpacks");
            if !key.starts_with(&br.prefix) {
                return Ok(RemoveOutcome::Unchanged);
            }
            let rest = &key[br.prefix.len()..];
            if rest.is_empty() {
                if br.value.is_none() {
                    return Ok(RemoveOutcome::Unchanged);
                }
                retain_unless(store, &br.children, None)?;
                if br.children.is_empty() {
                    Ok(RemoveOutcome::Removed(None))
                } else {
                    let parent = Branching {
                        prefix: br.prefix.clone(),
                        value: None,
                        children: br.children.clone(),
                    };
                    let new_id = store.store_node(region, &node::pack(parent))?;
                    Ok(RemoveOutcome::Removed(Some(new_id)))
                }
            } else {
                let branch = rest[0];
                let child_rest = &rest[1..];
                let existing = br.children.iter().find(|(b, _)| *b == branch).map(|(_, c)| *c);
                let existing = match existing {
                    None => return Ok(RemoveOutcome::Unchanged),
                    Some(c) => c,
                };
                match remove_rec(store, region, Some(existing), child_rest)? {
                    RemoveOutcome::Unchanged => Ok(RemoveOutcome::Unchanged),
                    RemoveOutcome::Removed(new_child) => {
                        retain_unless(store, &br.children, Some(branch))?;
                        retain_value(store, &br.value)?;
                        let mut children: Vec<_> =
                            br.children.iter().filter(|(b, _)| *b != branch).cloned().collect();
                        if let Some(nc) = new_child {
                            children.push((branch, nc));
                        }
                        if children.is_empty() && br.value.is_none() {
                            Ok(RemoveOutcome::Removed(None))
                        } else {
                            let parent = Branching {
                                prefix: br.prefix.clone(),
                                value: br.value.clone(),
                                children,
                            };
                            let new_id = store.store_node(region, &node::pack(parent))?;
                            Ok(RemoveOutcome::Removed(Some(new_id)))
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seg_alloc::SegAllocator;

    fn new_store(dir: &std::path::Path) -> SegAllocator {
        let opts = crate::options::Options::new().with_segment_size(1 << 16);
        SegAllocator::open(dir, &opts).unwrap()
    }

    /// Overwriting an existing key's value keeps the same id in place
    /// (refcount stays at 1 across the upsert) instead of allocating a
    /// fresh one, as long as the new encoding fits the old alignment unit.
    #[test]
    fn upsert_same_key_modifies_binary_leaf_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let seg = new_store(dir.path());
        let store = NodeStore::new(&seg);

        let root = upsert(&store, 0, None, b"k", Value::Inline(b"v1".to_vec())).unwrap();
        let v1 = get(&store, Some(root), b"k").unwrap();
        assert_eq!(v1, Some(Value::Inline(b"v1".to_vec())));

        let root2 = upsert(&store, 0, Some(root), b"k", Value::Inline(b"v2".to_vec())).unwrap();
        assert_eq!(root2, root, "modify-in-place keeps the same leaf id");
        assert_eq!(
            get(&store, Some(root2), b"k").unwrap(),
            Some(Value::Inline(b"v2".to_vec()))
        );
        let rc = seg
            .ids
            .with_meta(root2, |m| m.load(std::sync::atomic::Ordering::Acquire).refcount());
        assert_eq!(rc, 1, "in-place update settles back to a single owner");
    }

    /// Replacing an out-of-line value via the in-place path must release
    /// the superseded blob exactly once, since the clone path's implicit
    /// "old bytes survive until the old root's teardown" mechanism does
    /// not apply when the bytes were overwritten rather than replaced.
    #[test]
    fn upsert_in_place_releases_superseded_indirect_value() {
        let dir = tempfile::tempdir().unwrap();
        let seg = new_store(dir.path());
        let store = NodeStore::new(&seg);

        let blob = store.store_blob(0, &[7u8; 64]).unwrap();
        let root = upsert(&store, 0, None, b"k", Value::Indirect(blob)).unwrap();

        let root2 = upsert(&store, 0, Some(root), b"k", Value::Inline(b"small".to_vec())).unwrap();
        assert_eq!(root2, root);
        assert!(
            seg.ids.location(blob, seg.segment_size()).is_none(),
            "superseded blob must be freed, not leaked"
        );
    }
}
