//! The id allocator (§4.1): a growable mmap-backed array of [`MetaWord`]s,
//! partitioned into regions that give each writer thread-local allocation
//! and let sibling trie nodes address their children with a 32-bit index
//! instead of a full region+index pair.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::meta::{MetaWord, ObjectId};

/// Number of id regions; matches the session limit, though the two are
/// conceptually independent (§3.1).
pub const NUM_REGIONS: usize = 64;

const NONE: u32 = u32::MAX;
const SLOT_SIZE: usize = std::mem::size_of::<u64>();

struct IdTable {
    mmap: MmapMut,
    file: File,
    /// Number of slots currently backed by the mapping.
    capacity: usize,
}

impl IdTable {
    /// Returns the opened table and the number of slots that already
    /// existed on disk before this call (i.e. were allocated by some
    /// earlier session and must not be handed out again by a fresh bump
    /// counter).
    fn open(path: &Path, initial_capacity: usize) -> Result<(Self, usize)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        // Only ever stamp slots that did not already exist on disk —
        // reopening a populated table must not wipe out live refcounts
        // and locations.
        let existing_len = file.metadata()?.len();
        let already_initialized = (existing_len / SLOT_SIZE as u64) as usize;
        let min_len = (initial_capacity * SLOT_SIZE) as u64;
        if existing_len < min_len {
            file.set_len(min_len)?;
        }
        let len = file.metadata()?.len() as usize;
        let capacity = len / SLOT_SIZE;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut table = IdTable {
            mmap,
            file,
            capacity,
        };
        table.init_freed_range(already_initialized, capacity);
        Ok((table, already_initialized))
    }

    /// Stamp `[start, end)` with the "freed, no next" bit pattern. A
    /// zero-filled page does *not* mean freed under our encoding (location
    /// unit 0 is a real, valid location), so freshly grown slots must be
    /// initialized explicitly.
    fn init_freed_range(&mut self, start: usize, end: usize) {
        for i in start..end {
            self.slot(i).set_free_list_next(None);
        }
    }

    fn slot(&self, idx: usize) -> &MetaWord {
        debug_assert!(idx < self.capacity);
        unsafe {
            let ptr = self.mmap.as_ptr().add(idx * SLOT_SIZE) as *const MetaWord;
            &*ptr
        }
    }

    fn grow_to(&mut self, min_capacity: usize) -> Result<()> {
        if min_capacity <= self.capacity {
            return Ok(());
        }
        let new_capacity = min_capacity.next_power_of_two().max(self.capacity * 2).max(16);
        let new_len = (new_capacity * SLOT_SIZE) as u64;
        self.file.set_len(new_len)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        let old_capacity = self.capacity;
        self.capacity = new_capacity;
        self.init_freed_range(old_capacity, new_capacity);
        Ok(())
    }
}

struct RegionState {
    /// Head of the per-region free list, or `NONE`.
    free_head: AtomicU32,
}

/// Assigns and reclaims [`ObjectId`]s. Ids are drawn from a single shared
/// bump counter (new, never-used slots) and recycled through a per-region
/// lock-free free list threaded through the slots' own meta words.
pub struct IdAllocator {
    table: RwLock<IdTable>,
    next_bump: AtomicU64,
    regions: Box<[RegionState]>,
    num_regions: AtomicU32,
}

impl IdAllocator {
    pub fn open(path: impl AsRef<Path>, initial_capacity: usize) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let (table, already_initialized) = IdTable::open(&path, initial_capacity.max(1))?;
        let regions = (0..NUM_REGIONS)
            .map(|_| RegionState {
                free_head: AtomicU32::new(NONE),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Every slot that existed before this open was allocated by some
        // earlier session (whether still live or since freed); the bump
        // counter must start past all of them so it never re-hands out an
        // id a stale free list from a previous run might also believe it
        // owns. This forfeits free-list recycling of pre-restart ids
        // (documented in DESIGN.md) in exchange for never colliding.
        Ok(IdAllocator {
            table: RwLock::new(table),
            next_bump: AtomicU64::new(already_initialized as u64),
            regions,
            num_regions: AtomicU32::new(1),
        })
    }

    /// Reserve a fresh region for thread-local allocation (§4.1
    /// `new_region()`).
    pub fn new_region(&self) -> u16 {
        let n = self.num_regions.fetch_add(1, Ordering::Relaxed);
        (n % NUM_REGIONS as u32) as u16
    }

    /// Allocate a fresh id in `region`: refcount 1, location undefined
    /// until the caller writes bytes and calls
    /// [`MetaWord::publish_location`].
    pub fn allocate(&self, region: u16) -> Result<ObjectId> {
        debug_assert!((region as usize) < NUM_REGIONS);
        let rs = &self.regions[region as usize];

        // Try the free list first.
        loop {
            let head = rs.free_head.load(Ordering::Acquire);
            if head == NONE {
                break;
            }
            let table = self.table.read();
            let next = table.slot(head as usize).load(Ordering::Acquire).free_list_next();
            let next = next.unwrap_or(NONE);
            if rs
                .free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                table.slot(head as usize).init_allocated();
                return Ok(ObjectId {
                    region,
                    index: head,
                });
            }
        }

        // Fall back to the shared bump allocator.
        let idx = self.next_bump.fetch_add(1, Ordering::Relaxed);
        let idx = u32::try_from(idx).map_err(|_| Error::OutOfSpace {
            dir: "id table exhausted (u32 index space)".to_string(),
        })?;
        {
            let table = self.table.read();
            if (idx as usize) < table.capacity {
                table.slot(idx as usize).init_allocated();
                return Ok(ObjectId { region, index: idx });
            }
        }
        let mut table = self.table.write();
        table.grow_to(idx as usize + 1)?;
        table.slot(idx as usize).init_allocated();
        Ok(ObjectId { region, index: idx })
    }

    /// Borrow the atomic meta word for `id`. The returned reference is only
    /// valid while no concurrent [`IdAllocator::allocate`] call triggers a
    /// growth remap; callers must not retain it past the current operation
    /// (enforced in practice by always re-deriving it through this method).
    pub fn with_meta<R>(&self, id: ObjectId, f: impl FnOnce(&MetaWord) -> R) -> R {
        let table = self.table.read();
        f(table.slot(id.index as usize))
    }

    /// Increment an id's refcount. Returns `false` on saturation.
    pub fn retain(&self, id: ObjectId) -> bool {
        self.with_meta(id, |m| m.retain())
    }

    /// Current published location of `id`, or `None` if it has none yet
    /// (just allocated) or is dead.
    pub fn location(&self, id: ObjectId, segment_size: u64) -> Option<crate::meta::NodeLocation> {
        self.with_meta(id, |m| m.load(Ordering::Acquire).location(segment_size))
    }

    /// Publish `id`'s first (or moved-to) location.
    pub fn publish_location(&self, id: ObjectId, loc: crate::meta::NodeLocation, segment_size: u64) {
        self.with_meta(id, |m| m.publish_location(loc, segment_size));
    }

    /// Decrement an id's refcount. Returns the pre-release meta snapshot
    /// (still carrying the id's last valid location) if this released the
    /// last reference, threading the slot onto its region's free list. The
    /// caller must use that snapshot to release the node's own children
    /// before relying on anything else about this id.
    pub fn release(&self, id: ObjectId) -> Option<crate::meta::Meta> {
        let prior = self.with_meta(id, |m| m.release());
        if prior.is_some() {
            let rs = &self.regions[id.region as usize];
            let mut head = rs.free_head.load(Ordering::Acquire);
            loop {
                self.with_meta(id, |m| {
                    m.set_free_list_next(if head == NONE { None } else { Some(head) })
                });
                match rs.free_head.compare_exchange_weak(
                    head,
                    id.index,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => head = actual,
                }
            }
        }
        prior
    }

    /// Count of ids currently holding at least one reference. O(capacity);
    /// diagnostic use only (`Database::stats`, §1 "Supplemented features").
    pub fn count_ids_with_refs(&self) -> u64 {
        let table = self.table.read();
        (0..table.capacity)
            .filter(|&i| !table.slot(i).load(Ordering::Relaxed).is_freed())
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_recycle() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = IdAllocator::open(dir.path().join("ids"), 8).unwrap();
        let a = alloc.allocate(0).unwrap();
        let b = alloc.allocate(0).unwrap();
        assert_ne!(a.index, b.index);
        assert!(alloc.release(a).is_some());
        let c = alloc.allocate(0).unwrap();
        // `a`'s slot should have been recycled.
        assert_eq!(c.index, a.index);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = IdAllocator::open(dir.path().join("ids"), 2).unwrap();
        let ids: Vec<_> = (0..100).map(|_| alloc.allocate(0).unwrap()).collect();
        assert_eq!(ids.len(), 100);
        assert!(alloc.retain(ids[0]));
        assert!(alloc.release(ids[0]).is_none());
        assert!(alloc.release(ids[0]).is_some());
    }
}
