//! The segment allocator (§4.2 L2): owns the segment file, hands out
//! sessions to readers/writers, and tracks which segments are safe to hand
//! back to the compactor (§5 "read-lock protocol").
//!
//! Grounded directly on `seg_allocator.hpp`'s `seg_allocator`/`session`/
//! `read_lock` trio: a fixed array of session slots, each publishing the
//! free-queue generation it observed at lock time, so the allocator can
//! compute a safe low-water mark (`min_read_ptr`, mirroring the original's
//! `get_min_read_ptr`) before a recycled segment is popped for reuse.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::id_alloc::IdAllocator;
use crate::mapping::SegmentFile;
use crate::options::{Options, MAX_SESSION_COUNT};
use crate::segment::{SegmentHeader, SEGMENT_HEADER_LEN};

/// Sentinel meaning "this session is not currently holding a read lock".
const NOT_READING: u64 = u64::MAX;

struct SessionSlot {
    /// The free-queue's `end_ptr` (push counter) this session observed at
    /// the moment its [`ReadLock`] was acquired, published for the
    /// duration of the lock. `NOT_READING` when idle. A segment sitting at
    /// the free queue's `alloc_ptr` (head) was pushed at generation
    /// `alloc_ptr` itself (positions are assigned in push order), so a
    /// session whose published generation is `> alloc_ptr` cannot hold any
    /// reference into that segment's pre-eviction bytes — it started
    /// reading only after the compactor had already moved everything out
    /// and republished every id's meta word at the new location.
    published_generation: AtomicU64,
    in_use: AtomicU32,
}

/// A ring buffer of segment indices ready for (re)use, mirroring the
/// `free_seg_buffer` described in `seg_allocator.cpp`'s `get_new_segment`.
struct FreeSegmentRing {
    slots: Box<[AtomicU32]>,
    head: AtomicU64,
    tail: AtomicU64,
}

impl FreeSegmentRing {
    fn new(capacity: usize) -> Self {
        FreeSegmentRing {
            slots: (0..capacity).map(|_| AtomicU32::new(u32::MAX)).collect(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    fn push(&self, seg: u32) {
        let tail = self.tail.fetch_add(1, Ordering::AcqRel);
        let idx = tail as usize % self.slots.len();
        self.slots[idx].store(seg, Ordering::Release);
    }

    /// Generation of the next entry due to be popped (`alloc_ptr`). Also
    /// the push generation of whatever segment currently sits there, since
    /// entries are assigned positions in push order.
    fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Push counter (`end_ptr`): one past the generation of the most
    /// recently pushed entry.
    fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head >= tail {
                return None;
            }
            let idx = head as usize % self.slots.len();
            let seg = self.slots[idx].load(Ordering::Acquire);
            if self
                .head
                .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(seg);
            }
        }
    }
}

/// Owns the segment file and coordinates sessions against the compactor.
pub struct SegAllocator {
    file: Mutex<SegmentFile>,
    segment_size: u64,
    max_segment_count: usize,
    sessions: Box<[SessionSlot]>,
    free_ring: FreeSegmentRing,
    /// Index of the segment currently being appended to.
    alloc_segment: AtomicU32,
    /// Total number of segments carved out of the file so far.
    num_segments: AtomicU32,
    age_counter: AtomicU64,
    pub ids: IdAllocator,
}

impl SegAllocator {
    pub fn open(dir: impl AsRef<std::path::Path>, opts: &Options) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let segments_path = dir.join("segments.dat");
        // Reopening an existing file must never reclaim segment 0 (or any
        // other already-carved segment) as the fresh append target — that
        // would reset its header and silently clobber whatever data it
        // holds. Record the on-disk length *before* `SegmentFile::open`
        // pads a brand-new file up to one full segment, so a fresh
        // database still starts `num_segments` at 0.
        let existing_len = std::fs::metadata(&segments_path).map(|m| m.len()).unwrap_or(0);
        let existing_segments = (existing_len / opts.segment_size) as u32;
        let file = SegmentFile::open(&segments_path, opts.segment_size)?;
        let ids = IdAllocator::open(dir.join("ids.dat"), opts.initial_id_capacity)?;
        let sessions = (0..MAX_SESSION_COUNT)
            .map(|_| SessionSlot {
                published_generation: AtomicU64::new(NOT_READING),
                in_use: AtomicU32::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let alloc = SegAllocator {
            file: Mutex::new(file),
            segment_size: opts.segment_size,
            max_segment_count: opts.max_segment_count,
            sessions,
            free_ring: FreeSegmentRing::new(opts.max_segment_count),
            alloc_segment: AtomicU32::new(0),
            num_segments: AtomicU32::new(existing_segments),
            age_counter: AtomicU64::new(1),
            ids,
        };
        let fresh = alloc.carve_segment()?;
        alloc.set_current_alloc_segment(fresh);
        Ok(alloc)
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn capacity_per_segment(&self) -> u64 {
        self.segment_size - SEGMENT_HEADER_LEN as u64
    }

    /// Usable bytes per segment, past its header (§4.3 compaction math).
    pub fn segment_capacity(&self) -> u64 {
        self.capacity_per_segment()
    }

    fn segment_byte_offset(&self, seg: u32) -> u64 {
        seg as u64 * self.segment_size
    }

    /// Total number of segments carved out of the file so far, including
    /// ones currently sitting in the free ring.
    pub fn num_segments(&self) -> u32 {
        self.num_segments.load(Ordering::Acquire)
    }

    /// Borrow a segment's header for the duration of `f` (used by the
    /// compactor's scan pass; §4.3).
    pub fn with_header<R>(&self, seg: u32, f: impl FnOnce(&SegmentHeader) -> R) -> R {
        let file = self.file.lock();
        let off = self.segment_byte_offset(seg) as usize;
        let bytes = file.slice(off, SEGMENT_HEADER_LEN);
        let hdr = unsafe { SegmentHeader::from_bytes(bytes) };
        f(&hdr)
    }

    /// Account for one fewer live object in `seg`, called when an id whose
    /// last known location was in `seg` is released.
    pub fn dec_object_count(&self, seg: u32) {
        self.with_header(seg, |h| h.dec_object_count());
    }

    /// Reset a fully-evacuated segment's header, drop its pages, and hand
    /// it back to the free ring (§4.3 step 4).
    pub fn finalize_evacuated_segment(&self, seg: u32) {
        {
            let file = self.file.lock();
            let off = self.segment_byte_offset(seg) as usize;
            file.msync(off, SEGMENT_HEADER_LEN, true).ok();
            file.munlock(off, self.segment_size as usize);
            file.madvise_dontneed(off, self.segment_size as usize);
        }
        self.recycle_segment(seg);
    }

    /// Allocate a brand-new segment at the end of the file (used only at
    /// startup and when the free ring is empty and the file must grow).
    fn carve_segment(&self) -> Result<u32> {
        let mut file = self.file.lock();
        let seg = self.num_segments.fetch_add(1, Ordering::AcqRel);
        if seg as usize >= self.max_segment_count {
            return Err(Error::OutOfSpace {
                dir: "segment count limit reached".to_string(),
            });
        }
        let needed = (seg as u64 + 1) * self.segment_size;
        if (file.len() as u64) < needed {
            file.grow(needed)?;
        }
        let off = self.segment_byte_offset(seg) as usize;
        let bytes = file.slice(off, SEGMENT_HEADER_LEN);
        let hdr = unsafe { SegmentHeader::from_bytes(bytes) };
        hdr.reset(self.age_counter.fetch_add(1, Ordering::Relaxed));
        Ok(seg)
    }

    /// Obtain a fresh segment to write into: pop from the free ring if the
    /// compactor has recycled one *and* no active reader might still be
    /// viewing its pre-recycle bytes, otherwise carve a new one from the
    /// file (§4.2 "New-segment protocol").
    ///
    /// Reuse is gated on [`SegAllocator::min_read_ptr`]: the entry at the
    /// free ring's head was pushed at generation `head`, so it is only
    /// safe to hand out once every active session's published generation
    /// is strictly greater than `head` — i.e. every reader still holding a
    /// lock started after the compactor had already evacuated it. Without
    /// this check a reader that looked up an id's location just before the
    /// compactor moved it, but has not yet read the bytes at that
    /// location, could have them overwritten out from under it the moment
    /// this segment is reused (invariant "no use-after-recycle").
    pub fn get_new_segment(&self) -> Result<u32> {
        if self.free_ring.head() < self.min_read_ptr() {
            if let Some(seg) = self.free_ring.pop() {
                let file = self.file.lock();
                let off = self.segment_byte_offset(seg) as usize;
                let bytes = file.slice(off, SEGMENT_HEADER_LEN);
                let hdr = unsafe { SegmentHeader::from_bytes(bytes) };
                hdr.reset(self.age_counter.fetch_add(1, Ordering::Relaxed));
                return Ok(seg);
            }
        }
        self.carve_segment()
    }

    /// Hand a fully-evacuated segment back to the free ring. Pushing is
    /// always safe regardless of active readers — it only advances the
    /// queue's `end_ptr`; the safety check lives on the *pop* side, in
    /// [`SegAllocator::get_new_segment`].
    pub fn recycle_segment(&self, seg: u32) {
        self.free_ring.push(seg);
    }

    pub fn current_alloc_segment(&self) -> u32 {
        self.alloc_segment.load(Ordering::Acquire)
    }

    pub fn set_current_alloc_segment(&self, seg: u32) {
        self.alloc_segment.store(seg, Ordering::Release);
    }

    /// Append `len` bytes into the current alloc segment, rolling over to
    /// a new one if it doesn't fit. Returns `(segment, offset_past_header)`.
    pub fn append(&self, len: u64) -> Result<(u32, u64)> {
        loop {
            let seg = self.current_alloc_segment();
            let file = self.file.lock();
            let off = self.segment_byte_offset(seg) as usize;
            let bytes = file.slice(off, SEGMENT_HEADER_LEN);
            let hdr = unsafe { SegmentHeader::from_bytes(bytes) };
            if let Some(pos) = hdr.alloc(len, self.capacity_per_segment()) {
                hdr.inc_object_count();
                return Ok((seg, pos + SEGMENT_HEADER_LEN as u64));
            }
            drop(file);
            let new_seg = self.get_new_segment()?;
            self.set_current_alloc_segment(new_seg);
            if new_seg == seg {
                // nothing else changed it; avoid a tight spin on pathological sizes
                return Err(Error::OutOfSpace {
                    dir: "object larger than segment capacity".to_string(),
                });
            }
        }
    }

    pub fn with_bytes<R>(&self, seg: u32, offset: u64, len: u64, f: impl FnOnce(&[u8]) -> R) -> R {
        let file = self.file.lock();
        let off = self.segment_byte_offset(seg) as usize + offset as usize;
        f(file.slice(off, len as usize))
    }

    pub fn with_bytes_mut<R>(
        &self,
        seg: u32,
        offset: u64,
        len: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let file = self.file.lock();
        let off = self.segment_byte_offset(seg) as usize + offset as usize;
        f(file.slice_mut(off, len as usize))
    }

    pub fn sync(&self, sync: bool) -> Result<()> {
        let file = self.file.lock();
        file.msync(0, file.len(), sync)
    }

    fn acquire_session_slot(&self) -> Option<usize> {
        for (i, s) in self.sessions.iter().enumerate() {
            if s.in_use.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return Some(i);
            }
        }
        None
    }

    pub fn start_session(&self) -> Result<Session<'_>> {
        let slot = self.acquire_session_slot().ok_or_else(|| {
            Error::InvalidArgument("session limit reached".to_string())
        })?;
        Ok(Session {
            alloc: self,
            slot,
        })
    }

    /// Minimum free-queue generation any live session might still be
    /// reading against (§5 `get_min_read_ptr`). `u64::MAX` when no session
    /// holds a read lock, matching the spec's "fall back to `end_ptr`"
    /// idle case: with nothing to block it, any nonempty free queue is
    /// safe to pop from.
    pub fn min_read_ptr(&self) -> u64 {
        let mut min = u64::MAX;
        for s in self.sessions.iter() {
            let v = s.published_generation.load(Ordering::Acquire);
            if v != NOT_READING {
                min = min.min(v);
            }
        }
        min
    }
}

/// A per-thread handle into the allocator, matching the C++ `session`
/// object: readers call [`Session::read_lock`] before dereferencing
/// anything; writers call [`SegAllocator::append`] directly.
pub struct Session<'a> {
    alloc: &'a SegAllocator,
    slot: usize,
}

impl<'a> Session<'a> {
    pub fn read_lock(&self) -> ReadLock<'a, '_> {
        let generation = self.alloc.free_ring.tail();
        self.alloc.sessions[self.slot]
            .published_generation
            .store(generation, Ordering::Release);
        ReadLock { session: self }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.alloc.sessions[self.slot].in_use.store(0, Ordering::Release);
    }
}

/// RAII guard: while held, the compactor will not recycle any segment at
/// or after the index published at acquisition time.
pub struct ReadLock<'a, 'b> {
    session: &'b Session<'a>,
}

impl Drop for ReadLock<'_, '_> {
    fn drop(&mut self) {
        self.session.alloc.sessions[self.session.slot]
            .published_generation
            .store(NOT_READING, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let alloc = SegAllocator::open(dir.path(), &opts).unwrap();
        let (seg, off) = alloc.append(32).unwrap();
        alloc.with_bytes_mut(seg, off, 4, |b| b.copy_from_slice(b"data"));
        alloc.with_bytes(seg, off, 4, |b| assert_eq!(b, b"data"));
    }

    #[test]
    fn session_publishes_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let alloc = SegAllocator::open(dir.path(), &opts).unwrap();
        let session = alloc.start_session().unwrap();
        {
            let _lock = session.read_lock();
            assert_eq!(alloc.min_read_ptr(), 0);
        }
        drop(session);
        assert_eq!(alloc.min_read_ptr(), u64::MAX);
    }

    /// A segment recycled while a reader's lock predates that recycling
    /// must not be handed back out for reuse until the reader releases its
    /// lock — otherwise a writer could overwrite bytes the reader might
    /// still be about to read (invariant "no use-after-recycle").
    #[test]
    fn recycled_segment_withheld_from_reuse_while_read_locked() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new().with_segment_size(1 << 16);
        let alloc = SegAllocator::open(dir.path(), &opts).unwrap();
        let recycled = alloc.current_alloc_segment();
        let segments_before = alloc.num_segments();

        let session = alloc.start_session().unwrap();
        let lock = session.read_lock();

        // Simulate the compactor finishing evacuation of `recycled` while
        // the reader above is still active.
        alloc.recycle_segment(recycled);

        // The reader's published generation predates this push, so reuse
        // must be deferred: a fresh segment is carved instead.
        let got = alloc.get_new_segment().unwrap();
        assert_ne!(got, recycled);
        assert_eq!(alloc.num_segments(), segments_before + 1);

        drop(lock);
        drop(session);

        // With no readers left, the recycled segment is fair game again.
        let got2 = alloc.get_new_segment().unwrap();
        assert_eq!(got2, recycled);
    }
}
