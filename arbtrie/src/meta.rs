//! The per-id atomic meta word and the small state machine layered on top
//! of it (§4.1, §4.5 "state machine per meta word").
//!
//! Every live id has exactly one `AtomicU64` meta word. All mutations are
//! compare-and-swap on the full word; readers take a single acquire load and
//! interpret the fields locally. There are no per-id mutexes anywhere in
//! this module.

use std::sync::atomic::{AtomicU64, Ordering};

/// A stable small-integer handle to an object, partitioned into a high
/// region and a low index (§3.1).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub region: u16,
    pub index: u32,
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({}:{})", self.region, self.index)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.region, self.index)
    }
}

impl ObjectId {
    /// The null id: no object. Distinct from any id ever handed out by
    /// [`crate::id_alloc::IdAllocator`] because indices 0 within a region
    /// are valid, but `u32::MAX` is reserved.
    pub const NULL: ObjectId = ObjectId {
        region: 0,
        index: u32::MAX,
    };

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX
    }

    /// Pack into a 48-bit-significant `u64` (region in the high 16 bits),
    /// the representation used when a node stores a full cross-region child
    /// address (e.g. binary node values that are object ids).
    pub fn pack(&self) -> u64 {
        ((self.region as u64) << 32) | self.index as u64
    }

    pub fn unpack(v: u64) -> Self {
        ObjectId {
            region: (v >> 32) as u16,
            index: v as u32,
        }
    }
}

/// A physical location within the segment file, in absolute 16-byte units
/// (§3.1: "segment_number * segment_size + offset / 16").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeLocation {
    pub segment: u32,
    /// Byte offset within the segment; always a multiple of
    /// [`crate::options::OBJECT_ALIGN`].
    pub offset: u32,
}

impl NodeLocation {
    fn to_units(self, segment_size: u64) -> u64 {
        let units_per_seg = segment_size / crate::options::OBJECT_ALIGN;
        (self.segment as u64) * units_per_seg + (self.offset as u64) / crate::options::OBJECT_ALIGN
    }

    fn from_units(units: u64, segment_size: u64) -> Self {
        let units_per_seg = segment_size / crate::options::OBJECT_ALIGN;
        NodeLocation {
            segment: (units / units_per_seg) as u32,
            offset: ((units % units_per_seg) * crate::options::OBJECT_ALIGN) as u32,
        }
    }
}

/// The three reachable (non-freed) states of a meta word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    /// Stable; readers may follow `location` and the compactor may move it.
    Clean,
    /// The compactor has reserved this id for a move; in-place writers must
    /// spin until it resolves.
    Moving,
    /// A writer holds the modify-lock and is mutating bytes at `location`
    /// in place; the compactor must not touch it.
    Dirty,
}

const REFCOUNT_BITS: u32 = 15;
const REFCOUNT_MASK: u64 = (1 << REFCOUNT_BITS) - 1;
const READ_BIT: u64 = 1 << 15;
const STATE_SHIFT: u32 = 16;
const STATE_MASK: u64 = 0b11 << STATE_SHIFT;
const LOCATION_SHIFT: u32 = 18;
const LOCATION_BITS: u32 = 64 - LOCATION_SHIFT;
/// Sentinel location value (all location bits set) meaning "freed".
pub const LOCATION_FREED: u64 = (1u64 << LOCATION_BITS) - 1;
/// Maximum saturating refcount value.
pub const MAX_REFCOUNT: u16 = REFCOUNT_MASK as u16;

fn state_from_bits(bits: u64) -> State {
    match (bits & STATE_MASK) >> STATE_SHIFT {
        0 => State::Clean,
        1 => State::Moving,
        2 => State::Dirty,
        other => unreachable!("impossible meta-word state {other}"),
    }
}

fn state_to_bits(s: State) -> u64 {
    (match s {
        State::Clean => 0u64,
        State::Moving => 1,
        State::Dirty => 2,
    }) << STATE_SHIFT
}

/// A decoded snapshot of a meta word, cheap to copy and compare.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Meta {
    raw: u64,
}

impl Meta {
    pub fn refcount(&self) -> u16 {
        (self.raw & REFCOUNT_MASK) as u16
    }

    pub fn read_bit(&self) -> bool {
        self.raw & READ_BIT != 0
    }

    pub fn state(&self) -> State {
        state_from_bits(self.raw)
    }

    fn location_units(&self) -> u64 {
        self.raw >> LOCATION_SHIFT
    }

    /// An id is dead once its refcount drops to zero. At that point its
    /// location bits are repurposed as a free-list thread (see
    /// [`Meta::free_list_next`]) and no longer mean anything as a location.
    pub fn is_freed(&self) -> bool {
        self.refcount() == 0
    }

    pub fn location(&self, segment_size: u64) -> Option<NodeLocation> {
        if self.is_freed() || self.location_units() == LOCATION_FREED {
            None
        } else {
            Some(NodeLocation::from_units(self.location_units(), segment_size))
        }
    }

    /// Interpret the location bits as a free-list "next" pointer (only
    /// meaningful while `refcount == 0`; see the module docs on free-list
    /// threading).
    pub fn free_list_next(&self) -> Option<u32> {
        let units = self.location_units();
        if units == LOCATION_FREED {
            None
        } else {
            Some(units as u32)
        }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }
}

fn build(refcount: u16, read_bit: bool, state: State, location_units: u64) -> u64 {
    debug_assert!(refcount as u64 <= REFCOUNT_MASK);
    debug_assert!(location_units <= LOCATION_FREED);
    (refcount as u64 & REFCOUNT_MASK)
        | (if read_bit { READ_BIT } else { 0 })
        | state_to_bits(state)
        | (location_units << LOCATION_SHIFT)
}

/// The atomic word itself. One per live (or free-listed) id.
#[derive(Debug)]
#[repr(transparent)]
pub struct MetaWord(AtomicU64);

impl MetaWord {
    pub fn new_freed() -> Self {
        MetaWord(AtomicU64::new(build(0, false, State::Clean, LOCATION_FREED)))
    }

    pub fn new_free_list_entry(next: Option<u32>) -> Self {
        let units = next.map(|n| n as u64).unwrap_or(LOCATION_FREED);
        MetaWord(AtomicU64::new(build(0, false, State::Clean, units)))
    }

    pub fn from_raw(raw: u64) -> Self {
        MetaWord(AtomicU64::new(raw))
    }

    pub fn load(&self, order: Ordering) -> Meta {
        Meta {
            raw: self.0.load(order),
        }
    }

    /// Publish a freshly-allocated, not-yet-located id: refcount 1,
    /// location freed (set by the caller once bytes are written).
    pub fn init_allocated(&self) {
        self.0.store(
            build(1, false, State::Clean, LOCATION_FREED),
            Ordering::Release,
        );
    }

    /// Publish the object's first location. Must only be called once, right
    /// after `init_allocated`, before the id is shared with any reader.
    pub fn publish_location(&self, loc: NodeLocation, segment_size: u64) {
        let prev = self.load(Ordering::Relaxed);
        let units = loc.to_units(segment_size);
        self.0.store(
            build(prev.refcount(), prev.read_bit(), State::Clean, units),
            Ordering::Release,
        );
    }

    /// Thread this (already-freed, refcount 0) slot into a region's free
    /// list, pointing at `next`. Must only be called on a slot that just
    /// transitioned to refcount 0 via [`MetaWord::release`].
    pub fn set_free_list_next(&self, next: Option<u32>) {
        let units = next.map(|n| n as u64).unwrap_or(LOCATION_FREED);
        self.0
            .store(build(0, false, State::Clean, units), Ordering::Release);
    }

    /// Saturating retain. Returns `false` on overflow (caller must clone
    /// and retry per §7 `RefcountOverflow`).
    pub fn retain(&self) -> bool {
        loop {
            let cur = self.load(Ordering::Acquire);
            if cur.is_freed() {
                return false;
            }
            let rc = cur.refcount();
            if rc == MAX_REFCOUNT {
                return false;
            }
            let next = build(rc + 1, cur.read_bit(), cur.state(), cur.location_units());
            if self
                .0
                .compare_exchange_weak(cur.raw, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release one reference. Returns the pre-release snapshot if this was
    /// the last reference (the id transitions to `freed`; the caller must
    /// use the returned snapshot's location to release the node's own
    /// children before the slot is recycled, since a freed slot's location
    /// bits no longer mean anything). Returns `None` if other references
    /// remain.
    ///
    /// Panics (invariant violation, not a recoverable error) on
    /// refcount-underflow.
    pub fn release(&self) -> Option<Meta> {
        loop {
            let cur = self.load(Ordering::Acquire);
            let rc = cur.refcount();
            assert!(rc > 0, "refcount underflow: releasing an already-free id");
            if rc == 1 {
                let next = build(0, false, State::Clean, LOCATION_FREED);
                if self
                    .0
                    .compare_exchange_weak(cur.raw, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(cur);
                }
            } else {
                let next = build(rc - 1, cur.read_bit(), cur.state(), cur.location_units());
                if self
                    .0
                    .compare_exchange_weak(cur.raw, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return None;
                }
            }
        }
    }

    /// Opportunistically set the read bit with relaxed ordering. Advisory
    /// only; correctness never depends on it (§9).
    pub fn mark_read(&self) {
        let cur = self.0.load(Ordering::Relaxed);
        if cur & READ_BIT == 0 {
            self.0.fetch_or(READ_BIT, Ordering::Relaxed);
        }
    }

    /// CAS `Clean(loc) -> Moving(loc)`. Used by the compactor before
    /// copying bytes out from under a reader.
    pub fn try_start_move(&self, expected_loc: NodeLocation, segment_size: u64) -> bool {
        let cur = self.load(Ordering::Acquire);
        if cur.state() != State::Clean || cur.is_freed() {
            return false;
        }
        if cur.location(segment_size) != Some(expected_loc) {
            return false;
        }
        let next = build(
            cur.refcount(),
            cur.read_bit(),
            State::Moving,
            cur.location_units(),
        );
        self.0
            .compare_exchange(cur.raw, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Outcome of [`MetaWord::try_move`].
    pub fn try_move(
        &self,
        expected_prior: NodeLocation,
        new_loc: NodeLocation,
        segment_size: u64,
    ) -> MoveOutcome {
        let cur = self.load(Ordering::Acquire);
        if cur.is_freed() {
            return MoveOutcome::Freed;
        }
        match cur.state() {
            State::Dirty => return MoveOutcome::Dirty,
            State::Clean => return MoveOutcome::Moved, // someone else already moved it
            State::Moving => {}
        }
        if cur.location(segment_size) != Some(expected_prior) {
            return MoveOutcome::Moved;
        }
        let next = build(
            cur.refcount(),
            false, // read bit clears implicitly on move, per §9
            State::Clean,
            new_loc.to_units(segment_size),
        );
        if self
            .0
            .compare_exchange(cur.raw, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            MoveOutcome::Success
        } else {
            MoveOutcome::Dirty
        }
    }

    /// CAS `Clean -> Dirty` for the in-place modify protocol. Returns the
    /// pre-modification snapshot on success.
    pub fn start_modify(&self) -> Option<Meta> {
        let cur = self.load(Ordering::Acquire);
        if cur.state() != State::Clean || cur.is_freed() {
            return None;
        }
        let next = build(
            cur.refcount(),
            cur.read_bit(),
            State::Dirty,
            cur.location_units(),
        );
        self.0
            .compare_exchange(cur.raw, next, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| cur)
    }

    /// End the modify-lock, optionally updating the location (modification
    /// in place never changes it, but `realloc`-style growth might).
    pub fn end_modify(&self, new_loc: Option<(NodeLocation, u64)>) {
        let cur = self.load(Ordering::Acquire);
        debug_assert_eq!(cur.state(), State::Dirty);
        let units = match new_loc {
            Some((loc, segment_size)) => loc.to_units(segment_size),
            None => cur.location_units(),
        };
        let next = build(cur.refcount(), cur.read_bit(), State::Clean, units);
        self.0.store(next, Ordering::Release);
    }
}

/// Result of a compactor move attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MoveOutcome {
    Success,
    Freed,
    Moved,
    Dirty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_release_roundtrip() {
        let m = MetaWord::new_freed();
        m.init_allocated();
        assert_eq!(m.load(Ordering::Relaxed).refcount(), 1);
        assert!(m.retain());
        assert_eq!(m.load(Ordering::Relaxed).refcount(), 2);
        assert!(m.release().is_none());
        assert_eq!(m.load(Ordering::Relaxed).refcount(), 1);
        assert!(m.release().is_some());
        assert!(m.load(Ordering::Relaxed).is_freed());
    }

    #[test]
    fn location_roundtrip() {
        let m = MetaWord::new_freed();
        m.init_allocated();
        let loc = NodeLocation {
            segment: 3,
            offset: 128,
        };
        m.publish_location(loc, 1 << 20);
        assert_eq!(m.load(Ordering::Relaxed).location(1 << 20), Some(loc));
    }

    #[test]
    fn refcount_saturates() {
        let m = MetaWord::new_freed();
        m.init_allocated();
        for _ in 0..MAX_REFCOUNT - 1 {
            assert!(m.retain());
        }
        assert_eq!(m.load(Ordering::Relaxed).refcount(), MAX_REFCOUNT);
        assert!(!m.retain());
    }

    #[test]
    fn move_state_machine() {
        let m = MetaWord::new_freed();
        m.init_allocated();
        let segment_size = 1 << 20;
        let a = NodeLocation {
            segment: 0,
            offset: 0,
        };
        let b = NodeLocation {
            segment: 1,
            offset: 16,
        };
        m.publish_location(a, segment_size);
        assert!(m.try_start_move(a, segment_size));
        assert_eq!(
            m.try_move(a, b, segment_size),
            MoveOutcome::Success
        );
        assert_eq!(m.load(Ordering::Relaxed).location(segment_size), Some(b));
    }
}
