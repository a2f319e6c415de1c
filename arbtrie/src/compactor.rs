//! Background compaction (§4.3): reclaim segments that have gone mostly
//! dead by relocating their surviving objects into a fresh destination
//! segment, then returning the emptied segment to the free ring.
//!
//! Runs as a single dedicated thread (§5: "exactly one compactor thread").
//! Every other actor only ever *retains* or *releases* ids; the compactor
//! is the only code that moves an object's bytes without changing what it
//! means, which is why it goes through the `moving` state in `meta.rs`
//! instead of the plain retain/release path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::meta::{MoveOutcome, NodeLocation, ObjectId};
use crate::node;
use crate::options::Options;
use crate::seg_alloc::SegAllocator;

/// One scan-and-evacuate pass over the single best compaction candidate.
/// Returns `true` if a segment was found and processed (whether or not it
/// was fully drained — a segment pinned by a reader's read-lock part way
/// through is simply left for the next pass).
pub fn compact_pass(seg: &SegAllocator, opts: &Options) -> crate::error::Result<bool> {
    let candidate = pick_candidate(seg, opts);
    let Some(src) = candidate else {
        return Ok(false);
    };

    let session = seg.start_session()?;
    let _read_lock = session.read_lock();

    let alloc_pos = seg.with_header(src, |h| h.alloc_pos());
    let mut cursor = 0u64;
    let mut moved = 0u32;
    let mut remaining = 0u32;

    while cursor < alloc_pos {
        let preamble_off = cursor;
        let preamble = seg.with_bytes(
            src,
            preamble_off,
            node::OBJECT_HEADER_LEN as u64,
            |b| b.to_vec(),
        );
        let body_len = u32::from_le_bytes(preamble[16..20].try_into().unwrap()) as usize;
        let total = node::total_len(body_len) as u64;
        let total_aligned =
            (total + crate::options::OBJECT_ALIGN - 1) / crate::options::OBJECT_ALIGN
                * crate::options::OBJECT_ALIGN;

        if let Some((_, id, _)) = node::decode_header(&seg.with_bytes(src, preamble_off, total, |b| b.to_vec())) {
            match relocate_object(seg, src, preamble_off, total, id) {
                Ok(true) => moved += 1,
                Ok(false) => remaining += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "compactor skipped object after error");
                    remaining += 1;
                }
            }
        }
        cursor += total_aligned;
    }

    if remaining == 0 {
        seg.finalize_evacuated_segment(src);
        debug!(segment = src, moved, "compacted segment fully evacuated");
    } else {
        debug!(segment = src, moved, remaining, "compacted segment partially evacuated, will retry");
    }
    Ok(true)
}

/// Largest-free-space segment above the compaction threshold, oldest age
/// breaking ties (§4.3). Never the segment currently being written into.
fn pick_candidate(seg: &SegAllocator, opts: &Options) -> Option<u32> {
    let threshold = opts.compaction_threshold();
    let capacity = seg.segment_capacity();
    let current = seg.current_alloc_segment();
    let mut best: Option<(u32, u64, u64)> = None; // (segment, free_space, age)
    for s in 0..seg.num_segments() {
        if s == current {
            continue;
        }
        let (initialized, free, age) =
            seg.with_header(s, |h| (h.is_initialized(), h.free_space(capacity), h.age()));
        if !initialized || free < threshold {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, bf, ba)) => free > bf || (free == bf && age < ba),
        };
        if better {
            best = Some((s, free, age));
        }
    }
    best.map(|(s, ..)| s)
}

/// Relocate the single object at `(src, offset)` into the compactor's
/// active segment. Returns `Ok(true)` if moved, `Ok(false)` if it was
/// already dead/moved and safely skipped.
fn relocate_object(
    seg: &SegAllocator,
    src: u32,
    offset: u64,
    total_len: u64,
    id: ObjectId,
) -> crate::error::Result<bool> {
    let segment_size = seg.segment_size();
    let current_loc = NodeLocation {
        segment: src,
        offset: offset as u32,
    };

    loop {
        let loc = match seg.ids.location(id, segment_size) {
            Some(l) if l == current_loc => l,
            _ => return Ok(false), // dead, or already relocated by an earlier pass
        };
        if !seg.ids.with_meta(id, |m| m.try_start_move(loc, segment_size)) {
            // Either dirty (writer holds the modify-lock: back off and
            // retry once) or the id has moved/died since the check above.
            if seg.ids.location(id, segment_size) != Some(current_loc) {
                return Ok(false);
            }
            std::thread::yield_now();
            continue;
        }

        let bytes = seg.with_bytes(src, offset, total_len, |b| b.to_vec());
        let (dst, dst_off) = seg.append(total_len)?;
        seg.with_bytes_mut(dst, dst_off, total_len, |d| d.copy_from_slice(&bytes));
        let new_loc = NodeLocation {
            segment: dst,
            offset: dst_off as u32,
        };

        return match seg.ids.with_meta(id, |m| m.try_move(loc, new_loc, segment_size)) {
            MoveOutcome::Success => Ok(true),
            MoveOutcome::Freed | MoveOutcome::Moved => Ok(false),
            MoveOutcome::Dirty => {
                // A writer raced us into the modify-lock between our
                // try_start_move and try_move; the compactor simply drops
                // its reservation and retries the whole object next pass.
                Ok(false)
            }
        };
    }
}

/// Owns the compactor's background thread. Dropping without calling
/// [`Compactor::stop`] leaves the thread running detached until the
/// process exits — callers should always `stop` explicitly (§5
/// "stopping the compactor is the responsibility of the owning process").
pub struct Compactor {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    pub fn start(seg: Arc<SegAllocator>, opts: Options) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let thread_done = done.clone();
        let handle = std::thread::Builder::new()
            .name("arbtrie-compactor".to_string())
            .spawn(move || run(&seg, &opts, &thread_done))
            .expect("failed to spawn compactor thread");
        Compactor {
            done,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn run(seg: &SegAllocator, opts: &Options, done: &AtomicBool) {
    while !done.load(Ordering::Acquire) {
        match compact_pass(seg, opts) {
            Ok(true) => continue,
            Ok(false) => std::thread::sleep(opts.compactor_idle_interval),
            Err(e) => {
                error!(error = %e, "compactor pass failed, backing off");
                std::thread::sleep(opts.compactor_idle_interval);
            }
        }
    }
}
