//! Raw `mmap` wrapper for the segment file (§4.2 "segment file").
//!
//! The id table ([`crate::id_alloc`]) uses `memmap2` because it only ever
//! needs one safe, whole-file mapping that grows by remap. The segment file
//! is different: segments are appended in bulk and the compactor wants
//! explicit control over `msync`/`madvise`/`mlock` on specific byte ranges,
//! so this goes straight to `libc`, the way the teacher's WAL writer maps
//! its own append-only file.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use crate::error::{Error, Result};

/// A single growable `mmap`ed file, addressed in absolute bytes. Growth
/// unmaps and remaps; callers must not hold byte slices across a growth
/// call (the allocator layer enforces this by always deriving slices fresh
/// under its own lock).
pub struct SegmentFile {
    file: File,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is only ever read/written through `&self`/`&mut self`
// methods that bound-check against `len`; no aliasing beyond what a normal
// `&[u8]`/`&mut [u8]` borrow would allow.
unsafe impl Send for SegmentFile {}
unsafe impl Sync for SegmentFile {}

impl SegmentFile {
    pub fn open(path: impl AsRef<Path>, initial_len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let cur_len = file.metadata()?.len();
        let len = cur_len.max(initial_len);
        if cur_len < len {
            file.set_len(len)?;
        }
        let ptr = mmap_file(&file, len as usize)?;
        Ok(SegmentFile {
            file,
            ptr,
            len: len as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Grow the file to at least `new_len` bytes, remapping in place.
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        let new_len = new_len as usize;
        if new_len <= self.len {
            return Ok(());
        }
        self.file.set_len(new_len as u64)?;
        unsafe {
            if libc::munmap(self.ptr as *mut libc::c_void, self.len) != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
        self.ptr = mmap_file(&self.file, new_len)?;
        self.len = new_len;
        Ok(())
    }

    /// Borrow `len` bytes at `offset`. Panics if out of range; callers are
    /// expected to have already validated the range against segment
    /// boundaries known to the allocator.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "segment file read out of range");
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Mutable borrow. Safe in the sense that it cannot read/write outside
    /// the mapping; overlapping calls from different threads over
    /// disjoint ranges are the caller's responsibility, exactly as with any
    /// shared mutable mapping (enforced by the modify-lock protocol in
    /// `meta.rs`, not by this type).
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len, "segment file write out of range");
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }

    pub fn msync(&self, offset: usize, len: usize, sync: bool) -> Result<()> {
        let flags = if sync { libc::MS_SYNC } else { libc::MS_ASYNC };
        let rc = unsafe {
            libc::msync(
                self.ptr.add(offset) as *mut libc::c_void,
                len,
                flags,
            )
        };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Advise the kernel that `[offset, offset+len)` will not be needed
    /// soon (used by the compactor right after evacuating a segment).
    pub fn madvise_dontneed(&self, offset: usize, len: usize) {
        unsafe {
            libc::madvise(
                self.ptr.add(offset) as *mut libc::c_void,
                len,
                libc::MADV_DONTNEED,
            );
        }
    }

    pub fn mlock(&self, offset: usize, len: usize) {
        unsafe {
            libc::mlock(self.ptr.add(offset) as *const libc::c_void, len);
        }
    }

    pub fn munlock(&self, offset: usize, len: usize) {
        unsafe {
            libc::munlock(self.ptr.add(offset) as *const libc::c_void, len);
        }
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

fn mmap_file(file: &File, len: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = SegmentFile::open(dir.path().join("segs"), 4096).unwrap();
        f.slice_mut(0, 4).copy_from_slice(b"abcd");
        f.grow(8192).unwrap();
        assert_eq!(f.slice(0, 4), b"abcd");
        assert_eq!(f.len(), 8192);
    }
}
