//! XXH3 checksums over node bodies and object payloads.
//!
//! The design doc requires the checksum to cover a node's "logical content"
//! excluding the checksum field itself (§4.4/§8 invariant 6), which is what
//! [`checksum_body`] computes: the caller passes the full encoded node and
//! we skip the leading 4 bytes where the checksum itself lives.

use xxhash_rust::xxh3::xxh3_64;

/// Number of leading bytes in every encoded node/object reserved for the
/// checksum field.
pub const CHECKSUM_LEN: usize = 4;

/// Compute the checksum that should be stored in `buf[0..4]`, over
/// `buf[4..]`. `buf` must be at least [`CHECKSUM_LEN`] bytes.
pub fn checksum_body(buf: &[u8]) -> u32 {
    debug_assert!(buf.len() >= CHECKSUM_LEN);
    xxh3_64(&buf[CHECKSUM_LEN..]) as u32
}

/// Write the checksum of `buf[4..]` into `buf[0..4]`.
pub fn stamp(buf: &mut [u8]) {
    let sum = checksum_body(buf);
    buf[0..4].copy_from_slice(&sum.to_le_bytes());
}

/// Verify that `buf[0..4]` matches the checksum of `buf[4..]`.
pub fn verify(buf: &[u8]) -> bool {
    if buf.len() < CHECKSUM_LEN {
        return false;
    }
    let stored = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    stored == checksum_body(buf)
}

/// 8-bit hash of a key, used by the binary node's `key_hashes` acceleration
/// array.
pub fn key_hash8(key: &[u8]) -> u8 {
    xxh3_64(key) as u8
}

/// 8-bit hash of a value, used by the binary node's `value_hashes` array.
pub fn value_hash8(value: &[u8]) -> u8 {
    xxh3_64(value) as u8
}
