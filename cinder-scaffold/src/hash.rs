//! 64-bit name hashing used across scaffolds.
//!
//! Material guids, command-stream guids, joint-interface entries and
//! semantic deny lists all use the same hash, so the writer and every
//! reader agree on identity.

use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

/// Hash of a name string. Stable across platforms and process runs.
#[inline]
pub fn hash64(name: &str) -> u64 {
    xxh3_64(name.as_bytes())
}

/// Const-evaluable form of [`hash64`], for chunk type codes and other
/// compile-time constants.
pub const fn hash64_const(name: &[u8]) -> u64 {
    xxhash_rust::const_xxh3::xxh3_64(name)
}

/// Combines two 64-bit hashes into one.
#[inline]
pub fn hash_combine(value: u64, seed: u64) -> u64 {
    xxh3_64_with_seed(&value.to_le_bytes(), seed)
}

/// Parses a numeric literal as a guid, falling back to hashing the string.
///
/// Material binding symbols may either name a material or carry an
/// explicit numeric id; both map into the same 64-bit guid space.
pub fn guid_or_number(symbol: &str) -> u64 {
    if let Ok(parsed) = symbol.parse::<u64>() {
        return parsed;
    }
    hash64(symbol)
}
