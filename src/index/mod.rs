//! # Disk-Resident Secondary Indexes
//!
//! An extendible hash index built on top of the buffer pool. Keys and
//! values are stored inside fixed-size page slots, so both sides of the
//! mapping use a fixed-width codec; comparison and hashing are supplied as
//! capabilities rather than baked into the key type.
//!
//! - [`KeyCodec`]: fixed-width encode/decode into a page slot
//! - [`KeyComparator`]: total order over keys
//! - [`KeyHasher`]: 32-bit hash used for directory routing
//! - [`ExtendibleHashTable`]: the index structure itself

pub mod bucket_page;
pub mod directory_page;
pub mod extendible_hash;

pub use bucket_page::{bucket_capacity, BucketView, BucketViewMut};
pub use directory_page::{DirectoryView, DirectoryViewMut, DIRECTORY_ARRAY_SIZE, MAX_DEPTH};
pub use extendible_hash::ExtendibleHashTable;

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::common::Rid;

// ============================================================================
// Key/Value Codec
// ============================================================================

/// Fixed-width binary codec for keys and values stored in page slots.
///
/// `ENCODED_SIZE` bytes are reserved per slot; `encode` must fill exactly
/// that many bytes and `decode` must read them back.
pub trait KeyCodec: Copy + Send + Sync + 'static {
    /// Bytes occupied by one encoded value.
    const ENCODED_SIZE: usize;

    /// Write `self` into `dst`, which is exactly `ENCODED_SIZE` bytes.
    fn encode(&self, dst: &mut [u8]);

    /// Read a value back out of `src`.
    fn decode(src: &[u8]) -> Self;
}

macro_rules! int_codec {
    ($($t:ty),*) => {
        $(
            impl KeyCodec for $t {
                const ENCODED_SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn encode(&self, dst: &mut [u8]) {
                    dst.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(src: &[u8]) -> Self {
                    <$t>::from_le_bytes(src.try_into().expect("slot width mismatch"))
                }
            }
        )*
    };
}

int_codec!(i32, u32, i64, u64);

impl KeyCodec for Rid {
    const ENCODED_SIZE: usize = 12;

    #[inline]
    fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.page_id.to_le_bytes());
        dst[8..12].copy_from_slice(&self.slot.to_le_bytes());
    }

    #[inline]
    fn decode(src: &[u8]) -> Self {
        Rid {
            page_id: u64::from_le_bytes(src[..8].try_into().expect("slot width mismatch")),
            slot: u32::from_le_bytes(src[8..12].try_into().expect("slot width mismatch")),
        }
    }
}

// ============================================================================
// Comparator Capability
// ============================================================================

/// Total order over keys, supplied to the index as a capability.
pub trait KeyComparator<K>: Clone + Send + Sync + 'static {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Comparator delegating to the key's `Ord` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

// ============================================================================
// Hash Capability
// ============================================================================

/// 32-bit hash over keys; the low `global_depth` bits select the directory
/// slot.
pub trait KeyHasher<K>: Clone + Send + Sync + 'static {
    fn hash_key(&self, key: &K) -> u32;
}

/// Hashes through the standard library's `DefaultHasher`, truncated to the
/// low 32 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyHasher;

impl<K: Hash> KeyHasher<K> for DefaultKeyHasher {
    #[inline]
    fn hash_key(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }
}

/// Uses integer keys as their own hash. Gives callers direct control over
/// the low bits, which is what bucket-collision tests need.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityHasher;

impl KeyHasher<u32> for IdentityHasher {
    #[inline]
    fn hash_key(&self, key: &u32) -> u32 {
        *key
    }
}

impl KeyHasher<u64> for IdentityHasher {
    #[inline]
    fn hash_key(&self, key: &u64) -> u32 {
        *key as u32
    }
}

impl KeyHasher<i32> for IdentityHasher {
    #[inline]
    fn hash_key(&self, key: &i32) -> u32 {
        *key as u32
    }
}

impl KeyHasher<i64> for IdentityHasher {
    #[inline]
    fn hash_key(&self, key: &i64) -> u32 {
        *key as u32
    }
}
