// # Hash Table Bucket Page
//
// On-page layout of one hash bucket: two bitmaps followed by a fixed array
// of key/value slots. `occupied` records that a slot was ever written;
// `readable` records that it currently holds a live entry. A readable slot
// is always occupied; remove clears only the readable bit.
//
// ```text
// offset 0:                occupied  [u8; ceil(capacity / 8)]
// offset bitmap_bytes:     readable  [u8; ceil(capacity / 8)]
// offset 2 * bitmap_bytes: slots     [(K, V); capacity]
// ```
//
// Pure in-page operations; concurrency control is the enclosing page latch.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::common::PAGE_SIZE;
use crate::index::{KeyCodec, KeyComparator};

/// Number of key/value slots a bucket page holds for the given codecs.
///
/// Derived so that the two bitmaps plus the slot array fit in one page:
/// `4 * PAGE_SIZE / (4 * entry_size + 1)` slots, each entry paying one
/// quarter bit of bitmap overhead per byte.
pub const fn bucket_capacity<K: KeyCodec, V: KeyCodec>() -> usize {
    4 * PAGE_SIZE / (4 * (K::ENCODED_SIZE + V::ENCODED_SIZE) + 1)
}

#[inline]
const fn bitmap_bytes(capacity: usize) -> usize {
    (capacity + 7) / 8
}

#[inline]
fn bit_is_set(bitmap: &[u8], index: usize) -> bool {
    bitmap[index >> 3] & (1 << (index & 7)) != 0
}

#[inline]
fn set_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index >> 3] |= 1 << (index & 7);
}

#[inline]
fn clear_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index >> 3] &= !(1 << (index & 7));
}

/// Read-only view over a bucket page.
pub struct BucketView<'a, K, V> {
    data: &'a [u8],
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: KeyCodec, V: KeyCodec + PartialEq> BucketView<'a, K, V> {
    pub fn new(data: &'a [u8]) -> Self {
        let capacity = bucket_capacity::<K, V>();
        debug_assert!(
            2 * bitmap_bytes(capacity) + capacity * (K::ENCODED_SIZE + V::ENCODED_SIZE)
                <= data.len()
        );
        Self {
            data,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        bucket_capacity::<K, V>()
    }

    #[inline]
    fn readable_bitmap(&self) -> &[u8] {
        let bytes = bitmap_bytes(self.capacity());
        &self.data[bytes..2 * bytes]
    }

    #[inline]
    fn slot_bytes(&self, slot: usize) -> &[u8] {
        let entry = K::ENCODED_SIZE + V::ENCODED_SIZE;
        let base = 2 * bitmap_bytes(self.capacity()) + slot * entry;
        &self.data[base..base + entry]
    }

    /// True when the slot was ever written.
    #[inline]
    pub fn is_occupied(&self, slot: usize) -> bool {
        bit_is_set(&self.data[..bitmap_bytes(self.capacity())], slot)
    }

    /// True when the slot currently holds a live entry.
    #[inline]
    pub fn is_readable(&self, slot: usize) -> bool {
        bit_is_set(self.readable_bitmap(), slot)
    }

    #[inline]
    pub fn key_at(&self, slot: usize) -> K {
        K::decode(&self.slot_bytes(slot)[..K::ENCODED_SIZE])
    }

    #[inline]
    pub fn value_at(&self, slot: usize) -> V {
        V::decode(&self.slot_bytes(slot)[K::ENCODED_SIZE..])
    }

    /// Collect the values of every live entry whose key compares equal.
    pub fn get_value<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> Vec<V> {
        let mut result = Vec::new();
        for slot in 0..self.capacity() {
            if self.is_readable(slot) && cmp.compare(&self.key_at(slot), key) == Ordering::Equal {
                result.push(self.value_at(slot));
            }
        }
        result
    }

    /// True when a live entry equals `(key, value)`.
    pub fn contains<C: KeyComparator<K>>(&self, key: &K, value: &V, cmp: &C) -> bool {
        (0..self.capacity()).any(|slot| {
            self.is_readable(slot)
                && cmp.compare(&self.key_at(slot), key) == Ordering::Equal
                && self.value_at(slot) == *value
        })
    }

    /// Number of live entries.
    pub fn num_readable(&self) -> usize {
        (0..self.capacity()).filter(|&s| self.is_readable(s)).count()
    }

    /// True when every slot holds a live entry.
    pub fn is_full(&self) -> bool {
        (0..self.capacity()).all(|s| self.is_readable(s))
    }

    /// True when no slot holds a live entry.
    pub fn is_empty(&self) -> bool {
        (0..self.capacity()).all(|s| !self.is_readable(s))
    }
}

/// Mutable view over a bucket page.
pub struct BucketViewMut<'a, K, V> {
    data: &'a mut [u8],
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: KeyCodec, V: KeyCodec + PartialEq> BucketViewMut<'a, K, V> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Reborrow as a read-only view.
    #[inline]
    pub fn as_view(&self) -> BucketView<'_, K, V> {
        BucketView::new(self.data)
    }

    #[inline]
    fn capacity(&self) -> usize {
        bucket_capacity::<K, V>()
    }

    fn write_slot(&mut self, slot: usize, key: &K, value: &V) {
        let entry = K::ENCODED_SIZE + V::ENCODED_SIZE;
        let base = 2 * bitmap_bytes(self.capacity()) + slot * entry;
        key.encode(&mut self.data[base..base + K::ENCODED_SIZE]);
        value.encode(&mut self.data[base + K::ENCODED_SIZE..base + entry]);
    }

    /// Insert `(key, value)` with set semantics.
    ///
    /// Returns false when an identical pair is already live or when no slot
    /// is free. Callers distinguish the two through `is_full`.
    pub fn insert<C: KeyComparator<K>>(&mut self, key: &K, value: &V, cmp: &C) -> bool {
        if self.as_view().contains(key, value, cmp) {
            return false;
        }

        let capacity = self.capacity();
        let free = (0..capacity).find(|&s| !self.as_view().is_readable(s));
        let Some(slot) = free else {
            return false;
        };

        self.write_slot(slot, key, value);
        let bytes = bitmap_bytes(capacity);
        set_bit(&mut self.data[..bytes], slot);
        set_bit(&mut self.data[bytes..2 * bytes], slot);
        true
    }

    /// Remove the first live entry equal to `(key, value)`.
    ///
    /// Clears only the readable bit; the occupied bit stays set.
    pub fn remove<C: KeyComparator<K>>(&mut self, key: &K, value: &V, cmp: &C) -> bool {
        let capacity = self.capacity();
        for slot in 0..capacity {
            let view = self.as_view();
            if view.is_readable(slot)
                && cmp.compare(&view.key_at(slot), key) == Ordering::Equal
                && view.value_at(slot) == *value
            {
                let bytes = bitmap_bytes(capacity);
                clear_bit(&mut self.data[bytes..2 * bytes], slot);
                return true;
            }
        }
        false
    }

    /// Clear a live entry by slot index, used during bucket splits.
    pub fn remove_at(&mut self, slot: usize) {
        let bytes = bitmap_bytes(self.capacity());
        clear_bit(&mut self.data[bytes..2 * bytes], slot);
    }
}
