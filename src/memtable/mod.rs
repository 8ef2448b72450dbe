//! In-memory write buffer over the skip list.
//!
//! The memtable is the mutable head of the store: every write lands
//! here first (durability is the log's job, replayed into a fresh
//! memtable on recovery), and every read consults it before any
//! on-disk structure.
//!
//! ## Design Invariants
//!
//! - Writes are assigned monotonically increasing sequence numbers by
//!   the caller; the memtable never sees the same `(user_key, seq,
//!   type)` twice.
//! - The memtable may hold multiple versions per user key; versions
//!   order newest-first under the memtable-key comparator.
//! - Deletes are tombstone entries, not physical removal.
//! - `get` resolves a [`LookupKey`] to the newest entry at or below the
//!   requested sequence, tombstones included.
//!
//! ## Entry layout
//!
//! ```text
//! [varint32 len(user_key) + 8]
//! [user_key bytes]
//! [tag: u64 LE = (seq << 8) | value_type]
//! [varint32 len(value)]
//! [value bytes]
//! ```
//!
//! ## Concurrency
//!
//! One writer, many readers, no locks, inherited directly from
//! [`SkipList`]. Value slices returned by `get` borrow the table and
//! stay valid for its whole lifetime.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::comparator::{
    Comparator, InternalKeyComparator, MemtableKeyComparator, UserKeyComparator,
};
use crate::encoding::{
    decode_fixed64, decode_varint32, encode_fixed64, encode_varint32, varint_length,
};
use crate::keys::{
    length_prefixed_slice, pack_tag, LookupKey, SequenceNumber, ValueType, TAG_SIZE,
};
use crate::skiplist::{SkipList, SkipListIter};

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// The in-memory write buffer: encoded entries in a lock-free skip
/// list, ordered user-key-ascending then sequence-descending.
pub struct MemTable {
    table: SkipList<Vec<u8>, MemtableKeyComparator>,

    user_key_comparator: UserKeyComparator,

    /// Running total of encoded entry bytes; the engine layer watches
    /// this to decide when to rotate the memtable.
    memory_usage: AtomicUsize,
}

/// Outcome of a point lookup.
///
/// The three variants mirror the tag's value types: a live value, a
/// tombstone, and the miss sentinel.
#[derive(Debug, PartialEq, Eq)]
pub enum MemTableGetResult<'a> {
    /// Newest visible entry is a live value.
    Value(&'a [u8]),

    /// Newest visible entry is a deletion tombstone.
    Deletion,

    /// No entry for the user key at or below the requested sequence.
    NotFound,
}

impl Default for MemTable {
    fn default() -> MemTable {
        MemTable::new()
    }
}

impl MemTable {
    /// Creates an empty memtable.
    pub fn new() -> MemTable {
        let user_key_comparator = UserKeyComparator;
        let internal_key_comparator = InternalKeyComparator::new(user_key_comparator);
        let memtable_key_comparator = MemtableKeyComparator::new(internal_key_comparator);

        MemTable {
            table: SkipList::new(memtable_key_comparator),
            user_key_comparator,
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Inserts one version of `user_key` at sequence `seq`.
    ///
    /// `value` is ignored-by-readers for `ValueType::Deletion` entries
    /// and conventionally empty. The caller guarantees monotonic
    /// sequences; inserting a duplicate `(user_key, seq, type)` is
    /// undefined at this layer. `ValueType::NotExist` is a read-side
    /// sentinel and must never be added.
    pub fn add(&self, seq: SequenceNumber, value_type: ValueType, user_key: &[u8], value: &[u8]) {
        debug_assert!(value_type != ValueType::NotExist);

        let internal_key_size = user_key.len() + TAG_SIZE;
        let total = varint_length(internal_key_size as u64)
            + internal_key_size
            + varint_length(value.len() as u64)
            + value.len();

        let mut entry = Vec::with_capacity(total);
        encode_varint32(&mut entry, internal_key_size as u32);
        entry.extend_from_slice(user_key);
        let mut tag = [0u8; TAG_SIZE];
        encode_fixed64(&mut tag, pack_tag(seq, value_type));
        entry.extend_from_slice(&tag);
        encode_varint32(&mut entry, value.len() as u32);
        entry.extend_from_slice(value);

        trace!(
            seq,
            value_type = ?value_type,
            key = %HexKey(user_key),
            entry_len = entry.len(),
            "memtable add"
        );

        self.memory_usage.fetch_add(entry.len(), Ordering::Relaxed);
        self.table.insert(entry);
    }

    /// Looks up the newest entry for the lookup key's user key at or
    /// below its sequence.
    ///
    /// Seeking with the memtable key lands on the first entry whose
    /// user key is `>=` ours; because versions sort newest-first and
    /// the lookup tag is `Value`-typed, that entry is exactly the
    /// newest version at or below the requested sequence, a deletion
    /// written at the same sequence included.
    pub fn get<'a>(&'a self, lookup_key: &LookupKey) -> MemTableGetResult<'a> {
        let mut iter = SkipListIter::new(&self.table);
        iter.seek(&lookup_key.data);

        if iter.valid() {
            let entry = iter.key().as_slice();
            let (key_len, key_len_size) = decode_varint32(entry);
            let key_len = key_len as usize;
            let user_key = &entry[key_len_size..key_len_size + key_len - TAG_SIZE];

            let matches = self
                .user_key_comparator
                .compare(user_key, lookup_key.user_key())
                == std::cmp::Ordering::Equal;
            if matches {
                let tag = decode_fixed64(&entry[key_len_size + key_len - TAG_SIZE..]);
                match ValueType::from_tag(tag) {
                    ValueType::Value => {
                        let value = length_prefixed_slice(&entry[key_len_size + key_len..]);
                        trace!(key = %HexKey(user_key), value_len = value.len(), "memtable hit");
                        return MemTableGetResult::Value(value);
                    }
                    ValueType::Deletion => {
                        trace!(key = %HexKey(user_key), "memtable tombstone hit");
                        return MemTableGetResult::Deletion;
                    }
                    ValueType::NotExist => {}
                }
            }
        }

        MemTableGetResult::NotFound
    }

    /// Ordered iteration over every version in the table, decoded.
    ///
    /// Yields user keys ascending, versions newest-first within a user
    /// key: the order a flush consumer wants.
    pub fn iter(&self) -> MemTableIter<'_> {
        let mut inner = SkipListIter::new(&self.table);
        inner.seek_to_first();
        MemTableIter { inner }
    }

    /// Bytes of encoded entries inserted so far.
    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// Number of versions (not distinct user keys) in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Iteration
// ------------------------------------------------------------------------------------------------

/// One decoded memtable version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemTableEntry<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
    pub value: &'a [u8],
}

/// Iterator over decoded memtable entries in comparator order.
pub struct MemTableIter<'a> {
    inner: SkipListIter<'a, Vec<u8>, MemtableKeyComparator>,
}

impl<'a> Iterator for MemTableIter<'a> {
    type Item = MemTableEntry<'a>;

    fn next(&mut self) -> Option<MemTableEntry<'a>> {
        if !self.inner.valid() {
            return None;
        }
        let entry = decode_entry(self.inner.key());
        self.inner.next();
        Some(entry)
    }
}

/// Splits an encoded entry back into its parts.
fn decode_entry(entry: &[u8]) -> MemTableEntry<'_> {
    let (key_len, key_len_size) = decode_varint32(entry);
    let key_len = key_len as usize;
    let user_key = &entry[key_len_size..key_len_size + key_len - TAG_SIZE];
    let tag = decode_fixed64(&entry[key_len_size + key_len - TAG_SIZE..]);
    let value = length_prefixed_slice(&entry[key_len_size + key_len..]);

    MemTableEntry {
        user_key,
        sequence: tag >> 8,
        value_type: ValueType::from_tag(tag),
        value,
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing helper
// ------------------------------------------------------------------------------------------------

/// Hex rendering of a binary key for log lines; long keys are
/// truncated.
struct HexKey<'a>(&'a [u8]);

impl<'a> std::fmt::Display for HexKey<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
