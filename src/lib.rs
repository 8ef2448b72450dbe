//! # TabulaDB Core
//!
//! The write path of a log-structured key-value storage engine: a
//! **durable, block-framed record log** and a **lock-free skip-list
//! memtable**, the two pieces every LSM engine is built on.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                     write path                        │
//! │                                                       │
//! │   add(seq, type, key, value)                          │
//! │        │                                              │
//! │        ▼                                              │
//! │  ┌───────────┐   encoded entry   ┌────────────────┐   │
//! │  │ MemTable  │ ────────────────► │ SkipList       │   │
//! │  │ (keys +   │                   │ (lock-free,    │   │
//! │  │  codecs)  │                   │  1W / N-R)     │   │
//! │  └───────────┘                   └────────────────┘   │
//! │                                                       │
//! │   add_record(bytes)              read_record(&mut)    │
//! │        │                                ▲             │
//! │        ▼                                │             │
//! │  ┌───────────┐   32 KiB blocks   ┌────────────────┐   │
//! │  │ LogWriter │ ────────────────► │ LogReader      │   │
//! │  │           │  CRC'd fragments  │ (+ corruption  │   │
//! │  │           │                   │    reporter)   │   │
//! │  └───────────┘                   └────────────────┘   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`encoding`] | Varint32 / fixed-int codecs and CRC-32 (IEEE) |
//! | [`comparator`] | Total orders over user, internal, and memtable keys |
//! | [`keys`] | Internal-key, lookup-key, and memtable-entry formats |
//! | [`skiplist`] | Lock-free ordered set, single writer / many readers |
//! | [`memtable`] | In-memory write buffer with deletion tombstones |
//! | [`log`] | Append-only record log with per-fragment checksums |
//!
//! ## Key Features
//!
//! - **Torn-write recovery** — the log reader silently discards the
//!   unfinished tail a crashed writer leaves behind, and resynchronizes
//!   when opened at an arbitrary byte offset.
//! - **Corruption reporting** — every defect the reader encounters is
//!   surfaced through a caller-supplied reporter with the implicated
//!   byte count; reading always continues at the next plausible
//!   fragment.
//! - **Snapshot-consistent reads** — memtable entries carry a 56-bit
//!   sequence number, so a reader at sequence `s` sees exactly the
//!   newest version at or below `s`, including tombstones.
//! - **Lock-free reads** — skip-list readers never block the writer and
//!   never observe a partially-linked node.
//!
//! ## Quick Start
//!
//! ```rust
//! use tabuladb::keys::{LookupKey, ValueType};
//! use tabuladb::log::{LogReader, LogWriter};
//! use tabuladb::memtable::{MemTable, MemTableGetResult};
//!
//! // Durable side: frame records into the log.
//! let mut writer = LogWriter::new(Vec::new());
//! writer.add_record(b"put hello=world").unwrap();
//! let bytes = writer.into_inner();
//!
//! // Recovery side: stream them back.
//! let mut reader = LogReader::new(std::io::Cursor::new(bytes), (), true, 0);
//! let mut record = Vec::new();
//! assert!(reader.read_record(&mut record));
//! assert_eq!(record, b"put hello=world");
//!
//! // In-memory side: versioned, ordered, tombstone-aware.
//! let mem = MemTable::new();
//! mem.add(1, ValueType::Value, b"hello", b"world");
//! match mem.get(&LookupKey::new(b"hello", 1)) {
//!     MemTableGetResult::Value(v) => assert_eq!(v, b"world"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

pub mod comparator;
pub mod encoding;
pub mod keys;
pub mod log;
pub mod memtable;
pub mod skiplist;
