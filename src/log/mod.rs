//! Append-only record log with 32 KiB block framing.
//!
//! The log is the durability half of the write path: arbitrary byte
//! records go in through [`LogWriter::add_record`] and come back out of
//! [`LogReader::read_record`], in order, across process crashes.
//!
//! # On-disk layout
//!
//! The stream is a sequence of 32 KiB blocks. Each block is a run of
//! *physical records* (fragments), each with a 7-byte header:
//!
//! ```text
//! block:    [fragment][fragment]...[zero padding < 7 bytes]
//! fragment: [crc32: u32 LE][length: u16 LE][type: u8][payload]
//! ```
//!
//! - The checksum covers `type || payload`, IEEE polynomial, seeded per
//!   type for domain separation.
//! - A logical record that does not fit the current block is split into
//!   `First`/`Middle`.../`Last` fragments; one that fits is a single
//!   `Full`. Records never span files.
//! - When fewer than 7 bytes remain in a block, they are zero-filled
//!   and the next fragment starts the next block. Type 0 is reserved
//!   so that padding can never masquerade as a fragment.
//!
//! # Failure model
//!
//! The writer surfaces sink errors to its caller and leaves the stream
//! untrusted afterwards. The reader never fails: every defect is
//! routed to a [`CorruptionReporter`] with the count of bytes it cost,
//! and reading continues at the next plausible fragment. The one
//! deliberate silence is the torn tail a crashed writer leaves at end
//! of stream; that is expected, not corruption.
//!
//! # Concurrency model
//!
//! Neither side synchronizes internally. One writer per sink (callers
//! serialize), one reader per source; the two never share state.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

mod reader;
mod writer;

pub use reader::LogReader;
pub use writer::LogWriter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Size of one log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Fragment header size: checksum (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 4 + 2 + 1;

/// On-disk fragment types. Type 0 is reserved for zero padding and
/// never written.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// A whole record in one fragment.
    Full = 1,

    /// Opening fragment of a multi-block record.
    First = 2,

    /// Interior fragment.
    Middle = 3,

    /// Closing fragment.
    Last = 4,
}

/// Largest valid on-disk type byte.
pub(crate) const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

impl RecordType {
    pub(crate) fn from_byte(byte: u8) -> Option<RecordType> {
        match byte {
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Stable numeric identity of every log error.
///
/// The taxonomy is closed: tooling that records or compares failure
/// kinds matches on these instead of message text. `Ok` denotes the
/// absence of an error and never appears inside a [`LogError`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    Unknown,
    WriteFileFailed,
    FlushFileFailed,
    SyncFileFailed,
    SeekFileFailed,
    CheckCrcFailed,
    ReadFileFailed,
    UnknownRecordType,
    BadRecordLength,
    MissingStart,
    InMiddleRecord,
    PartialRecordWithoutEnd,
}

/// Errors produced by the log writer and reader.
///
/// Writer-side variants surface through `Result`; reader-side variants
/// only ever reach a [`CorruptionReporter`].
#[derive(Debug, Error)]
pub enum LogError {
    /// Appending to the sink failed.
    #[error("failed to write to log sink: {0}")]
    WriteFile(#[source] io::Error),

    /// Flushing the sink failed.
    #[error("failed to flush log sink: {0}")]
    FlushFile(#[source] io::Error),

    /// Syncing the sink to stable storage failed.
    #[error("failed to sync log sink: {0}")]
    SyncFile(#[source] io::Error),

    /// Positioning the source at the initial block failed.
    #[error("failed to seek log source to offset {offset}: {source}")]
    SeekFile {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Refilling the block buffer from the source failed.
    #[error("failed to read log block: {0}")]
    ReadFile(#[source] io::Error),

    /// Fragment checksum did not match its header.
    #[error("checksum mismatch: expected {expected:#010x}, actual {actual:#010x}")]
    CheckCrc { expected: u32, actual: u32 },

    /// Fragment length points past the buffered data.
    #[error("fragment length {claimed} exceeds {available} buffered payload bytes")]
    BadRecordLength { claimed: usize, available: usize },

    /// Header type byte outside the valid range.
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),

    /// `Middle`/`Last` fragment with no `First` in progress.
    #[error("missing start of fragmented record")]
    MissingStart,

    /// A fragmented record was interrupted by a bad fragment.
    #[error("error in middle of record")]
    InMiddleRecord,

    /// A new record started while a fragmented one was unfinished.
    #[error("partial record without end")]
    PartialRecordWithoutEnd,
}

impl LogError {
    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            LogError::WriteFile(_) => ErrorCode::WriteFileFailed,
            LogError::FlushFile(_) => ErrorCode::FlushFileFailed,
            LogError::SyncFile(_) => ErrorCode::SyncFileFailed,
            LogError::SeekFile { .. } => ErrorCode::SeekFileFailed,
            LogError::ReadFile(_) => ErrorCode::ReadFileFailed,
            LogError::CheckCrc { .. } => ErrorCode::CheckCrcFailed,
            LogError::BadRecordLength { .. } => ErrorCode::BadRecordLength,
            LogError::UnknownRecordType(_) => ErrorCode::UnknownRecordType,
            LogError::MissingStart => ErrorCode::MissingStart,
            LogError::InMiddleRecord => ErrorCode::InMiddleRecord,
            LogError::PartialRecordWithoutEnd => ErrorCode::PartialRecordWithoutEnd,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Corruption reporting
// ------------------------------------------------------------------------------------------------

/// Receives every defect the reader detects, with the number of bytes
/// the defect cost. Recovery code typically counts the bytes and logs
/// the error; tests assert on both.
pub trait CorruptionReporter {
    fn corruption(&mut self, dropped_bytes: u32, err: LogError);
}

/// Discards all reports, for callers that only want the records.
impl CorruptionReporter for () {
    fn corruption(&mut self, _dropped_bytes: u32, _err: LogError) {}
}

impl<R: CorruptionReporter + ?Sized> CorruptionReporter for &mut R {
    fn corruption(&mut self, dropped_bytes: u32, err: LogError) {
        (**self).corruption(dropped_bytes, err);
    }
}
