//! Log reader: reassembles records from physical fragments.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::warn;

use crate::encoding::{crc32, decode_fixed32};

use super::{CorruptionReporter, LogError, RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Outcome of reading one physical fragment. `start`/`len` index the
/// backing store; `offset` is the fragment header's position in the
/// stream.
enum Physical {
    Fragment {
        ty: RecordType,
        start: usize,
        len: usize,
        offset: u64,
    },
    /// Checksummed fragment whose type byte is outside the format.
    Unknown { ty: u8, len: usize },
    /// Damaged or deliberately skipped fragment; keep reading.
    Bad,
    Eof,
}

/// Streams logical records back out of a log.
///
/// The reader is infallible from the caller's point of view:
/// [`read_record`](LogReader::read_record) returns `false` exactly
/// once, at end of stream, and every defect on the way is routed to
/// the [`CorruptionReporter`] instead.
///
/// A nonzero `initial_offset` starts reading at the first block
/// boundary at or after that offset; trailing fragments of a record
/// that began earlier are swallowed without corruption reports.
pub struct LogReader<S, R> {
    source: S,
    reporter: R,
    verify_checksums: bool,

    /// One block of backing storage, reused across refills.
    backing_store: Box<[u8]>,

    /// Unread window into `backing_store`.
    buf_start: usize,
    buf_end: usize,

    /// The source returned a short read; no refill will be attempted.
    eof: bool,

    /// Stream offset of the start of the last record returned.
    last_record_offset: u64,

    /// Stream offset one past the last byte pulled into the buffer.
    end_of_buffer_offset: u64,

    initial_offset: u64,

    /// Still skipping orphaned fragments of a record that started
    /// before `initial_offset`.
    resyncing: bool,
}

impl<S: Read + Seek, R: CorruptionReporter> LogReader<S, R> {
    /// Creates a reader over `source`, reporting defects to `reporter`.
    ///
    /// `verify_checksums` disables per-fragment CRC validation when
    /// false (recovery paths that already trust the medium).
    pub fn new(source: S, reporter: R, verify_checksums: bool, initial_offset: u64) -> Self {
        LogReader {
            source,
            reporter,
            verify_checksums,
            backing_store: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            buf_start: 0,
            buf_end: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Reads the next logical record into `record`.
    ///
    /// `record` is cleared first and holds the full payload on a
    /// `true` return; it is the caller's scratch buffer and is
    /// overwritten by the next call. `false` means end of stream.
    pub fn read_record(&mut self, record: &mut Vec<u8>) -> bool {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return false;
        }

        record.clear();
        let mut in_fragmented_record = false;
        // Offset of the First fragment while a spanning record is
        // being assembled; promoted on Last.
        let mut prospective_record_offset = self.last_record_offset;

        loop {
            match self.read_physical_record() {
                Physical::Fragment {
                    ty,
                    start,
                    len,
                    offset,
                } => {
                    if self.resyncing {
                        match ty {
                            // Tail of a record from before our start
                            // point; not ours to report.
                            RecordType::Middle => continue,
                            RecordType::Last => {
                                self.resyncing = false;
                                continue;
                            }
                            _ => self.resyncing = false,
                        }
                    }

                    match ty {
                        RecordType::Full => {
                            if in_fragmented_record && !record.is_empty() {
                                self.report_drop(
                                    record.len() as u32,
                                    LogError::PartialRecordWithoutEnd,
                                );
                            }
                            record.clear();
                            record.extend_from_slice(&self.backing_store[start..start + len]);
                            self.last_record_offset = offset;
                            return true;
                        }
                        RecordType::First => {
                            if in_fragmented_record && !record.is_empty() {
                                self.report_drop(
                                    record.len() as u32,
                                    LogError::PartialRecordWithoutEnd,
                                );
                            }
                            record.clear();
                            prospective_record_offset = offset;
                            record.extend_from_slice(&self.backing_store[start..start + len]);
                            in_fragmented_record = true;
                        }
                        RecordType::Middle => {
                            if !in_fragmented_record {
                                self.report_drop(len as u32, LogError::MissingStart);
                                record.clear();
                            } else {
                                record.extend_from_slice(&self.backing_store[start..start + len]);
                            }
                        }
                        RecordType::Last => {
                            if !in_fragmented_record {
                                self.report_drop(len as u32, LogError::MissingStart);
                                record.clear();
                            } else {
                                record.extend_from_slice(&self.backing_store[start..start + len]);
                                self.last_record_offset = prospective_record_offset;
                                return true;
                            }
                        }
                    }
                }
                Physical::Unknown { ty, len } => {
                    self.resyncing = false;
                    self.report_drop(
                        (len + record.len()) as u32,
                        LogError::UnknownRecordType(ty),
                    );
                    in_fragmented_record = false;
                    record.clear();
                }
                Physical::Bad => {
                    self.resyncing = false;
                    if in_fragmented_record {
                        self.report_drop(record.len() as u32, LogError::InMiddleRecord);
                        in_fragmented_record = false;
                        record.clear();
                    }
                }
                Physical::Eof => return false,
            }
        }
    }

    /// Stream offset of the start of the last record returned by
    /// [`read_record`](LogReader::read_record); for a spanning record,
    /// the `First` fragment's offset.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Shared view of the reporter, for inspecting accumulated state.
    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Positions the source at the block enclosing `initial_offset`,
    /// or the next block when the offset lands in a block's zero
    /// trailer. Reports and gives up on seek failure.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start = self.initial_offset - offset_in_block;

        // Inside the trailer nothing can start; begin at the next block.
        if offset_in_block > (BLOCK_SIZE - HEADER_SIZE) as u64 {
            block_start += BLOCK_SIZE as u64;
        }

        if block_start > 0 {
            self.end_of_buffer_offset = block_start;
            if let Err(err) = self.source.seek(SeekFrom::Start(block_start)) {
                self.report_drop(
                    block_start.try_into().unwrap_or(u32::MAX),
                    LogError::SeekFile {
                        offset: block_start,
                        source: err,
                    },
                );
                return false;
            }
        }

        true
    }

    /// Pulls the next fragment out of the buffer, refilling it one
    /// block at a time.
    fn read_physical_record(&mut self) -> Physical {
        if self.buffered() < HEADER_SIZE && !self.eof {
            // Whatever is left is the zero trailer of the previous
            // block; drop it and pull the next block.
            self.buf_start = 0;
            self.buf_end = 0;
            match self.fill_block() {
                Ok(n) => {
                    if n < BLOCK_SIZE {
                        self.eof = true;
                    }
                    self.end_of_buffer_offset += n as u64;
                    self.buf_end = n;
                }
                Err(err) => {
                    self.eof = true;
                    self.report_drop(BLOCK_SIZE as u32, LogError::ReadFile(err));
                    return Physical::Eof;
                }
            }
        }

        if self.buffered() < HEADER_SIZE {
            // Clean end of stream, or a header the dying writer never
            // finished; either way there is nothing to parse.
            return Physical::Eof;
        }

        let base = self.buf_start;
        let header = &self.backing_store[base..base + HEADER_SIZE];
        let length = u16::from_le_bytes([header[4], header[5]]) as usize;
        let ty = header[6];

        if HEADER_SIZE + length > self.buffered() {
            let drop_size = self.buffered();
            self.buf_start = self.buf_end;
            if !self.eof {
                self.report_drop(
                    drop_size as u32,
                    LogError::BadRecordLength {
                        claimed: length,
                        available: drop_size - HEADER_SIZE,
                    },
                );
                return Physical::Bad;
            }
            // Torn tail of a crashed writer: expected, not corruption.
            return Physical::Eof;
        }

        if self.verify_checksums {
            let expected = decode_fixed32(&self.backing_store[base..base + 4]);
            let actual = crc32(&self.backing_store[base + 6..base + HEADER_SIZE + length]);
            if expected != actual {
                // The length field is under the same checksum, so the
                // rest of the buffered window cannot be trusted either.
                let drop_size = self.buffered();
                self.buf_start = self.buf_end;
                self.report_drop(drop_size as u32, LogError::CheckCrc { expected, actual });
                return Physical::Bad;
            }
        }

        let fragment_offset = self.end_of_buffer_offset - self.buffered() as u64;
        self.buf_start += HEADER_SIZE + length;

        if fragment_offset < self.initial_offset {
            // We sought to the enclosing block start; skip fragments
            // before the requested offset without reporting.
            return Physical::Bad;
        }

        match RecordType::from_byte(ty) {
            Some(ty) => Physical::Fragment {
                ty,
                start: base + HEADER_SIZE,
                len: length,
                offset: fragment_offset,
            },
            None => Physical::Unknown { ty, len: length },
        }
    }

    /// Reads until the backing store holds a whole block or the source
    /// is exhausted. Returns the byte count filled.
    fn fill_block(&mut self) -> io::Result<usize> {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.source.read(&mut self.backing_store[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn buffered(&self) -> usize {
        self.buf_end - self.buf_start
    }

    fn report_drop(&mut self, dropped_bytes: u32, err: LogError) {
        warn!(dropped_bytes, code = ?err.code(), %err, "log corruption");
        self.reporter.corruption(dropped_bytes, err);
    }
}
