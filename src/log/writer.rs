//! Log writer: fragments records into CRC-protected block framing.

use std::io::Write;

use tracing::trace;

use crate::encoding::{crc32, crc32_extend, encode_fixed32};

use super::{LogError, RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};

/// Appends framed records to a byte sink.
///
/// The writer flushes after every physical record, so the durability
/// boundary is one fragment. It keeps no buffer of its own; after a
/// sink error the current block offset may be mid-fragment and the
/// stream must be considered untrusted.
pub struct LogWriter<W: Write> {
    dest: W,

    /// Bytes already used in the current block.
    block_offset: usize,

    /// `type_crc[t]` is the checksum of the type byte `t` alone;
    /// extending it over the payload checksums `type || payload`
    /// without re-hashing the byte per fragment.
    type_crc: [u32; MAX_RECORD_TYPE as usize + 1],
}

impl<W: Write> LogWriter<W> {
    /// Starts a writer on an empty sink.
    pub fn new(dest: W) -> LogWriter<W> {
        LogWriter::with_initial_offset(dest, 0)
    }

    /// Starts a writer on a sink that already holds `dest_length`
    /// bytes of log data, e.g. when reopening a log for append.
    pub fn with_initial_offset(dest: W, dest_length: u64) -> LogWriter<W> {
        let mut type_crc = [0u32; MAX_RECORD_TYPE as usize + 1];
        for (ty, seed) in type_crc.iter_mut().enumerate() {
            *seed = crc32(&[ty as u8]);
        }

        LogWriter {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
            type_crc,
        }
    }

    /// Appends one record, fragmenting across blocks as needed.
    ///
    /// An empty `data` still emits one zero-length `Full` fragment, so
    /// readers can tell "empty record" from "no record".
    pub fn add_record(&mut self, data: &[u8]) -> Result<(), LogError> {
        const ZERO_TRAILER: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];

        let mut start_idx = 0;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // No room for another header; pad out the block.
                if leftover > 0 {
                    self.dest
                        .write_all(&ZERO_TRAILER[..leftover])
                        .map_err(LogError::WriteFile)?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = avail.min(data.len() - start_idx);
            let end = start_idx + fragment_length == data.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            self.emit_physical_record(
                record_type,
                &data[start_idx..start_idx + fragment_length],
            )?;

            start_idx += fragment_length;
            begin = false;
            if start_idx >= data.len() {
                break;
            }
        }

        Ok(())
    }

    fn emit_physical_record(&mut self, ty: RecordType, data: &[u8]) -> Result<(), LogError> {
        debug_assert!(data.len() <= u16::MAX as usize);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let mut header = [0u8; HEADER_SIZE];
        header[4] = (data.len() & 0xff) as u8;
        header[5] = (data.len() >> 8) as u8;
        header[6] = ty as u8;

        let crc = crc32_extend(self.type_crc[ty as usize], data);
        encode_fixed32(&mut header, crc);

        self.dest.write_all(&header).map_err(LogError::WriteFile)?;
        self.dest.write_all(data).map_err(LogError::WriteFile)?;
        self.dest.flush().map_err(LogError::FlushFile)?;

        self.block_offset += HEADER_SIZE + data.len();

        trace!(ty = ?ty, len = data.len(), block_offset = self.block_offset, "emitted fragment");
        Ok(())
    }

    /// Shared view of the sink.
    pub fn get_ref(&self) -> &W {
        &self.dest
    }

    /// Consumes the writer, returning the sink.
    pub fn into_inner(self) -> W {
        self.dest
    }
}
