use std::cell::RefCell;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::rc::Rc;

use tracing_subscriber::EnvFilter;

use crate::encoding::{crc32, encode_fixed32};
use crate::log::{
    CorruptionReporter, ErrorCode, LogError, LogReader, LogWriter, BLOCK_SIZE, HEADER_SIZE,
};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `"123."`-style payload for numbered-record tests.
pub fn number_to_string(n: usize) -> String {
    format!("{n}.")
}

/// `partial` repeated out to `n` bytes.
pub fn big_string(partial: &str, n: usize) -> String {
    let mut s = String::with_capacity(n + partial.len());
    while s.len() < n {
        s.push_str(partial);
    }
    s.truncate(n);
    s
}

// ------------------------------------------------------------------------------------------------
// Corruption accounting
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct ReportState {
    dropped_bytes: u32,
    last_code: Option<ErrorCode>,
}

/// Reporter that counts dropped bytes and remembers the latest error
/// code. Clones share state, so the harness keeps one handle while the
/// reader owns another.
#[derive(Default, Clone)]
pub struct ReportCollector(Rc<RefCell<ReportState>>);

impl ReportCollector {
    pub fn dropped_bytes(&self) -> u32 {
        self.0.borrow().dropped_bytes
    }

    /// Code of the most recent report, `Ok` when nothing was reported.
    pub fn last_code(&self) -> ErrorCode {
        self.0.borrow().last_code.unwrap_or(ErrorCode::Ok)
    }
}

impl CorruptionReporter for ReportCollector {
    fn corruption(&mut self, dropped_bytes: u32, err: LogError) {
        let mut state = self.0.borrow_mut();
        state.dropped_bytes += dropped_bytes;
        state.last_code = Some(err.code());
    }
}

// ------------------------------------------------------------------------------------------------
// Byte source with fault injection
// ------------------------------------------------------------------------------------------------

/// In-memory source that can fail its first read on demand.
pub struct TestSource {
    data: Cursor<Vec<u8>>,
    force_error: bool,
    returned_error: bool,
}

impl Read for TestSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        assert!(!self.returned_error, "must not read after a forced error");
        if self.force_error {
            self.returned_error = true;
            return Err(io::Error::other("forced read error"));
        }
        self.data.read(buf)
    }
}

impl Seek for TestSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.seek(pos)
    }
}

// ------------------------------------------------------------------------------------------------
// Write-then-read harness
// ------------------------------------------------------------------------------------------------

/// The record sizes of the shared initial-offset fixture: two small
/// records, one spanning three blocks, a one-byte record, a medium
/// record, and one that exactly fills a block's payload space.
pub const INITIAL_OFFSET_RECORD_SIZES: [usize; 6] = [
    10_000,
    10_000,
    2 * BLOCK_SIZE - 1000,
    1,
    13_716,
    BLOCK_SIZE - HEADER_SIZE,
];

/// Physical start offset of each fixture record.
pub fn initial_offset_record_offsets() -> [u64; 6] {
    let h = HEADER_SIZE as u64;
    [
        0,
        h + 10_000,
        2 * (h + 10_000),
        2 * (h + 10_000) + (2 * BLOCK_SIZE as u64 - 1000) + 3 * h,
        2 * (h + 10_000) + (2 * BLOCK_SIZE as u64 - 1000) + 3 * h + h + 1,
        3 * BLOCK_SIZE as u64,
    ]
}

/// Drives a writer and reader over the same in-memory byte stream,
/// with hooks for corrupting the bytes in between.
pub struct LogHarness {
    writer: Option<LogWriter<Vec<u8>>>,
    written: Option<Vec<u8>>,
    reader: Option<LogReader<TestSource, ReportCollector>>,
    report: ReportCollector,
    reading: bool,
    force_error: bool,
}

impl Default for LogHarness {
    fn default() -> LogHarness {
        LogHarness::new()
    }
}

impl LogHarness {
    pub fn new() -> LogHarness {
        init_tracing();
        LogHarness {
            writer: Some(LogWriter::new(Vec::new())),
            written: None,
            reader: None,
            report: ReportCollector::default(),
            reading: false,
            force_error: false,
        }
    }

    pub fn write(&mut self, msg: &str) {
        assert!(!self.reading, "write after starting to read");
        self.writer
            .as_mut()
            .expect("writer still open")
            .add_record(msg.as_bytes())
            .unwrap();
    }

    pub fn written_bytes(&self) -> usize {
        match (&self.writer, &self.written) {
            (Some(writer), _) => writer.get_ref().len(),
            (None, Some(data)) => data.len(),
            (None, None) => unreachable!("bytes are either in the writer or captured"),
        }
    }

    /// Next record as a string, or `"EOF"` at end of stream.
    pub fn read(&mut self) -> String {
        if !self.reading {
            self.reopen_reader(0);
        }
        let mut record = Vec::new();
        if self.reader.as_mut().unwrap().read_record(&mut record) {
            String::from_utf8(record).unwrap()
        } else {
            "EOF".to_string()
        }
    }

    /// (Re)opens the reader at `initial_offset` over the written bytes.
    /// The corruption report accumulates across reopens.
    pub fn reopen_reader(&mut self, initial_offset: u64) {
        self.close_writer();
        self.reading = true;
        let source = TestSource {
            data: Cursor::new(self.written.clone().expect("something was written")),
            force_error: self.force_error,
            returned_error: false,
        };
        self.reader = Some(LogReader::new(
            source,
            self.report.clone(),
            true,
            initial_offset,
        ));
    }

    /// Reopens the writer for append at the current end of stream.
    pub fn reopen_for_append(&mut self) {
        self.close_writer();
        let data = self.written.take().unwrap();
        let len = data.len() as u64;
        self.writer = Some(LogWriter::with_initial_offset(data, len));
    }

    pub fn force_error(&mut self) {
        self.force_error = true;
    }

    pub fn dropped_bytes(&self) -> u32 {
        self.report.dropped_bytes()
    }

    pub fn last_code(&self) -> ErrorCode {
        self.report.last_code()
    }

    // --------------------------------------------------------------------------------------------
    // Byte-level corruption hooks
    // --------------------------------------------------------------------------------------------

    pub fn increment_byte(&mut self, offset: usize, delta: u8) {
        let data = self.data_mut();
        data[offset] = data[offset].wrapping_add(delta);
    }

    pub fn set_byte(&mut self, offset: usize, byte: u8) {
        self.data_mut()[offset] = byte;
    }

    pub fn shrink_size(&mut self, bytes: usize) {
        let data = self.data_mut();
        let len = data.len() - bytes;
        data.truncate(len);
    }

    /// Recomputes the stored checksum of the fragment whose header is
    /// at `header_offset`, so type/payload rewrites stay "valid".
    pub fn fix_checksum(&mut self, header_offset: usize, payload_len: usize) {
        let data = self.data_mut();
        let crc = crc32(&data[header_offset + 6..header_offset + 7 + payload_len]);
        encode_fixed32(&mut data[header_offset..], crc);
    }

    // --------------------------------------------------------------------------------------------
    // Initial-offset fixture
    // --------------------------------------------------------------------------------------------

    pub fn write_initial_offset_log(&mut self) {
        for (i, &size) in INITIAL_OFFSET_RECORD_SIZES.iter().enumerate() {
            let fill = char::from(b'a' + i as u8).to_string();
            let record = big_string(&fill, size);
            self.write(&record);
        }
    }

    /// Opens at `initial_offset` and asserts that exactly the fixture
    /// records from `expected_record_index` on are returned, each with
    /// its true physical offset.
    pub fn check_initial_offset_record(
        &mut self,
        initial_offset: u64,
        expected_record_index: usize,
    ) {
        self.write_initial_offset_log();
        self.reopen_reader(initial_offset);

        let expected_offsets = initial_offset_record_offsets();
        assert!(expected_record_index < INITIAL_OFFSET_RECORD_SIZES.len());

        let mut record = Vec::new();
        for i in expected_record_index..INITIAL_OFFSET_RECORD_SIZES.len() {
            let reader = self.reader.as_mut().unwrap();
            assert!(reader.read_record(&mut record), "record {i} missing");
            assert_eq!(record.len(), INITIAL_OFFSET_RECORD_SIZES[i]);
            assert_eq!(reader.last_record_offset(), expected_offsets[i]);
            assert_eq!(record[0], b'a' + i as u8);
        }
    }

    pub fn check_offset_past_end_returns_no_records(&mut self, offset_past_end: u64) {
        self.write_initial_offset_log();
        let written = self.written_bytes() as u64;
        self.reopen_reader(written + offset_past_end);
        let mut record = Vec::new();
        assert!(!self.reader.as_mut().unwrap().read_record(&mut record));
    }

    fn close_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            self.written = Some(writer.into_inner());
        }
    }

    fn data_mut(&mut self) -> &mut Vec<u8> {
        self.close_writer();
        self.written.as_mut().unwrap()
    }
}
