// Trace file header layout, the per-session writer, and a validating reader.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing::{debug, error, warn};

use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::process_info::ProcessInfo;
use crate::core::segment::{
    self, SEGMENT_PREAMBLE_LEN, SegmentHeader, align_up, read_u16, read_u32,
    read_u64, write_u16, write_u32, write_u64,
};

pub const TRACE_FILE_MAGIC: [u8; 4] = *b"CTRC";
pub const TRACE_FILE_VERSION_MAJOR: u16 = 1;
pub const TRACE_FILE_VERSION_MINOR: u16 = 0;
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
const FIXED_HEADER_LEN: usize = 56;
const MAX_BLOCK_SIZE: usize = 1024 * 1024;
const STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TraceFileHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub block_size: u32,
    pub header_size: u32,
    pub timestamp_ns: u64,
    pub process: ProcessInfo,
}

impl TraceFileHeader {
    pub fn new(process: ProcessInfo, block_size: usize) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        let mut header = Self {
            version_major: TRACE_FILE_VERSION_MAJOR,
            version_minor: TRACE_FILE_VERSION_MINOR,
            block_size: block_size as u32,
            header_size: 0,
            timestamp_ns,
            process,
        };
        header.header_size = header.unpadded_len() as u32;
        header
    }

    fn unpadded_len(&self) -> usize {
        FIXED_HEADER_LEN
            + 4
            + self.process.executable_path.as_os_str().len()
            + 4
            + self.process.command_line.len()
            + 4
            + self.process.environment.len()
    }

    /// Encodes the header padded with zeros to a whole number of blocks.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        use std::os::unix::ffi::OsStrExt;

        let block_size = self.block_size as usize;
        let padded = align_up(self.unpadded_len(), block_size)
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("header too large"))?;
        let mut buf = vec![0u8; padded];
        buf[0..4].copy_from_slice(&TRACE_FILE_MAGIC);
        write_u16(&mut buf, 4, self.version_major);
        write_u16(&mut buf, 6, self.version_minor);
        write_u32(&mut buf, 8, self.block_size);
        write_u32(&mut buf, 12, self.header_size);
        write_u64(&mut buf, 16, self.timestamp_ns);
        write_u32(&mut buf, 24, self.process.process_id);
        write_u64(&mut buf, 32, self.process.exe_base_address);
        write_u64(&mut buf, 40, self.process.exe_image_size);
        write_u32(&mut buf, 48, self.process.exe_checksum);
        write_u32(&mut buf, 52, self.process.exe_time_date_stamp);

        let mut offset = FIXED_HEADER_LEN;
        for blob in [
            self.process.executable_path.as_os_str().as_bytes(),
            self.process.command_line.as_bytes(),
            self.process.environment.as_slice(),
        ] {
            write_u32(&mut buf, offset, blob.len() as u32);
            offset += 4;
            buf[offset..offset + blob.len()].copy_from_slice(blob);
            offset += blob.len();
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        use std::os::unix::ffi::OsStrExt;

        if buf.len() < FIXED_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != TRACE_FILE_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version_major = read_u16(buf, 4);
        if version_major != TRACE_FILE_VERSION_MAJOR {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported version"));
        }
        let block_size = read_u32(buf, 8);
        if !(block_size as usize).is_power_of_two() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid block size"));
        }
        let header_size = read_u32(buf, 12);
        if (header_size as usize) > buf.len() || (header_size as usize) < FIXED_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid header size"));
        }

        let mut blobs: Vec<&[u8]> = Vec::with_capacity(3);
        let mut offset = FIXED_HEADER_LEN;
        let end = header_size as usize;
        for _ in 0..3 {
            if offset + 4 > end {
                return Err(Error::new(ErrorKind::Corrupt).with_message("truncated header blob"));
            }
            let len = read_u32(buf, offset) as usize;
            offset += 4;
            if offset + len > end {
                return Err(Error::new(ErrorKind::Corrupt).with_message("header blob overflow"));
            }
            blobs.push(&buf[offset..offset + len]);
            offset += len;
        }

        Ok(Self {
            version_major,
            version_minor: read_u16(buf, 6),
            block_size,
            header_size,
            timestamp_ns: read_u64(buf, 16),
            process: ProcessInfo {
                process_id: read_u32(buf, 24),
                executable_path: PathBuf::from(std::ffi::OsStr::from_bytes(blobs[0])),
                command_line: String::from_utf8_lossy(blobs[1]).to_string(),
                environment: blobs[2].to_vec(),
                exe_base_address: read_u64(buf, 32),
                exe_image_size: read_u64(buf, 40),
                exe_checksum: read_u32(buf, 48),
                exe_time_date_stamp: read_u32(buf, 52),
            },
        })
    }

    /// Length of the header on disk, including block padding.
    pub fn padded_len(&self) -> usize {
        align_up(self.header_size as usize, self.block_size as usize).unwrap_or(usize::MAX)
    }
}

/// Picks the write granularity for files created under `dir`.
pub fn block_size_for(dir: &Path) -> Result<usize, Error> {
    let granularity = fs2::allocation_granularity(dir).map_err(|err| {
        Error::new(io_error_kind(&err))
            .with_message("failed to query block size")
            .with_path(dir)
            .with_source(err)
    })? as usize;
    if granularity == 0 || !granularity.is_power_of_two() || granularity > MAX_BLOCK_SIZE {
        warn!(
            granularity,
            fallback = DEFAULT_BLOCK_SIZE,
            "unusable allocation granularity"
        );
        return Ok(DEFAULT_BLOCK_SIZE);
    }
    Ok(granularity)
}

/// Creates a fresh, uniquely named trace file for `process` under `dir`.
pub fn create_unique(dir: &Path, process: &ProcessInfo) -> Result<(PathBuf, File), Error> {
    let stamp = OffsetDateTime::now_utc()
        .format(STAMP_FORMAT)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to format timestamp")
                .with_source(err)
        })?;
    let stem = format!(
        "trace-{}-{}-{stamp}",
        process.executable_name(),
        process.process_id
    );
    for attempt in 0u32.. {
        let name = if attempt == 0 {
            format!("{stem}.bin")
        } else {
            format!("{stem}-{attempt}.bin")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(Error::new(io_error_kind(&err))
                    .with_message("failed to create trace file")
                    .with_path(&path)
                    .with_source(err));
            }
        }
    }
    Err(Error::new(ErrorKind::Resource).with_message("no unique trace file name available"))
}

/// Owns one on-disk trace file. Only the writer thread appends to it.
///
/// Every append claims its block-aligned span up front, so a failed write leaves a
/// zeroed hole and later segments stay aligned.
#[derive(Debug)]
pub struct TraceFileWriter {
    path: PathBuf,
    file: File,
    block_size: usize,
    next_offset: AtomicU64,
}

impl TraceFileWriter {
    pub fn open(dir: &Path, process: &ProcessInfo, block_size: usize) -> Result<Self, Error> {
        let (path, file) = create_unique(dir, process)?;
        Self::with_file(path, file, process, block_size)
    }

    pub fn create(path: &Path, process: &ProcessInfo, block_size: usize) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| {
                Error::new(io_error_kind(&err))
                    .with_message("failed to create trace file")
                    .with_path(path)
                    .with_source(err)
            })?;
        Self::with_file(path.to_path_buf(), file, process, block_size)
    }

    fn with_file(
        path: PathBuf,
        file: File,
        process: &ProcessInfo,
        block_size: usize,
    ) -> Result<Self, Error> {
        if !block_size.is_power_of_two() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("block size must be a power of two")
                .with_path(&path));
        }
        let header = TraceFileHeader::new(process.clone(), block_size).encode()?;
        file.write_all_at(&header, 0).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to write trace file header")
                .with_path(&path)
                .with_source(err)
        })?;
        debug!(path = %path.display(), block_size, "opened trace file");
        Ok(Self {
            path,
            file,
            block_size,
            next_offset: AtomicU64::new(header.len() as u64),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Appends `bytes`, whose length must be a whole number of blocks.
    pub fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() % self.block_size != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("write is not block aligned")
                .with_path(&self.path));
        }
        let offset = self
            .next_offset
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.file.write_all_at(bytes, offset).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message(format!("failed to write segment at offset {offset}"))
                .with_path(&self.path)
                .with_source(err)
        })
    }

    /// File offset the next segment lands at.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Relaxed)
    }

    pub fn close(self) -> Result<(), Error> {
        self.file.sync_all().map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to flush trace file")
                .with_path(&self.path)
                .with_source(err)
        })
    }

    /// Closes the file, logging instead of returning failures.
    pub fn close_logged(self) {
        let path = self.path.clone();
        match self.close() {
            Ok(()) => debug!(path = %path.display(), "closed trace file"),
            Err(err) => error!(path = %path.display(), error = %err, "trace file close failed"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentRecord {
    pub offset: u64,
    pub thread_id: u32,
    pub payload: Vec<u8>,
}

/// Reads back a trace file: header first, then one segment per block-aligned step.
pub struct TraceFileReader {
    path: PathBuf,
    file: File,
    header: TraceFileHeader,
    next_offset: u64,
    file_len: u64,
}

impl TraceFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let io_fail = |message: &str, err: io::Error| {
            Error::new(io_error_kind(&err))
                .with_message(message.to_string())
                .with_path(&path)
                .with_source(err)
        };
        let mut file = File::open(&path).map_err(|err| io_fail("failed to open trace file", err))?;
        let file_len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| io_fail("failed to stat trace file", err))?;

        let mut fixed = [0u8; FIXED_HEADER_LEN];
        file.read_exact(&mut fixed)
            .map_err(|err| io_fail("failed to read trace file header", err))?;
        let header_size = read_u32(&fixed, 12) as usize;
        if header_size < FIXED_HEADER_LEN || header_size as u64 > file_len {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("invalid header size")
                .with_path(&path));
        }
        let mut raw = vec![0u8; header_size];
        file.seek(SeekFrom::Start(0))
            .map_err(|err| io_fail("failed to seek trace file", err))?;
        file.read_exact(&mut raw)
            .map_err(|err| io_fail("failed to read trace file header", err))?;
        let header = TraceFileHeader::decode(&raw).map_err(|err| err.with_path(&path))?;
        let next_offset = header.padded_len() as u64;

        Ok(Self {
            path,
            file,
            header,
            next_offset,
            file_len,
        })
    }

    pub fn header(&self) -> &TraceFileHeader {
        &self.header
    }

    /// Returns the next segment, stepping over zeroed blocks left by failed writes.
    pub fn next_segment(&mut self) -> Result<Option<SegmentRecord>, Error> {
        let (offset, preamble) = loop {
            if self.next_offset >= self.file_len {
                return Ok(None);
            }
            let offset = self.next_offset;
            let mut preamble = [0u8; SEGMENT_PREAMBLE_LEN];
            self.read_at(offset, &mut preamble)?;
            if preamble.iter().any(|byte| *byte != 0) {
                break (offset, preamble);
            }
            self.next_offset = offset + self.header.block_size as u64;
        };
        let header: SegmentHeader =
            segment::parse_segment(&preamble).map_err(|err| err.with_path(&self.path))?;
        let mut payload = vec![0u8; header.segment_length as usize];
        self.read_at(offset + SEGMENT_PREAMBLE_LEN as u64, &mut payload)?;

        let span = align_up(
            SEGMENT_PREAMBLE_LEN + header.segment_length as usize,
            self.header.block_size as usize,
        )
        .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("segment length overflow"))?;
        self.next_offset = offset + span as u64;

        Ok(Some(SegmentRecord {
            offset,
            thread_id: header.thread_id,
            payload,
        }))
    }

    pub fn segments(mut self) -> Result<Vec<SegmentRecord>, Error> {
        let mut out = Vec::new();
        while let Some(segment) = self.next_segment()? {
            out.push(segment);
        }
        Ok(out)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|err| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("truncated segment")
                    .with_path(&self.path)
                    .with_source(err)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::segment::SegmentWriter;

    fn sample_process() -> ProcessInfo {
        ProcessInfo {
            process_id: 4242,
            executable_path: PathBuf::from("/opt/app/bin/worker"),
            command_line: "worker --threads 4".to_string(),
            environment: b"HOME=/root\0LANG=C\0\0".to_vec(),
            exe_base_address: 0x5555_0000_0000,
            exe_image_size: 0x20_000,
            exe_checksum: 0xDEAD_BEEF,
            exe_time_date_stamp: 1_700_000_000,
        }
    }

    fn segment_bytes(block_size: usize, thread_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut writer = SegmentWriter::begin(&mut buf, thread_id).expect("begin");
        writer.append_raw(payload).expect("append");
        let len = align_up(SEGMENT_PREAMBLE_LEN + payload.len(), block_size).expect("align");
        buf.truncate(len);
        buf
    }

    #[test]
    fn header_is_padded_and_decodes() {
        let header = TraceFileHeader::new(sample_process(), 512);
        let bytes = header.encode().expect("encode");
        assert_eq!(bytes.len() % 512, 0);
        assert_eq!(bytes.len(), header.padded_len());
        let decoded = TraceFileHeader::decode(&bytes).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = TraceFileHeader::new(sample_process(), 512)
            .encode()
            .expect("encode");
        bytes[0..4].copy_from_slice(b"NOPE");
        let err = TraceFileHeader::decode(&bytes).expect_err("bad magic");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn open_names_files_uniquely() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = TraceFileWriter::open(dir.path(), &sample_process(), 512).expect("first");
        let second = TraceFileWriter::open(dir.path(), &sample_process(), 512).expect("second");
        assert_ne!(first.path(), second.path());
        let name = first.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("trace-worker-4242-"));
        assert!(name.ends_with(".bin"));
    }

    #[test]
    fn written_segments_read_back_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.bin");
        let writer = TraceFileWriter::create(&path, &sample_process(), 512).expect("create");
        writer.write(&segment_bytes(512, 1, &[1u8; 1000])).expect("write a");
        writer.write(&segment_bytes(512, 2, b"second")).expect("write b");
        writer.close().expect("close");

        let reader = TraceFileReader::open(&path).expect("open");
        assert_eq!(reader.header().process, sample_process());
        assert_eq!(reader.header().block_size, 512);
        let segments = reader.segments().expect("segments");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].thread_id, 1);
        assert_eq!(segments[0].payload, vec![1u8; 1000]);
        assert_eq!(segments[1].thread_id, 2);
        assert_eq!(segments[1].payload, b"second");
        assert_eq!(segments[1].offset - segments[0].offset, 1024);
    }

    #[test]
    fn failed_write_leaves_an_aligned_hole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.bin");
        let mut writer = TraceFileWriter::create(&path, &sample_process(), 512).expect("create");
        let start = writer.next_offset();

        writer.file = File::open(&path).expect("read-only handle");
        let err = writer
            .write(&segment_bytes(512, 1, &[1u8; 1000]))
            .expect_err("read-only write");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(writer.next_offset(), start + 1024);

        writer.file = OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("writable handle");
        writer.write(&segment_bytes(512, 2, b"after the gap")).expect("write");
        writer.close().expect("close");

        let segments = TraceFileReader::open(&path)
            .expect("open")
            .segments()
            .expect("segments");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].offset, start + 1024);
        assert_eq!(segments[0].offset % 512, 0);
        assert_eq!(segments[0].thread_id, 2);
        assert_eq!(segments[0].payload, b"after the gap");
    }

    #[test]
    fn unaligned_write_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.bin");
        let writer = TraceFileWriter::create(&path, &sample_process(), 512).expect("create");
        let err = writer.write(&[0u8; 100]).expect_err("unaligned");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn block_size_is_a_power_of_two() {
        let dir = tempfile::tempdir().expect("tempdir");
        let block_size = block_size_for(dir.path()).expect("block size");
        assert!(block_size.is_power_of_two());
    }
}
