// Segment framing: record prefix, segment header, block alignment, and the in-buffer record writer.
use crate::core::error::{Error, ErrorKind};

pub const RECORD_PREFIX_LEN: usize = 12;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const SEGMENT_PREAMBLE_LEN: usize = RECORD_PREFIX_LEN + SEGMENT_HEADER_LEN;
pub const TRACE_VERSION_HI: u8 = 1;
pub const TRACE_VERSION_LO: u8 = 0;
pub const MAX_RECORD_BODY: usize = u16::MAX as usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum RecordType {
    SegmentHeader = 0x0001,
    ProcessAttach = 10,
    ProcessDetach = 11,
    ThreadAttach = 12,
    ThreadDetach = 13,
    ModuleEvent = 14,
    FunctionEntry = 15,
    FunctionExit = 16,
    BatchEnter = 17,
    ThreadName = 18,
    Comment = 19,
}

impl RecordType {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(RecordType::SegmentHeader),
            10 => Some(RecordType::ProcessAttach),
            11 => Some(RecordType::ProcessDetach),
            12 => Some(RecordType::ThreadAttach),
            13 => Some(RecordType::ThreadDetach),
            14 => Some(RecordType::ModuleEvent),
            15 => Some(RecordType::FunctionEntry),
            16 => Some(RecordType::FunctionExit),
            17 => Some(RecordType::BatchEnter),
            18 => Some(RecordType::ThreadName),
            19 => Some(RecordType::Comment),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordPrefix {
    pub timestamp: u32,
    pub size: u16,
    pub type_id: u16,
    pub version_hi: u8,
    pub version_lo: u8,
}

impl RecordPrefix {
    pub fn new(type_id: u16, size: u16, timestamp: u32) -> Self {
        Self {
            timestamp,
            size,
            type_id,
            version_hi: TRACE_VERSION_HI,
            version_lo: TRACE_VERSION_LO,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_PREFIX_LEN] {
        let mut buf = [0u8; RECORD_PREFIX_LEN];
        write_u32(&mut buf, 0, self.timestamp);
        write_u16(&mut buf, 4, self.size);
        write_u16(&mut buf, 6, self.type_id);
        buf[8] = self.version_hi;
        buf[9] = self.version_lo;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < RECORD_PREFIX_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record prefix too small"));
        }
        Ok(Self {
            timestamp: read_u32(buf, 0),
            size: read_u16(buf, 4),
            type_id: read_u16(buf, 6),
            version_hi: buf[8],
            version_lo: buf[9],
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegmentHeader {
    pub thread_id: u32,
    pub segment_length: u32,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        write_u32(&mut buf, 0, self.thread_id);
        write_u32(&mut buf, 4, self.segment_length);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < SEGMENT_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("segment header too small"));
        }
        Ok(Self {
            thread_id: read_u32(buf, 0),
            segment_length: read_u32(buf, 4),
        })
    }
}

/// Rounds `value` up to a multiple of `alignment`, which must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|rounded| rounded & !(alignment - 1))
}

/// Decodes and validates the preamble at the start of a committed buffer.
pub fn parse_segment(buf: &[u8]) -> Result<SegmentHeader, Error> {
    if buf.len() < SEGMENT_PREAMBLE_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("buffer smaller than preamble"));
    }
    let prefix = RecordPrefix::decode(buf)?;
    if prefix.type_id != RecordType::SegmentHeader.id() {
        return Err(Error::new(ErrorKind::Corrupt).with_message("unexpected record type"));
    }
    if prefix.size as usize != SEGMENT_HEADER_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("unexpected segment header size"));
    }
    if prefix.version_hi != TRACE_VERSION_HI || prefix.version_lo != TRACE_VERSION_LO {
        return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported segment version"));
    }
    SegmentHeader::decode(&buf[RECORD_PREFIX_LEN..])
}

/// Bytes the writer flushes for `header`: preamble plus payload, rounded up to the block size.
pub fn segment_write_len(
    header: &SegmentHeader,
    block_size: usize,
    buffer_size: usize,
) -> Result<usize, Error> {
    let len = align_up(
        SEGMENT_PREAMBLE_LEN + header.segment_length as usize,
        block_size,
    )
    .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("segment length overflow"))?;
    if len > buffer_size {
        return Err(Error::new(ErrorKind::Corrupt).with_message("segment exceeds buffer"));
    }
    Ok(len)
}

/// Fills a client buffer with one segment, keeping `segment_length` current after every append.
pub struct SegmentWriter<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl<'a> SegmentWriter<'a> {
    pub fn begin(buf: &'a mut [u8], thread_id: u32) -> Result<Self, Error> {
        if buf.len() < SEGMENT_PREAMBLE_LEN {
            return Err(Error::new(ErrorKind::Usage).with_message("buffer smaller than preamble"));
        }
        let prefix = RecordPrefix::new(
            RecordType::SegmentHeader.id(),
            SEGMENT_HEADER_LEN as u16,
            0,
        );
        buf[..RECORD_PREFIX_LEN].copy_from_slice(&prefix.encode());
        let mut writer = Self { buf, used: 0 };
        writer.store_header(thread_id);
        Ok(writer)
    }

    pub fn segment_length(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - SEGMENT_PREAMBLE_LEN - self.used
    }

    /// Appends one record (prefix + body).
    pub fn append(&mut self, type_id: u16, timestamp: u32, body: &[u8]) -> Result<(), Error> {
        if body.len() > MAX_RECORD_BODY {
            return Err(Error::new(ErrorKind::Usage).with_message("record body too large"));
        }
        if RECORD_PREFIX_LEN + body.len() > self.remaining() {
            return Err(Error::new(ErrorKind::Resource).with_message("segment buffer full"));
        }
        let prefix = RecordPrefix::new(type_id, body.len() as u16, timestamp);
        let start = SEGMENT_PREAMBLE_LEN + self.used;
        self.buf[start..start + RECORD_PREFIX_LEN].copy_from_slice(&prefix.encode());
        let body_start = start + RECORD_PREFIX_LEN;
        self.buf[body_start..body_start + body.len()].copy_from_slice(body);
        self.used += RECORD_PREFIX_LEN + body.len();
        self.store_header(self.thread_id());
        Ok(())
    }

    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.remaining() {
            return Err(Error::new(ErrorKind::Resource).with_message("segment buffer full"));
        }
        let start = SEGMENT_PREAMBLE_LEN + self.used;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        self.store_header(self.thread_id());
        Ok(())
    }

    fn thread_id(&self) -> u32 {
        read_u32(self.buf, RECORD_PREFIX_LEN)
    }

    fn store_header(&mut self, thread_id: u32) {
        let header = SegmentHeader {
            thread_id,
            segment_length: self.used as u32,
        };
        self.buf[RECORD_PREFIX_LEN..SEGMENT_PREAMBLE_LEN].copy_from_slice(&header.encode());
    }
}

/// Iterates the records of a segment payload.
pub fn records(payload: &[u8]) -> Records<'_> {
    Records { payload, offset: 0 }
}

pub struct Records<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(RecordPrefix, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let rest = &self.payload[self.offset..];
        let prefix = match RecordPrefix::decode(rest) {
            Ok(prefix) => prefix,
            Err(err) => {
                self.offset = self.payload.len();
                return Some(Err(err));
            }
        };
        let end = RECORD_PREFIX_LEN + prefix.size as usize;
        if end > rest.len() {
            self.offset = self.payload.len();
            return Some(Err(
                Error::new(ErrorKind::Corrupt).with_message("record exceeds segment")
            ));
        }
        self.offset += end;
        Some(Ok((prefix, &rest[RECORD_PREFIX_LEN..end])))
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut out = [0u8; 2];
    out.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(out)
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_with_payload(buffer_size: usize, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; buffer_size];
        let mut writer = SegmentWriter::begin(&mut buf, 77).expect("begin");
        writer.append_raw(payload).expect("append");
        buf
    }

    #[test]
    fn align_up_rounds_to_block() {
        assert_eq!(align_up(0, 512), Some(0));
        assert_eq!(align_up(1, 512), Some(512));
        assert_eq!(align_up(512, 512), Some(512));
        assert_eq!(align_up(1020, 4096), Some(4096));
        assert_eq!(align_up(usize::MAX, 4096), None);
    }

    #[test]
    fn valid_segment_parses() {
        let buf = segment_with_payload(4096, &[0xAB; 1000]);
        let header = parse_segment(&buf).expect("parse");
        assert_eq!(header.thread_id, 77);
        assert_eq!(header.segment_length, 1000);
        assert_eq!(segment_write_len(&header, 512, 4096).expect("len"), 1024);
    }

    #[test]
    fn corrupt_type_tag_is_rejected() {
        let mut buf = segment_with_payload(4096, &[1; 16]);
        write_u16(&mut buf, 6, 0xBEEF);
        let err = parse_segment(&buf).expect_err("bad tag");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn wrong_size_and_version_are_rejected() {
        let mut buf = segment_with_payload(4096, &[1; 16]);
        write_u16(&mut buf, 4, 12);
        assert!(parse_segment(&buf).is_err());

        let mut buf = segment_with_payload(4096, &[1; 16]);
        buf[8] = TRACE_VERSION_HI + 1;
        assert!(parse_segment(&buf).is_err());
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let header = SegmentHeader {
            thread_id: 1,
            segment_length: 4096,
        };
        let err = segment_write_len(&header, 512, 4096).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn writer_appends_records_and_tracks_length() {
        let mut buf = vec![0u8; 256];
        let mut writer = SegmentWriter::begin(&mut buf, 5).expect("begin");
        writer
            .append(RecordType::FunctionEntry.id(), 10, b"main")
            .expect("entry");
        writer
            .append(RecordType::FunctionExit.id(), 11, b"")
            .expect("exit");
        let used = writer.segment_length();
        assert_eq!(used, 2 * RECORD_PREFIX_LEN + 4);

        let header = parse_segment(&buf).expect("parse");
        assert_eq!(header.segment_length as usize, used);
        let payload = &buf[SEGMENT_PREAMBLE_LEN..SEGMENT_PREAMBLE_LEN + used];
        let decoded: Vec<_> = records(payload).map(|r| r.expect("record")).collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0.type_id, RecordType::FunctionEntry.id());
        assert_eq!(decoded[0].1, b"main");
        assert_eq!(decoded[1].0.timestamp, 11);
    }

    #[test]
    fn writer_refuses_to_overflow_buffer() {
        let mut buf = vec![0u8; SEGMENT_PREAMBLE_LEN + 16];
        let mut writer = SegmentWriter::begin(&mut buf, 1).expect("begin");
        let err = writer
            .append(RecordType::Comment.id(), 0, &[0u8; 8])
            .expect_err("full");
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(writer.segment_length(), 0);
    }
}
