// Row codec: one logged mutation and its bit-exact on-disk frames.
//
// v11 frame (little-endian), preceded in its segment by the class marker:
//   header_crc32c u32 | lsn i64 | tm f64 | len u32 | data_crc32c u32 | payload
// The header crc covers the 24 header bytes after header_crc32c.
//
// Legacy v04 frame (read-only):
//   lsn i64 | type u16 | len u32 | data | crc32 u32 over header+data

use std::io::{self, Read};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use super::class::Codec;

/// Size of the v11 row header: header_crc32c, lsn, tm, len, data_crc32c.
pub const ROW_V11_HEADER_SIZE: usize = 28;
const ROW_V04_HEADER_SIZE: usize = 14;
/// Legacy rows longer than this are assumed damaged.
const ROW_V04_MAX_LEN: u32 = 1 << 20;
/// Tag prepended to legacy rows when they are normalized into v11 shape.
pub const DEFAULT_TAG: u16 = 0;

/// One logged mutation. The payload is opaque to this subsystem; by
/// convention its first field is a small tag consumed upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Unique, monotone log sequence number; 0 in snapshot rows.
    pub lsn: i64,
    /// Wall-clock seconds at write time. Informational only.
    pub tm: f64,
    pub payload: Bytes,
}

impl Row {
    pub fn new(lsn: i64, payload: Bytes) -> Self {
        Self {
            lsn,
            tm: wall_clock(),
            payload,
        }
    }

    /// Leading tag of the payload, if the payload is long enough to
    /// carry one.
    pub fn tag(&self) -> Option<u16> {
        self.payload
            .get(0..2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Frame the row for disk: 28-byte v11 header followed by the
    /// payload. The per-row marker is emitted by the segment writer,
    /// not here.
    pub fn encode_v11(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ROW_V11_HEADER_SIZE + self.payload.len());
        frame.extend_from_slice(&[0u8; 4]);
        frame.extend_from_slice(&self.lsn.to_le_bytes());
        frame.extend_from_slice(&self.tm.to_le_bytes());
        frame.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c::crc32c(&self.payload).to_le_bytes());
        let header_crc = crc32c::crc32c(&frame[4..ROW_V11_HEADER_SIZE]);
        frame[0..4].copy_from_slice(&header_crc.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Seconds since the epoch as the informational `tm` stamp.
pub(crate) fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Outcome of pulling one frame out of a byte stream.
#[derive(Debug)]
pub(crate) enum Frame {
    Row(Row),
    /// Clean end: exact EOF at a frame boundary.
    Eof,
    /// CRC mismatch, implausible length, or a short read inside a frame.
    Corrupt(&'static str),
}

/// Decode one frame according to the class codec. The marker has
/// already been consumed by the caller.
pub(crate) fn read_row(codec: Codec, f: &mut impl Read) -> io::Result<Frame> {
    match codec {
        Codec::V11 => read_row_v11(f),
        Codec::V04 => read_row_v04(f),
    }
}

fn read_row_v11(f: &mut impl Read) -> io::Result<Frame> {
    let mut header = [0u8; ROW_V11_HEADER_SIZE];
    match read_exact_or_eof(f, &mut header)? {
        Fill::Eof => return Ok(Frame::Eof),
        Fill::Short => return Ok(Frame::Corrupt("short read in row header")),
        Fill::Full => {}
    }

    let header_crc = get_u32(&header[0..4]);
    if crc32c::crc32c(&header[4..]) != header_crc {
        return Ok(Frame::Corrupt("header crc32c mismatch"));
    }

    let lsn = get_i64(&header[4..12]);
    let tm = get_f64(&header[12..20]);
    let len = get_u32(&header[20..24]) as usize;
    let data_crc = get_u32(&header[24..28]);

    let mut payload = vec![0u8; len];
    match read_exact_or_eof(f, &mut payload)? {
        Fill::Full => {}
        _ => return Ok(Frame::Corrupt("short read in row payload")),
    }
    if crc32c::crc32c(&payload) != data_crc {
        return Ok(Frame::Corrupt("data crc32c mismatch"));
    }

    Ok(Frame::Row(Row {
        lsn,
        tm,
        payload: Bytes::from(payload),
    }))
}

fn read_row_v04(f: &mut impl Read) -> io::Result<Frame> {
    let mut header = [0u8; ROW_V04_HEADER_SIZE];
    match read_exact_or_eof(f, &mut header)? {
        Fill::Eof => return Ok(Frame::Eof),
        Fill::Short => return Ok(Frame::Corrupt("short read in row header")),
        Fill::Full => {}
    }

    let lsn = get_i64(&header[0..8]);
    let row_type = get_u16(&header[8..10]);
    let len = get_u32(&header[10..14]);

    // bogus lengths would send the reader far off into the file
    if len > ROW_V04_MAX_LEN {
        return Ok(Frame::Corrupt("record too long, probably damaged"));
    }

    let mut data = vec![0u8; len as usize];
    match read_exact_or_eof(f, &mut data)? {
        Fill::Full => {}
        _ => return Ok(Frame::Corrupt("short read in row payload")),
    }

    let mut crc_bytes = [0u8; 4];
    match read_exact_or_eof(f, &mut crc_bytes)? {
        Fill::Full => {}
        _ => return Ok(Frame::Corrupt("short read in row crc")),
    }
    let crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&data);
    if hasher.finalize() != crc {
        return Ok(Frame::Corrupt("crc32 mismatch"));
    }

    // normalize into v11 shape: payload = default tag ++ type ++ data
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.extend_from_slice(&DEFAULT_TAG.to_le_bytes());
    payload.extend_from_slice(&row_type.to_le_bytes());
    payload.extend_from_slice(&data);

    Ok(Frame::Row(Row {
        lsn,
        tm: 0.0,
        payload: Bytes::from(payload),
    }))
}

pub(crate) enum Fill {
    Full,
    /// Zero bytes were available.
    Eof,
    /// The stream ended partway through the buffer.
    Short,
}

pub(crate) fn read_exact_or_eof(f: &mut impl Read, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 { Fill::Eof } else { Fill::Short });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fill::Full)
}

fn get_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn get_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn get_i64(b: &[u8]) -> i64 {
    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn get_f64(b: &[u8]) -> f64 {
    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
