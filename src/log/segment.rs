// Segment files: a handle over one physical log file (snapshot or
// xlog), its role, and a scanning iterator with recovery-friendly
// behavior: resync past garbage, detect clean close, and always leave
// the file at the last good offset so a concurrent append is observed
// on the next scan.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::{Result, WalError};
use super::class::{ClassFamily, NameSuffix, SegmentClass, VERSION_V11};
use super::row::{self, Fill, Frame, Row};

/// A segment opened for reading.
pub struct Segment {
    class: SegmentClass,
    path: PathBuf,
    f: BufReader<File>,
    /// Rows yielded across all scans of this handle.
    rows: u64,
    /// Reread attempts while a newer segment exists; recovery owns this.
    pub(crate) retry: u32,
    /// Whether the latest scan ended at a clean close.
    eof: bool,
}

impl Segment {
    /// Open the segment named by `lsn` in the family directory. The
    /// concrete class is selected by matching the version header line
    /// against the family.
    pub fn open(family: &ClassFamily, lsn: i64, name: NameSuffix) -> Result<Self> {
        let path = family.preferred().format_filename(lsn, name);
        Self::open_path(family, &path)
    }

    /// Open an explicitly named file; used by debug reading.
    pub fn open_path(family: &ClassFamily, path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut f = BufReader::new(file);

        let filetype = read_header_line(&mut f)?;
        if filetype != family.filetype() {
            return Err(WalError::Header(format!(
                "unknown filetype `{}` in `{}`",
                filetype.trim_end(),
                path.display()
            )));
        }

        let version = read_header_line(&mut f)?;
        let class = family.match_version(&version).ok_or_else(|| {
            WalError::Header(format!(
                "unknown version `{}` in `{}`",
                version.trim_end(),
                path.display()
            ))
        })?;

        if class.version == VERSION_V11 {
            // free-form header lines run until a single blank line
            loop {
                let line = read_header_line(&mut f)?;
                if line == "\n" || line == "\r\n" {
                    break;
                }
            }
        } else {
            // pre-v11 headers carry exactly one free-form line
            read_header_line(&mut f)?;
        }

        Ok(Self {
            class: class.clone(),
            path: path.to_path_buf(),
            f,
            rows: 0,
            retry: 0,
            eof: false,
        })
    }

    /// Start (or resume) scanning from the current position. The
    /// scanner leaves the file at the last good offset when it ends,
    /// so calling `scan` again picks up rows appended in between.
    pub fn scan(&mut self) -> Result<Scanner<'_>> {
        let good_offset = self.f.stream_position()?;
        Ok(Scanner {
            seg: self,
            good_offset,
            row_count: 0,
            done: false,
        })
    }

    /// Whether the latest completed scan ended at the class eof marker
    /// (or, for classes without one, at exact end of data).
    pub fn cleanly_closed(&self) -> bool {
        self.eof
    }

    /// Rows yielded by this handle across all scans.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_header_line(f: &mut BufReader<File>) -> Result<String> {
    let mut line = String::new();
    if f.read_line(&mut line)? == 0 {
        return Err(WalError::Header("header reading failed".into()));
    }
    Ok(line)
}

/// Pull-based record iterator over an open segment.
pub struct Scanner<'a> {
    seg: &'a mut Segment,
    good_offset: u64,
    row_count: u64,
    done: bool,
}

impl Scanner<'_> {
    /// Next row, end-of-scan, or a fatal error. Corrupt rows are
    /// skipped by scanning forward one byte at a time for the next
    /// marker, unless the class demands strictness.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }

        let marker_size = self.seg.class.marker_size;
        let mask = self.seg.class.marker_mask();

        loop {
            // hunt for the class marker
            let mut buf = [0u8; 8];
            match row::read_exact_or_eof(&mut self.seg.f, &mut buf[..marker_size])? {
                Fill::Full => {}
                _ => return self.finish(),
            }
            let mut word = u64::from_le_bytes(buf);

            while word & mask != self.seg.class.marker {
                let mut byte = [0u8; 1];
                match row::read_exact_or_eof(&mut self.seg.f, &mut byte)? {
                    Fill::Full => {}
                    _ => return self.finish(),
                }
                word >>= 8;
                word |= (byte[0] as u64) << ((marker_size - 1) * 8);
                word &= mask;
            }

            let marker_offset = self.seg.f.stream_position()? - marker_size as u64;
            if marker_offset > self.good_offset {
                warn!(
                    "skipped {} bytes after offset {} in `{}`",
                    marker_offset - self.good_offset,
                    self.good_offset,
                    self.seg.path.display()
                );
            }

            match row::read_row(self.seg.class.codec, &mut self.seg.f)? {
                Frame::Row(row) => {
                    self.good_offset = self.seg.f.stream_position()?;
                    self.row_count += 1;
                    if self.row_count % 100_000 == 0 {
                        info!("{:.1}M rows processed", self.row_count as f64 / 1_000_000.0);
                    }
                    return Ok(Some(row));
                }
                Frame::Eof => return self.finish(),
                Frame::Corrupt(why) => {
                    if self.seg.class.panic_if_error {
                        self.done = true;
                        return Err(WalError::Corruption(format!(
                            "{} in `{}`",
                            why,
                            self.seg.path.display()
                        )));
                    }
                    warn!(
                        "failed to read row in `{}`: {}; resyncing",
                        self.seg.path.display(),
                        why
                    );
                    self.seg.f.seek(SeekFrom::Start(marker_offset + 1))?;
                }
            }
        }
    }

    /// End of data: decide whether the segment closed cleanly, then
    /// seek back to the last good offset so the next scan (or an
    /// appender checking its own tail) starts from known-good bytes.
    fn finish(&mut self) -> Result<Option<Row>> {
        self.done = true;
        let class = &self.seg.class;
        let pos = self.seg.f.stream_position()?;
        let mut eof = false;

        if class.eof_marker_size > 0 && pos == self.good_offset + class.eof_marker_size as u64 {
            self.seg.f.seek(SeekFrom::Start(self.good_offset))?;
            let mut buf = [0u8; 8];
            match row::read_exact_or_eof(&mut self.seg.f, &mut buf[..class.eof_marker_size])? {
                Fill::Full => {
                    if u64::from_le_bytes(buf) == class.eof_marker {
                        self.good_offset = pos;
                        eof = true;
                    }
                }
                _ => error!("can't read eof marker in `{}`", self.seg.path.display()),
            }
        } else if class.eof_marker_size == 0 && pos == self.good_offset {
            eof = true;
        }

        self.seg.f.seek(SeekFrom::Start(self.good_offset))?;
        self.seg.rows += self.row_count;
        self.seg.eof = eof;
        Ok(None)
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// A segment opened for appending.
///
/// `close` appends the class eof marker; dropping a writer without
/// closing leaves the segment without its end marker, which readers
/// later report as not cleanly closed.
pub struct SegmentWriter {
    class: SegmentClass,
    path: PathBuf,
    f: BufWriter<File>,
    rows: u64,
}

impl SegmentWriter {
    /// Create the segment named by `lsn`, exclusively: an existing file
    /// surfaces as `AlreadyExists`, which callers resolve by bumping
    /// the name suffix.
    pub fn create(class: &SegmentClass, lsn: i64, name: NameSuffix) -> Result<Self> {
        let path = class.format_filename(lsn, name);
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o664);
        }
        let file = opts.open(&path)?;

        info!("creating `{}`", path.display());
        let mut writer = Self {
            class: class.clone(),
            path,
            f: BufWriter::new(file),
            rows: 0,
        };
        writer.write_header()?;
        Ok(writer)
    }

    fn write_header(&mut self) -> Result<()> {
        self.f.write_all(self.class.filetype.as_bytes())?;
        self.f.write_all(self.class.version.as_bytes())?;
        if self.class.version == VERSION_V11 {
            self.f.write_all(b"\n")?;
        } else {
            // pre-v11 headers carry exactly one free-form line
            let line = format!("{}\n", row::wall_clock());
            self.f.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    /// Append the per-row marker and the v11 frame. Returns the number
    /// of bytes written.
    pub fn append_row(&mut self, row: &Row) -> Result<usize> {
        let marker = self.class.marker.to_le_bytes();
        let frame = row.encode_v11();
        self.f.write_all(&marker[..self.class.marker_size])?;
        self.f.write_all(&frame)?;
        self.rows += 1;
        Ok(self.class.marker_size + frame.len())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.f.flush()?;
        Ok(())
    }

    /// Push buffered bytes to the kernel and fdatasync them.
    pub fn sync_data(&mut self) -> Result<()> {
        self.f.flush()?;
        self.f.get_ref().sync_data()?;
        Ok(())
    }

    /// Append the class eof marker (if any) and flush.
    pub fn close(self) -> Result<()> {
        self.finish(false)
    }

    /// Like `close`, but fsync the finished file before returning.
    /// Snapshot emission needs the end marker inside the fsync barrier.
    pub fn close_synced(self) -> Result<()> {
        self.finish(true)
    }

    fn finish(mut self, sync: bool) -> Result<()> {
        if self.class.eof_marker_size > 0 {
            let marker = self.class.eof_marker.to_le_bytes();
            self.f.write_all(&marker[..self.class.eof_marker_size])?;
        }
        self.f.flush()?;
        if sync {
            self.f.get_ref().sync_all()?;
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Write;
    use tempfile::tempdir;

    fn xlog_family(dir: &Path) -> ClassFamily {
        ClassFamily::xlog(dir, 50_000, 0.0)
    }

    fn write_rows(family: &ClassFamily, lsn: i64, rows: &[(i64, &[u8])], close: bool) -> PathBuf {
        let mut w =
            SegmentWriter::create(family.preferred(), lsn, NameSuffix::Final).unwrap();
        for (lsn, payload) in rows {
            w.append_row(&Row::new(*lsn, Bytes::copy_from_slice(payload)))
                .unwrap();
        }
        let path = w.path().to_path_buf();
        if close {
            w.close().unwrap();
        } else {
            w.flush().unwrap();
        }
        path
    }

    fn scan_all(seg: &mut Segment) -> Vec<Row> {
        let mut rows = Vec::new();
        let mut scanner = seg.scan().unwrap();
        while let Some(row) = scanner.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_write_then_scan_round_trip() {
        let dir = tempdir().unwrap();
        let family = xlog_family(dir.path());
        write_rows(
            &family,
            1,
            &[(1, b"first"), (2, b"second"), (3, b"third")],
            true,
        );

        let mut seg = Segment::open(&family, 1, NameSuffix::Final).unwrap();
        let rows = scan_all(&mut seg);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].lsn, 1);
        assert_eq!(rows[2].payload.as_ref(), b"third");
        assert!(seg.cleanly_closed());
        assert_eq!(seg.rows(), 3);
    }

    #[test]
    fn test_missing_eof_marker_reported_unclean() {
        let dir = tempdir().unwrap();
        let family = xlog_family(dir.path());
        write_rows(&family, 1, &[(1, b"a"), (2, b"b")], false);

        let mut seg = Segment::open(&family, 1, NameSuffix::Final).unwrap();
        let rows = scan_all(&mut seg);
        assert_eq!(rows.len(), 2);
        assert!(!seg.cleanly_closed());
    }

    #[test]
    fn test_scan_resumes_after_concurrent_append() {
        let dir = tempdir().unwrap();
        let family = xlog_family(dir.path());
        let mut w =
            SegmentWriter::create(family.preferred(), 1, NameSuffix::Final).unwrap();
        w.append_row(&Row::new(1, Bytes::from_static(b"one"))).unwrap();
        w.flush().unwrap();

        let mut seg = Segment::open(&family, 1, NameSuffix::Final).unwrap();
        assert_eq!(scan_all(&mut seg).len(), 1);
        assert!(!seg.cleanly_closed());

        w.append_row(&Row::new(2, Bytes::from_static(b"two"))).unwrap();
        w.close().unwrap();

        let rows = scan_all(&mut seg);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lsn, 2);
        assert!(seg.cleanly_closed());
        assert_eq!(seg.rows(), 2);
    }

    #[test]
    fn test_scan_resyncs_past_garbage() {
        let dir = tempdir().unwrap();
        let family = xlog_family(dir.path());
        let path = write_rows(&family, 1, &[(1, b"good")], false);

        // splice garbage, then a valid frame, after the first row
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"some trailing garbage bytes").unwrap();
        let marker = family.preferred().marker.to_le_bytes();
        f.write_all(&marker[..4]).unwrap();
        f.write_all(&Row::new(2, Bytes::from_static(b"after")).encode_v11())
            .unwrap();
        drop(f);

        let mut seg = Segment::open(&family, 1, NameSuffix::Final).unwrap();
        let rows = scan_all(&mut seg);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].lsn, 2);
    }

    #[test]
    fn test_corrupt_row_skipped_when_tolerant() {
        let dir = tempdir().unwrap();
        let family = xlog_family(dir.path());
        let path = write_rows(&family, 1, &[(1, b"aaaa"), (2, b"bbbb"), (3, b"cccc")], true);

        // damage the payload of the middle row
        let mut bytes = std::fs::read(&path).unwrap();
        let header_len = b"XLOG\n0.11\n\n".len();
        let frame_len = 4 + 28 + 4;
        let target = header_len + frame_len + 4 + 28; // payload of row 2
        bytes[target] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut seg = Segment::open(&family, 1, NameSuffix::Final).unwrap();
        let rows = scan_all(&mut seg);
        let lsns: Vec<i64> = rows.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![1, 3]);
    }

    #[test]
    fn test_corrupt_row_fatal_when_strict() {
        let dir = tempdir().unwrap();
        let mut family = xlog_family(dir.path());
        let path = write_rows(&family, 1, &[(1, b"aaaa"), (2, b"bbbb")], true);

        let mut bytes = std::fs::read(&path).unwrap();
        let header_len = b"XLOG\n0.11\n\n".len();
        bytes[header_len + 4 + 28 + 4 + 4 + 28] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        family.set_panic_if_error(true);
        let mut seg = Segment::open(&family, 1, NameSuffix::Final).unwrap();
        let mut scanner = seg.scan().unwrap();
        assert_eq!(scanner.next_row().unwrap().unwrap().lsn, 1);
        assert!(matches!(scanner.next_row(), Err(WalError::Corruption(_))));
    }

    #[test]
    fn test_open_rejects_wrong_filetype() {
        let dir = tempdir().unwrap();
        let snap_family = ClassFamily::snap(dir.path());
        let mut w =
            SegmentWriter::create(snap_family.preferred(), 5, NameSuffix::Final).unwrap();
        w.append_row(&Row::new(0, Bytes::from_static(b"s"))).unwrap();
        let path = w.path().to_path_buf();
        w.close().unwrap();

        let xlog_family = ClassFamily::xlog(dir.path(), 50_000, 0.0);
        assert!(matches!(
            Segment::open_path(&xlog_family, &path),
            Err(WalError::Header(_))
        ));
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempdir().unwrap();
        let family = xlog_family(dir.path());
        let w = SegmentWriter::create(family.preferred(), 9, NameSuffix::Final).unwrap();
        drop(w);
        let err = SegmentWriter::create(family.preferred(), 9, NameSuffix::Final);
        match err {
            Err(WalError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists)
            }
            other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
        }
    }
}
