// Segment classes: the combined format, directory, and rotation policy
// for a family of on-disk segment files (xlog or snapshot).

use std::path::{Path, PathBuf};

/// Per-row magic preceding every v11 frame.
pub const MARKER_V11: u32 = 0xba0b_abed;
/// Trailing magic appended when a v11 segment is closed normally.
pub const EOF_MARKER_V11: u32 = 0x10ad_ab1e;
/// Legacy v04 xlog per-row magic.
pub const XLOG_MARKER_V04: u64 = u64::MAX;
/// Legacy v04 xlog eof magic (all zeros).
pub const XLOG_EOF_MARKER_V04: u64 = 0;
/// Legacy v03 snapshot per-row magic; v03 snapshots carry no eof magic.
pub const SNAP_MARKER_V03: u32 = u32::MAX;

pub const SNAP_SUFFIX: &str = ".snap";
pub const XLOG_SUFFIX: &str = ".xlog";
pub const INPROGRESS_SUFFIX: &str = ".inprogress";

pub const SNAP_FILETYPE: &str = "SNAP\n";
pub const XLOG_FILETYPE: &str = "XLOG\n";

pub const VERSION_V03: &str = "0.03\n";
pub const VERSION_V04: &str = "0.04\n";
pub const VERSION_V11: &str = "0.11\n";

/// Which frame layout a class reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Current format: crc32c-protected 28-byte header.
    V11,
    /// Legacy read-only format, normalized into v11-shaped rows on read.
    V04,
}

/// Filename tail of a segment.
///
/// `Final` is the committed name, `Inprogress` marks a file not yet
/// atomically renamed, and `Conflict(n)` is the numeric disambiguator
/// the writer uses to resolve name collisions on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSuffix {
    Final,
    Inprogress,
    Conflict(u32),
}

impl NameSuffix {
    /// Conflict counter as used by open-retry loops: 0 means `Final`.
    pub fn conflict(n: u32) -> Self {
        if n == 0 {
            NameSuffix::Final
        } else {
            NameSuffix::Conflict(n)
        }
    }
}

/// A value object describing one family member: on-disk format plus
/// directory and rotation policy.
#[derive(Debug, Clone)]
pub struct SegmentClass {
    pub dir: PathBuf,
    pub suffix: &'static str,
    pub filetype: &'static str,
    pub version: &'static str,
    pub codec: Codec,
    pub marker: u64,
    pub marker_size: usize,
    pub eof_marker: u64,
    /// 0 means the class has no end marker.
    pub eof_marker_size: usize,
    /// Rows per segment before rotation; 0 means never rotate.
    pub rows_per_file: u64,
    /// Minimum seconds between fsyncs; 0 flushes without fsync.
    pub fsync_delay: f64,
    /// Abort the scan on a corrupt row instead of resyncing past it.
    pub panic_if_error: bool,
}

impl SegmentClass {
    fn xlog_v11(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            suffix: XLOG_SUFFIX,
            filetype: XLOG_FILETYPE,
            version: VERSION_V11,
            codec: Codec::V11,
            marker: MARKER_V11 as u64,
            marker_size: 4,
            eof_marker: EOF_MARKER_V11 as u64,
            eof_marker_size: 4,
            rows_per_file: 50_000,
            fsync_delay: 0.0,
            panic_if_error: false,
        }
    }

    fn xlog_v04(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            suffix: XLOG_SUFFIX,
            filetype: XLOG_FILETYPE,
            version: VERSION_V04,
            codec: Codec::V04,
            marker: XLOG_MARKER_V04,
            marker_size: 8,
            eof_marker: XLOG_EOF_MARKER_V04,
            eof_marker_size: 8,
            rows_per_file: 50_000,
            fsync_delay: 0.0,
            panic_if_error: false,
        }
    }

    fn snap_v11(dir: &Path) -> Self {
        Self {
            suffix: SNAP_SUFFIX,
            filetype: SNAP_FILETYPE,
            rows_per_file: 0,
            ..Self::xlog_v11(dir)
        }
    }

    fn snap_v03(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            suffix: SNAP_SUFFIX,
            filetype: SNAP_FILETYPE,
            version: VERSION_V03,
            codec: Codec::V04,
            marker: SNAP_MARKER_V03 as u64,
            marker_size: 4,
            eof_marker: 0,
            eof_marker_size: 0,
            rows_per_file: 0,
            fsync_delay: 0.0,
            panic_if_error: false,
        }
    }

    /// Full path of the segment named by `lsn` in this class.
    pub fn format_filename(&self, lsn: i64, name: NameSuffix) -> PathBuf {
        let base = match name {
            NameSuffix::Final => format!("{:020}{}", lsn, self.suffix),
            NameSuffix::Inprogress => {
                format!("{:020}{}{}", lsn, self.suffix, INPROGRESS_SUFFIX)
            }
            NameSuffix::Conflict(n) => format!("{:020}{}.{}", lsn, self.suffix, n),
        };
        self.dir.join(base)
    }

    /// Bit mask selecting `marker_size` low-order bytes of a word.
    pub fn marker_mask(&self) -> u64 {
        u64::MAX >> ((8 - self.marker_size) * 8)
    }
}

/// All on-disk versions a directory may contain. The last entry is the
/// preferred class, the one used for writing.
#[derive(Debug, Clone)]
pub struct ClassFamily {
    classes: Vec<SegmentClass>,
}

impl ClassFamily {
    /// xlog family: legacy v04 accepted for reading, v11 written.
    pub fn xlog(dir: &Path, rows_per_file: u64, fsync_delay: f64) -> Self {
        let mut preferred = SegmentClass::xlog_v11(dir);
        preferred.rows_per_file = rows_per_file;
        preferred.fsync_delay = fsync_delay;
        Self {
            classes: vec![SegmentClass::xlog_v04(dir), preferred],
        }
    }

    /// Snapshot family: legacy v03 accepted for reading, v11 written.
    pub fn snap(dir: &Path) -> Self {
        Self {
            classes: vec![SegmentClass::snap_v03(dir), SegmentClass::snap_v11(dir)],
        }
    }

    /// The class used for writing and for directory scans.
    pub fn preferred(&self) -> &SegmentClass {
        self.classes.last().expect("class family is never empty")
    }

    pub fn filetype(&self) -> &'static str {
        self.preferred().filetype
    }

    /// Concrete class matching an on-disk version header line.
    pub fn match_version(&self, version: &str) -> Option<&SegmentClass> {
        self.classes.iter().find(|c| c.version == version)
    }

    pub fn set_panic_if_error(&mut self, on: bool) {
        for class in &mut self.classes {
            class.panic_if_error = on;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_filename_padding() {
        let class = SegmentClass::xlog_v11(Path::new("/tmp/wal"));
        let path = class.format_filename(101, NameSuffix::Final);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "00000000000000000101.xlog"
        );
    }

    #[test]
    fn test_format_filename_tails() {
        let class = SegmentClass::snap_v11(Path::new("."));
        let inprogress = class.format_filename(7, NameSuffix::Inprogress);
        assert!(inprogress
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with(".snap.inprogress"));

        let conflict = class.format_filename(7, NameSuffix::Conflict(3));
        assert!(conflict
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with(".snap.3"));
    }

    #[test]
    fn test_marker_mask() {
        let xlog = SegmentClass::xlog_v11(Path::new("."));
        assert_eq!(xlog.marker_mask(), 0xffff_ffff);
        let legacy = SegmentClass::xlog_v04(Path::new("."));
        assert_eq!(legacy.marker_mask(), u64::MAX);
    }

    #[test]
    fn test_family_version_match() {
        let family = ClassFamily::xlog(Path::new("."), 1000, 0.0);
        assert_eq!(family.preferred().version, VERSION_V11);
        assert!(family.match_version(VERSION_V04).is_some());
        assert!(family.match_version("0.99\n").is_none());
    }
}
