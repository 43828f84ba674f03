// On-disk log format module
//
// Everything that knows what segment bytes look like lives here:
//
// | Module | Responsibility |
// |--------|----------------|
// | [`class`] | Segment classes: markers, versions, rotation policy |
// | [`row`] | Record codec: v11 frames, legacy v04 normalization |
// | [`segment`] | Segment file handles and the scanning iterator |
// | [`dir`] | Directory scanner: which file holds which LSN |

pub mod class;
pub mod dir;
pub mod row;
pub mod segment;

pub use class::{ClassFamily, Codec, NameSuffix, SegmentClass};
pub use class::{SNAP_SUFFIX, XLOG_SUFFIX};
pub use row::Row;
pub use segment::{Scanner, Segment, SegmentWriter};

use std::path::Path;

use tracing::error;

use crate::error::{Result, WalError};

/// Stream every row of a single log file to `handler`, choosing the
/// class family from the file suffix. Returns whether the file was
/// cleanly closed. Debug tooling only; recovery never calls this.
pub fn read_log_file<F>(path: &Path, mut handler: F) -> Result<bool>
where
    F: FnMut(&Row) -> Result<()>,
{
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let family = if name.contains(XLOG_SUFFIX) {
        ClassFamily::xlog(parent, 50_000, 0.0)
    } else if name.contains(SNAP_SUFFIX) {
        ClassFamily::snap(parent)
    } else {
        return Err(WalError::Header(format!(
            "don't know how to read `{}`",
            path.display()
        )));
    };

    let mut seg = Segment::open_path(&family, path)?;
    let mut scanner = seg.scan()?;
    while let Some(row) = scanner.next_row()? {
        handler(&row)?;
    }
    drop(scanner);

    if !seg.cleanly_closed() {
        error!("binary log `{}` wasn't correctly closed", path.display());
    }
    Ok(seg.cleanly_closed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[test]
    fn test_read_log_file_by_suffix() {
        let dir = tempdir().unwrap();
        let family = ClassFamily::xlog(dir.path(), 50_000, 0.0);
        let mut w = SegmentWriter::create(family.preferred(), 1, NameSuffix::Final).unwrap();
        for lsn in 1..=3 {
            w.append_row(&Row::new(lsn, Bytes::from_static(b"r"))).unwrap();
        }
        let path = w.path().to_path_buf();
        w.close().unwrap();

        let mut seen = Vec::new();
        let clean = read_log_file(&path, |row| {
            seen.push(row.lsn);
            Ok(())
        })
        .unwrap();
        assert!(clean);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_read_log_file_unknown_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("whatever.dat");
        std::fs::write(&path, b"junk").unwrap();
        assert!(matches!(
            read_log_file(&path, |_| Ok(())),
            Err(WalError::Header(_))
        ));
    }
}
