// Directory scanner: enumerate segment files by LSN.

use std::fs;

use tracing::warn;

use crate::error::Result;
use super::class::SegmentClass;

/// Ascending LSNs of every well-formed segment name in the class
/// directory. Only `<digits><suffix>` names count; `.inprogress` and
/// conflict-tailed (`.N`) files are found by open attempts, never by
/// scans. New entries appearing mid-scan are tolerated.
pub fn scan(class: &SegmentClass) -> Result<Vec<i64>> {
    let mut lsns = Vec::new();
    for entry in fs::read_dir(&class.dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(class.suffix) else {
            continue;
        };
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            warn!("can't parse `{}`, skipping", name);
            continue;
        }
        match stem.parse::<i64>() {
            Ok(lsn) => lsns.push(lsn),
            Err(_) => warn!("can't parse `{}`, skipping", name),
        }
    }
    lsns.sort_unstable();
    Ok(lsns)
}

/// Greatest segment LSN on disk, or 0 for an empty directory.
pub fn greatest_lsn(class: &SegmentClass) -> Result<i64> {
    Ok(scan(class)?.last().copied().unwrap_or(0))
}

/// The largest file LSN not exceeding `target_lsn`: the file that may
/// contain the target row. Returns the last file when the target lies
/// beyond every file (row counts are not knowable from names alone),
/// and 0 when the target precedes them all.
pub fn find_including_file(class: &SegmentClass, target_lsn: i64) -> Result<i64> {
    let lsns = scan(class)?;
    Ok(lsns
        .iter()
        .rev()
        .find(|&&lsn| lsn <= target_lsn)
        .copied()
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::class::ClassFamily;
    use std::fs::File;
    use tempfile::tempdir;

    fn touch(dir: &std::path::Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn test_scan_sorts_and_filters() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "00000000000000000200.xlog");
        touch(dir.path(), "00000000000000000002.xlog");
        touch(dir.path(), "00000000000000000050.xlog");
        touch(dir.path(), "00000000000000000050.xlog.1");
        touch(dir.path(), "00000000000000000060.xlog.inprogress");
        touch(dir.path(), "garbage.xlog");
        touch(dir.path(), "00000000000000000300.snap");
        touch(dir.path(), "notes.txt");

        let family = ClassFamily::xlog(dir.path(), 50_000, 0.0);
        let lsns = scan(family.preferred()).unwrap();
        assert_eq!(lsns, vec![2, 50, 200]);
    }

    #[test]
    fn test_greatest_lsn_empty_dir() {
        let dir = tempdir().unwrap();
        let family = ClassFamily::xlog(dir.path(), 50_000, 0.0);
        assert_eq!(greatest_lsn(family.preferred()).unwrap(), 0);
    }

    #[test]
    fn test_find_including_file() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "00000000000000000010.xlog");
        touch(dir.path(), "00000000000000000020.xlog");
        touch(dir.path(), "00000000000000000030.xlog");

        let family = ClassFamily::xlog(dir.path(), 50_000, 0.0);
        let class = family.preferred();
        assert_eq!(find_including_file(class, 25).unwrap(), 20);
        assert_eq!(find_including_file(class, 20).unwrap(), 20);
        // beyond every file: the last one may still contain the target
        assert_eq!(find_including_file(class, 999).unwrap(), 30);
        // before every file: nothing can contain it
        assert_eq!(find_including_file(class, 5).unwrap(), 0);
    }
}
