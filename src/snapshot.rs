// Snapshot emission: frame the in-memory state into an `.inprogress`
// file, throttle the byte stream, fsync, then atomically rename. A
// file under the final snapshot name is always complete and synced.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use crate::error::Result;
use crate::log::{NameSuffix, Row, SegmentClass, SegmentWriter};

/// Destination handed to the state dumper; every yielded row is framed
/// and written behind the rate limiter.
pub struct SnapshotSink {
    seg: SegmentWriter,
    limiter: RateLimiter,
    rows: u64,
}

impl SnapshotSink {
    /// Append one state row. Snapshot rows carry no log position, so
    /// they are framed with lsn = 0.
    pub fn add_row(&mut self, payload: Bytes) -> Result<()> {
        let row = Row::new(0, payload);
        let written = self.seg.append_row(&row)?;
        self.limiter.throttle(written as u64);
        self.rows += 1;
        if self.rows % 100_000 == 0 {
            info!("{:.1}M rows written", self.rows as f64 / 1_000_000.0);
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

/// Caps emission at `limit` bytes per second using 1-second windows:
/// once a window's budget is spent, sleep out the rest of the window.
struct RateLimiter {
    limit: u64,
    bytes: u64,
    window_start: Option<Instant>,
}

impl RateLimiter {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            bytes: 0,
            window_start: None,
        }
    }

    fn throttle(&mut self, len: u64) {
        if self.limit == 0 {
            return;
        }
        let start = self.window_start.get_or_insert_with(Instant::now);
        self.bytes += len;
        while self.bytes >= self.limit {
            let elapsed = start.elapsed();
            if elapsed < Duration::from_secs(1) {
                thread::sleep(Duration::from_secs(1) - elapsed);
            }
            *start = Instant::now();
            self.bytes -= self.limit;
        }
    }
}

/// Write a snapshot of the state at `confirmed_lsn` and atomically
/// commit it to its final name. Any failure propagates; at worst an
/// `.inprogress` leftover remains for the operator to remove.
pub(crate) fn save<F>(
    class: &SegmentClass,
    confirmed_lsn: i64,
    io_rate_limit: u64,
    dump: F,
) -> Result<()>
where
    F: FnOnce(&mut SnapshotSink) -> Result<()>,
{
    let seg = SegmentWriter::create(class, confirmed_lsn, NameSuffix::Inprogress)?;
    let inprogress = seg.path().to_path_buf();
    let final_path = class.format_filename(confirmed_lsn, NameSuffix::Final);
    info!("saving snapshot `{}`", final_path.display());

    let mut sink = SnapshotSink {
        seg,
        limiter: RateLimiter::new(io_rate_limit),
        rows: 0,
    };
    dump(&mut sink)?;

    // the end marker must land inside the fsync barrier: only a fully
    // synced file may take the final name
    let SnapshotSink { seg, .. } = sink;
    seg.close_synced()?;
    fs::rename(&inprogress, &final_path)?;
    info!("done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WalError;
    use crate::log::{ClassFamily, NameSuffix, Segment};
    use tempfile::tempdir;

    #[test]
    fn test_save_commits_under_final_name() {
        let dir = tempdir().unwrap();
        let family = ClassFamily::snap(dir.path());

        save(family.preferred(), 42, 0, |sink| {
            for i in 0..5u32 {
                sink.add_row(Bytes::from(i.to_le_bytes().to_vec()))?;
            }
            Ok(())
        })
        .unwrap();

        let final_path = family.preferred().format_filename(42, NameSuffix::Final);
        let inprogress = family
            .preferred()
            .format_filename(42, NameSuffix::Inprogress);
        assert!(final_path.exists());
        assert!(!inprogress.exists());

        let mut seg = Segment::open(&family, 42, NameSuffix::Final).unwrap();
        let mut scanner = seg.scan().unwrap();
        let mut rows = 0;
        while let Some(row) = scanner.next_row().unwrap() {
            assert_eq!(row.lsn, 0);
            rows += 1;
        }
        drop(scanner);
        assert_eq!(rows, 5);
        assert!(seg.cleanly_closed());
    }

    #[test]
    fn test_failed_dump_leaves_no_final_file() {
        let dir = tempdir().unwrap();
        let family = ClassFamily::snap(dir.path());

        let result = save(family.preferred(), 7, 0, |sink| {
            sink.add_row(Bytes::from_static(b"partial"))?;
            Err(WalError::Snapshot("state dump failed".into()))
        });
        assert!(result.is_err());

        let final_path = family.preferred().format_filename(7, NameSuffix::Final);
        assert!(!final_path.exists());
        // the working file remains for the operator to inspect
        assert!(family
            .preferred()
            .format_filename(7, NameSuffix::Inprogress)
            .exists());
    }

    #[test]
    fn test_rate_limiter_spends_budget_per_window() {
        let mut limiter = RateLimiter::new(1_000_000);
        let start = Instant::now();
        // well under one window's budget: no sleep expected
        for _ in 0..10 {
            limiter.throttle(1_000);
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
