// Recovery controller
//
// Brings empty in-memory state up to the highest durable LSN: replay
// the newest snapshot, then every xlog row after it, in strict LSN
// order. Afterwards the controller either stops or moves onto a
// follower thread ([`follow`]) that keeps tailing the directory until
// the system is finalized for serving.
//
// The controller owns both LSN cursors. `confirmed_lsn` advances only
// for rows actually applied (or, online, only after a successful
// writer reply); `lsn` is the allocation cursor and may run ahead.

mod follow;

pub use follow::FollowHandle;

use tracing::{debug, error, info, warn};

use crate::error::{Result, WalError};
use crate::log::{dir, ClassFamily, NameSuffix, Row, Segment};
use crate::snapshot::{self, SnapshotSink};
use crate::WalConfig;

/// Applies recovered rows to in-memory state. Either callback failing
/// aborts recovery.
pub trait RowHandler {
    fn snap_row(&mut self, row: &Row) -> Result<()>;
    fn wal_row(&mut self, row: &Row) -> Result<()>;
}

/// Outcome of scanning the current xlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanOutcome {
    /// Clean end marker reached.
    Eof,
    /// Read up to the last good offset; the file may still grow.
    More,
}

pub struct RecoveryController<H> {
    pub(crate) config: WalConfig,
    snap_family: ClassFamily,
    wal_family: ClassFamily,
    /// Highest LSN ever assigned.
    lsn: i64,
    /// Highest LSN known durably applied. Never exceeds `lsn`.
    confirmed_lsn: i64,
    current_wal: Option<Segment>,
    /// LSN the current xlog was opened under; names its conflicters.
    current_wal_lsn: i64,
    handler: H,
}

impl<H: RowHandler> RecoveryController<H> {
    pub fn new(config: WalConfig, handler: H) -> Self {
        let mut snap_family = ClassFamily::snap(&config.snap_dir);
        let mut wal_family =
            ClassFamily::xlog(&config.wal_dir, config.rows_per_file, config.fsync_delay);
        snap_family.set_panic_if_error(config.panic_on_snap_error);
        wal_family.set_panic_if_error(config.panic_on_wal_error);

        Self {
            config,
            snap_family,
            wal_family,
            lsn: 0,
            confirmed_lsn: 0,
            current_wal: None,
            current_wal_lsn: 0,
            handler,
        }
    }

    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    pub fn confirmed_lsn(&self) -> i64 {
        self.confirmed_lsn
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Reconfigure corruption strictness for both class families.
    pub fn set_panic_on_error(&mut self, on_snap_error: bool, on_wal_error: bool) {
        self.snap_family.set_panic_if_error(on_snap_error);
        self.wal_family.set_panic_if_error(on_wal_error);
    }

    /// Allocate the next LSN: 0 advances by one, anything else jumps
    /// the cursor.
    pub fn next_lsn(&mut self, new_lsn: i64) -> i64 {
        if new_lsn == 0 {
            self.lsn += 1;
        } else {
            self.lsn = new_lsn;
        }
        debug!("next_lsn({}) => {}", new_lsn, self.lsn);
        self.lsn
    }

    /// Advance the durable cursor after a successful writer reply.
    /// A gap is tolerated with a warning; confirming backwards is not.
    pub fn confirm_lsn(&mut self, lsn: i64) -> Result<()> {
        debug_assert!(self.confirmed_lsn <= self.lsn);
        if self.confirmed_lsn < lsn {
            if self.confirmed_lsn + 1 != lsn {
                warn!(
                    "non consecutive lsn, last confirmed:{} new:{} diff:{}",
                    self.confirmed_lsn,
                    lsn,
                    lsn - self.confirmed_lsn
                );
            }
            self.confirmed_lsn = lsn;
            Ok(())
        } else {
            warn!("lsn double confirmed:{}", self.confirmed_lsn);
            Err(WalError::DoubleConfirm(lsn))
        }
    }

    /// Cold recovery.
    ///
    /// With `lsn == 0` the newest snapshot is replayed first and sets
    /// both cursors; any other value skips the snapshot and starts the
    /// wal replay with the lsn next to the given one (point-open).
    pub fn recover(&mut self, lsn: i64) -> Result<()> {
        info!("recovery start");

        if lsn == 0 {
            self.recover_snap()?;
            info!("snapshot recovered, confirmed lsn:{}", self.confirmed_lsn);
        } else {
            self.lsn = lsn - 1;
            self.confirmed_lsn = lsn - 1;
        }

        // just after snapshot recovery the current wal isn't known, so
        // find the file which contains the record with the next lsn
        if self.current_wal.is_none() {
            let next_lsn = self.confirmed_lsn + 1;
            let file_lsn = dir::find_including_file(self.wal_family.preferred(), next_lsn)?;
            if file_lsn > 0 {
                let seg = Segment::open(&self.wal_family, file_lsn, NameSuffix::Final)?;
                info!("recover from `{}`", seg.path().display());
                self.current_wal = Some(seg);
                self.current_wal_lsn = file_lsn;
            } else if dir::greatest_lsn(self.wal_family.preferred())? > self.confirmed_lsn {
                // files newer than the snapshot exist, yet none covers
                // the next lsn
                error!("can't find wal containing record with lsn:{}", next_lsn);
                return Err(WalError::Recovery(format!(
                    "missing wal covering lsn {}",
                    next_lsn
                )));
            }
            // a wal directory with nothing after the snapshot is fine
        }

        self.recover_remaining_wals()?;
        info!("wals recovered, confirmed lsn: {}", self.confirmed_lsn);
        Ok(())
    }

    fn recover_snap(&mut self) -> Result<()> {
        let snap_lsn = dir::greatest_lsn(self.snap_family.preferred())?;
        if snap_lsn <= 0 {
            error!("can't find snapshot");
            return Err(WalError::NoSnapshot);
        }

        let mut snap = Segment::open(&self.snap_family, snap_lsn, NameSuffix::Final)?;
        info!("recover from `{}`", snap.path().display());

        let mut scanner = snap.scan()?;
        while let Some(row) = scanner.next_row()? {
            self.handler.snap_row(&row)?;
        }
        drop(scanner);

        if !snap.cleanly_closed() {
            warn!("snapshot `{}` wasn't correctly closed", snap.path().display());
        }

        self.lsn = snap_lsn;
        self.confirmed_lsn = snap_lsn;
        Ok(())
    }

    /// Scan the current xlog from its last good offset, delivering rows
    /// newer than `confirmed_lsn` in order and advancing both cursors.
    fn recover_wal(&mut self) -> Result<ScanOutcome> {
        let Self {
            current_wal,
            handler,
            lsn,
            confirmed_lsn,
            ..
        } = self;
        let Some(wal) = current_wal.as_mut() else {
            return Err(WalError::Recovery("no current wal to scan".into()));
        };

        let mut scanner = wal.scan()?;
        while let Some(row) = scanner.next_row()? {
            if row.lsn <= *confirmed_lsn {
                debug!("skipping too young row {}", row.lsn);
                continue;
            }
            handler.wal_row(&row)?;
            *lsn = row.lsn;
            if *confirmed_lsn + 1 != row.lsn {
                warn!(
                    "non consecutive lsn, last confirmed:{} new:{}",
                    *confirmed_lsn, row.lsn
                );
            }
            *confirmed_lsn = row.lsn;
        }
        drop(scanner);

        Ok(if wal.cleanly_closed() {
            ScanOutcome::Eof
        } else {
            ScanOutcome::More
        })
    }

    /// Replay every xlog past `confirmed_lsn`. Does not close the
    /// current wal unless its end marker was reached, so a follower can
    /// keep rescanning the live tail.
    pub(crate) fn recover_remaining_wals(&mut self) -> Result<()> {
        let mut suffix: u32 = 0;
        let wal_greatest = dir::greatest_lsn(self.wal_family.preferred())?;

        // a wal left open by the caller or a previous pass is scanned
        // before anything else
        let mut scan_current = self.current_wal.is_some();

        loop {
            if !scan_current {
                if self.confirmed_lsn >= wal_greatest {
                    break;
                }

                if let Some(wal) = self.current_wal.as_mut() {
                    // a newer wal exists but this one never reached its
                    // end marker; reread it a few times in case a
                    // concurrent writer is still appending
                    if wal.retry < 3 {
                        wal.retry += 1;
                        warn!(
                            "try reread `{}` despite newer wal exists",
                            wal.path().display()
                        );
                        scan_current = true;
                        continue;
                    }
                    warn!("wal `{}` wasn't correctly closed", wal.path().display());
                    self.current_wal = None;
                }

                let current_lsn = self.confirmed_lsn + 1;
                match Segment::open(&self.wal_family, current_lsn, NameSuffix::conflict(suffix)) {
                    Ok(seg) => {
                        info!("recover from `{}`", seg.path().display());
                        self.current_wal = Some(seg);
                        self.current_wal_lsn = current_lsn;
                    }
                    Err(_) => {
                        suffix += 1;
                        if suffix <= 10 {
                            continue;
                        }
                        // nothing more to open; the gap check below has
                        // the last word
                        break;
                    }
                }
            }
            scan_current = false;

            let rows_before = self.current_wal.as_ref().map(|w| w.rows()).unwrap_or(0);
            let outcome = self.recover_wal()?;

            let Some(wal) = self.current_wal.as_mut() else {
                break;
            };
            if wal.rows() > 0 && wal.rows() != rows_before {
                wal.retry = 0;
            }

            if wal.rows() == 0 {
                // either a conflicter took this name or the segment is
                // truly empty; retry under the next conflict name
                error!(
                    "read zero records from `{}`, retrying",
                    wal.path().display()
                );
                suffix += 1;
                if suffix <= 10 {
                    continue;
                }
                return Err(WalError::Recovery("too many name conflicts".into()));
            }

            // a successful read must not leave a conflicter shadowing it
            let conflicter = self
                .wal_family
                .preferred()
                .format_filename(self.current_wal_lsn, NameSuffix::conflict(suffix + 1));
            if conflicter.exists() {
                error!(
                    "found conflicter `{}` after successful reading",
                    conflicter.display()
                );
                return Err(WalError::Recovery(format!(
                    "name conflict on `{}`",
                    conflicter.display()
                )));
            }

            if outcome == ScanOutcome::Eof {
                info!(
                    "done `{}` confirmed_lsn:{}",
                    wal.path().display(),
                    self.confirmed_lsn
                );
                self.current_wal = None;
                suffix = 0;
            }
        }

        // an empty tail wal is not an error; lost logs are
        if wal_greatest > self.confirmed_lsn + 1 {
            error!("not all wals have been successfully read");
            return Err(WalError::Recovery(
                "not all wals have been successfully read".into(),
            ));
        }
        Ok(())
    }

    /// Rescan the current wal if one is open; closes it on clean EOF.
    /// Fast path used by the follower when the file grows.
    pub(crate) fn scan_current(&mut self) -> Result<Option<ScanOutcome>> {
        if self.current_wal.is_none() {
            return Ok(None);
        }
        let outcome = self.recover_wal()?;
        if outcome == ScanOutcome::Eof {
            if let Some(wal) = self.current_wal.take() {
                info!(
                    "done `{}` confirmed_lsn:{}",
                    wal.path().display(),
                    self.confirmed_lsn
                );
            }
        }
        Ok(Some(outcome))
    }

    pub(crate) fn current_wal_path(&self) -> Option<std::path::PathBuf> {
        self.current_wal.as_ref().map(|w| w.path().to_path_buf())
    }

    /// Catch any final appends and let go of the current wal; called
    /// when the system transitions to serving.
    pub fn finalize(&mut self) -> Result<()> {
        self.recover_remaining_wals()?;
        if let Some(wal) = self.current_wal.take() {
            if !wal.cleanly_closed() {
                warn!("wal `{}` wasn't correctly closed", wal.path().display());
            }
        }
        Ok(())
    }

    /// Dump the in-memory state into a new snapshot at `confirmed_lsn`.
    /// The file appears under its final name only fully written and
    /// fsynced; failures leave at most an `.inprogress` leftover.
    pub fn save_snapshot<F>(&self, dump: F) -> Result<()>
    where
        F: FnOnce(&mut SnapshotSink) -> Result<()>,
    {
        snapshot::save(
            self.snap_family.preferred(),
            self.confirmed_lsn,
            self.config.snap_io_rate_limit,
            dump,
        )
    }
}
