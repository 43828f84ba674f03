// Log writer: a dedicated worker owning the current xlog segment.
//
// Committers submit {lsn, payload} through a bounded mailbox and await
// a status reply; replies are produced in submission order, which is
// what makes LSN assignment safe. The worker runs blocking file I/O on
// its own OS thread so an fsync never stalls the committing side.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Result, WalError};
use crate::log::{ClassFamily, NameSuffix, Row, SegmentClass, SegmentWriter};
use crate::WalConfig;

/// Reply carried back to the committer; 0 means durably appended.
type Status = u32;

struct WriteRequest {
    lsn: i64,
    payload: Bytes,
    reply: oneshot::Sender<Status>,
}

enum Request {
    Write(WriteRequest),
    /// Drain: close any open segment and exit the loop.
    Shutdown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriterStats {
    pub rows_written: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
    pub rotations: u64,
    pub failed_requests: u64,
}

/// Committer-side handle to the writer worker.
pub struct WalWriterHandle {
    tx: mpsc::Sender<Request>,
    stats: Arc<RwLock<WriterStats>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Spawn the writer worker, or nothing at all in readonly mode.
pub fn spawn(config: &WalConfig) -> Result<Option<WalWriterHandle>> {
    if config.readonly {
        return Ok(None);
    }

    let class = ClassFamily::xlog(&config.wal_dir, config.rows_per_file, config.fsync_delay)
        .preferred()
        .clone();
    let (tx, rx) = mpsc::channel(config.inbox_size.max(1));
    let stats = Arc::new(RwLock::new(WriterStats::default()));

    let actor = WriterActor {
        class,
        rx,
        stats: stats.clone(),
        current: None,
        rows: 0,
        last_fsync: None,
    };
    let thread = thread::Builder::new()
        .name("wal_writer".into())
        .spawn(move || actor.run())?;

    Ok(Some(WalWriterHandle {
        tx,
        stats,
        thread: Some(thread),
    }))
}

impl WalWriterHandle {
    /// Submit one row for appending and await its reply.
    ///
    /// A full mailbox surfaces as [`WalError::Busy`], a retryable
    /// backpressure signal; the committer should yield to the scheduler
    /// before trying again. Any non-zero writer status means the row
    /// must not be published as durable.
    pub async fn append(&self, lsn: i64, payload: Bytes) -> Result<()> {
        debug!("wal_write lsn={}", lsn);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(Request::Write(WriteRequest {
                lsn,
                payload,
                reply: reply_tx,
            }))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("wal writer inbox is full");
                    WalError::Busy
                }
                mpsc::error::TrySendError::Closed(_) => WalError::WriterGone,
            })?;

        let status = reply_rx.await.map_err(|_| WalError::WriterGone)?;
        debug!("wal_write reply={}", status);
        if status != 0 {
            warn!("wal writer returned error status");
            return Err(WalError::WriteFailed);
        }
        Ok(())
    }

    pub fn stats(&self) -> WriterStats {
        self.stats.read().clone()
    }

    /// Drain the mailbox, close the current segment, and stop the
    /// worker. Replies already produced stay valid.
    pub async fn shutdown(mut self) {
        let _ = self.tx.send(Request::Shutdown).await;
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }
}

struct WriterActor {
    class: SegmentClass,
    rx: mpsc::Receiver<Request>,
    stats: Arc<RwLock<WriterStats>>,
    current: Option<SegmentWriter>,
    /// Rows in the current segment.
    rows: u64,
    /// Single scalar gate for the fsync_delay policy.
    last_fsync: Option<Instant>,
}

impl WriterActor {
    fn run(mut self) {
        while let Some(req) = self.rx.blocking_recv() {
            match req {
                Request::Shutdown => break,
                Request::Write(req) => {
                    let (status, finished) = self.handle_write(&req);
                    let _ = req.reply.send(status);
                    // the rotated-out segment is closed only after the
                    // reply is on its way
                    if let Some(seg) = finished {
                        match seg.close() {
                            Ok(()) => self.stats.write().rotations += 1,
                            Err(e) => error!("can't close rotated wal: {}", e),
                        }
                    }
                }
            }
        }
        if let Some(seg) = self.current.take() {
            if let Err(e) = seg.close() {
                error!("can't close wal on shutdown: {}", e);
            }
        }
        info!("wal writer stopped");
    }

    fn handle_write(&mut self, req: &WriteRequest) -> (Status, Option<SegmentWriter>) {
        match self.append(req) {
            Ok(finished) => (0, finished),
            Err(e) => {
                error!("wal write for lsn {} failed: {}", req.lsn, e);
                self.stats.write().failed_requests += 1;
                (1, None)
            }
        }
    }

    fn append(&mut self, req: &WriteRequest) -> Result<Option<SegmentWriter>> {
        let seg = match &mut self.current {
            Some(seg) => seg,
            slot => {
                // a fresh segment takes the name of the row that opens it
                self.rows = 0;
                slot.insert(open_segment(&self.class, req.lsn)?)
            }
        };

        let row = Row::new(req.lsn, req.payload.clone());
        let written = seg.append_row(&row)?;
        seg.flush()?;

        if self.class.fsync_delay > 0.0 {
            let due = match self.last_fsync {
                None => true,
                Some(at) => at.elapsed().as_secs_f64() >= self.class.fsync_delay,
            };
            if due {
                seg.sync_data()?;
                self.last_fsync = Some(Instant::now());
                self.stats.write().fsyncs += 1;
            }
        }

        self.rows += 1;
        {
            let mut stats = self.stats.write();
            stats.rows_written += 1;
            stats.bytes_written += written as u64;
        }

        let rows_per_file = self.class.rows_per_file;
        let finished = if rows_per_file > 0
            && (self.rows >= rows_per_file || (req.lsn + 1) % rows_per_file as i64 == 0)
        {
            self.rows = 0;
            self.current.take()
        } else {
            None
        };
        Ok(finished)
    }
}

/// Open the next segment, resolving name conflicts left by an earlier
/// incarnation by bumping the numeric tail, up to 10.
fn open_segment(class: &SegmentClass, lsn: i64) -> Result<SegmentWriter> {
    for suffix in 0..10u32 {
        match SegmentWriter::create(class, lsn, NameSuffix::conflict(suffix)) {
            Ok(seg) => return Ok(seg),
            Err(WalError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(WalError::NameConflict(format!(
        "too many name conflicts for lsn {}",
        lsn
    )))
}
