// MemWAL - Write-ahead log and recovery engine for in-memory databases
// Core library module

pub mod error;
pub mod log;
pub mod recovery;
pub mod snapshot;
pub mod writer;

pub use error::{Result, WalError};
pub use log::row::Row;
pub use recovery::{RecoveryController, RowHandler};
pub use snapshot::SnapshotSink;
pub use writer::{WalWriterHandle, WriterStats};

use std::path::PathBuf;

/// Durability engine configuration.
///
/// `snap_dir` and `wal_dir` may point at the same directory; the file
/// suffix keeps the two families apart.
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub snap_dir: PathBuf,
    pub wal_dir: PathBuf,
    /// Rows per xlog segment before rotation.
    pub rows_per_file: u64,
    /// Minimum seconds between fsyncs; 0 flushes without fsync.
    pub fsync_delay: f64,
    /// Writer mailbox capacity.
    pub inbox_size: usize,
    /// Do not spawn a writer at all.
    pub readonly: bool,
    /// Follow-mode poll period, seconds.
    pub wal_dir_rescan_delay: f64,
    /// Snapshot emission cap, bytes per second; 0 = unlimited.
    pub snap_io_rate_limit: u64,
    /// Treat a corrupt snapshot row as fatal instead of skipping it.
    pub panic_on_snap_error: bool,
    /// Treat a corrupt xlog row as fatal instead of skipping it.
    pub panic_on_wal_error: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            snap_dir: PathBuf::from("./snap"),
            wal_dir: PathBuf::from("./wal"),
            rows_per_file: 50_000,
            fsync_delay: 0.0,
            inbox_size: 128,
            readonly: false,
            wal_dir_rescan_delay: 0.1,
            snap_io_rate_limit: 0,
            panic_on_snap_error: true,
            panic_on_wal_error: false,
        }
    }
}
