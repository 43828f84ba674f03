use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Corruption(String),

    #[error("bad segment header: {0}")]
    Header(String),

    #[error("no snapshot found; did you forget to initialize storage with --init_storage?")]
    NoSnapshot,

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("lsn {0} already confirmed")]
    DoubleConfirm(i64),

    #[error("wal writer inbox is full")]
    Busy,

    #[error("wal writer returned error status")]
    WriteFailed,

    #[error("wal writer is gone")]
    WriterGone,

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

pub type Result<T> = std::result::Result<T, WalError>;
