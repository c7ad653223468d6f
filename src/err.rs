//! Error hierarchy for the value log.
//!
//! `Truncate` and the control-flow `Stop` signal described in the design are
//! deliberately *not* represented the same way as the rest: a truncated tail
//! is something [`crate::vlog::log_file::LogFile::iterate`] recovers from on
//! its own and reports back as a plain end offset, and `Stop` never leaves an
//! iteration closure. Everything that actually escapes to a caller lives here.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum VLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record at offset {offset} in {file:?} is truncated; last valid offset is {valid_offset}")]
    Truncate {
        file: PathBuf,
        offset: u32,
        valid_offset: u32,
    },

    #[error("checksum mismatch for fid {fid} at offset {offset}")]
    ChecksumMismatch { fid: u32, offset: u32 },

    #[error("candidate file was not worth rewriting")]
    NoRewrite,

    #[error("garbage collection is already running")]
    Rejected,

    #[error("transaction too big to commit in one batch")]
    TxnTooBig,

    #[error("key of length {len} exceeds the maximum key size")]
    KeyTooLarge { len: usize },

    #[error("value of length {len} exceeds the maximum value size")]
    ValueTooLarge { len: usize },

    #[error("write would push file past the maximum value log file size")]
    FileSizeExceeded,

    #[error("fid {0} not found")]
    UnknownFid(u32),

    #[error("value log is closed")]
    Closed,

    #[error("encryption error: {0}")]
    Encryption(String),
}

pub type Result<T> = std::result::Result<T, VLogError>;
