//! Magic numbers and on-disk layout constants for the value log.

use std::time::Duration;

/// Size in bytes of a log file's fixed header: `keyID (8) ∥ baseIV (12)`.
pub const VLOG_HEADER_SIZE: usize = KEY_ID_SIZE + BASE_IV_SIZE;
pub const KEY_ID_SIZE: usize = 8;
pub const BASE_IV_SIZE: usize = 12;

/// Record payloads are framed with a trailing CRC32 (Castagnoli).
pub const CRC_SIZE: usize = 4;

/// Worst-case size of an encoded record header (three varints + two raw bytes).
pub const MAX_HEADER_SIZE: usize = 5 + 5 + 10 + 1 + 1;

/// Keys larger than this are never valid; a decoded `klen` at or above this
/// bound means the record is corrupt and the tail must be truncated.
pub const MAX_KEY_SIZE: u64 = 1 << 16;

/// Offsets into a value log file are `u32`, capping any single file at this size.
pub const MAX_VLOG_FILE_SIZE: u64 = u32::MAX as u64;

pub const VLOG_FILE_EXTENSION: &str = "vlog";
pub const DISCARD_STATS_FILE_NAME: &str = "DISCARD";

pub fn vlog_file_name(fid: u32) -> String {
    format!("{fid:06}.{VLOG_FILE_EXTENSION}")
}

pub const DEFAULT_VALUE_LOG_FILE_SIZE: u64 = 1 << 30; // 1 GiB
pub const DEFAULT_VALUE_LOG_MAX_ENTRIES: u32 = 1_000_000;
pub const DEFAULT_VALUE_THRESHOLD: usize = 1 << 20; // 1 MiB
pub const DEFAULT_MAX_BATCH_COUNT: u64 = 1_000;
pub const DEFAULT_MAX_BATCH_SIZE: u64 = 10 << 20; // 10 MiB
pub const DEFAULT_DISCARD_RATIO: f64 = 0.5;

/// Fraction of a candidate file's size inspected while sampling (§4.3).
pub const DEFAULT_SAMPLE_SIZE_RATIO: f64 = 0.1;
/// Fraction of `ValueLogMaxEntries` inspected while sampling (§4.3).
pub const DEFAULT_SAMPLE_COUNT_RATIO: f64 = 0.01;
/// Hard wall-clock cap on a single sampling pass.
pub const DEFAULT_SAMPLE_TIME_BUDGET: Duration = Duration::from_secs(10);

/// Entries flushed per chunk on the final, adaptive-backoff rewrite flush.
pub const FINAL_FLUSH_CHUNK_SIZE: usize = 1024;
