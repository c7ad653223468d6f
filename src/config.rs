//! Options consumed by the value log (§6).

use std::path::PathBuf;
use std::time::Duration;

use crate::consts::*;

#[derive(Debug, Clone)]
pub struct Options {
    pub value_dir: PathBuf,
    pub value_log_file_size: u64,
    pub value_log_max_entries: u32,
    /// Values at or above this size are stored in the value log; smaller
    /// values are inlined directly in the LSM (`skip_vlog`, SPEC_FULL §10.5).
    pub value_threshold: usize,
    pub sync_writes: bool,
    pub verify_value_checksum: bool,
    pub read_only: bool,
    pub in_memory: bool,
    pub max_batch_count: u64,
    pub max_batch_size: u64,
    pub sample_size_ratio: f64,
    pub sample_count_ratio: f64,
    pub sample_time_budget: Duration,
    pub default_discard_ratio: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            value_dir: PathBuf::from("."),
            value_log_file_size: DEFAULT_VALUE_LOG_FILE_SIZE,
            value_log_max_entries: DEFAULT_VALUE_LOG_MAX_ENTRIES,
            value_threshold: DEFAULT_VALUE_THRESHOLD,
            sync_writes: false,
            verify_value_checksum: false,
            read_only: false,
            in_memory: false,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            sample_size_ratio: DEFAULT_SAMPLE_SIZE_RATIO,
            sample_count_ratio: DEFAULT_SAMPLE_COUNT_RATIO,
            sample_time_budget: DEFAULT_SAMPLE_TIME_BUDGET,
            default_discard_ratio: DEFAULT_DISCARD_RATIO,
        }
    }
}

impl Options {
    pub fn new(value_dir: impl Into<PathBuf>) -> Self {
        Self {
            value_dir: value_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_value_log_file_size(mut self, size: u64) -> Self {
        self.value_log_file_size = size.min(MAX_VLOG_FILE_SIZE);
        self
    }

    pub fn with_value_log_max_entries(mut self, n: u32) -> Self {
        self.value_log_max_entries = n;
        self
    }

    pub fn with_value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_verify_value_checksum(mut self, verify: bool) -> Self {
        self.verify_value_checksum = verify;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn with_max_batch_count(mut self, n: u64) -> Self {
        self.max_batch_count = n;
        self
    }

    pub fn with_max_batch_size(mut self, n: u64) -> Self {
        self.max_batch_size = n;
        self
    }
}
