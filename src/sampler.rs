//! Discard-ratio estimation for GC candidate files (§4.3).
//!
//! Scans a bounded, randomly-positioned window of a file instead of the
//! whole thing, stopping early once either the sample window, the entry
//! count cap, or the wall-clock budget is exhausted.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::consts::VLOG_HEADER_SIZE;
use crate::err::Result;
use crate::lsm::LsmEngine;
use crate::types::{parse_ts, Entry, EntryMeta, Fid, ValuePointer};
use crate::vlog::{IterAction, ValueLog};

#[derive(Debug, Clone, Copy)]
pub struct SampleResult {
    pub fid: Fid,
    pub sampled_bytes: u64,
    pub discarded_bytes: u64,
    pub sampled_count: u64,
    /// Target window size the sample was drawn against (§4.3).
    pub window_size: u64,
    /// Target entry-count cap the sample was drawn against (§4.3).
    pub max_entries: u64,
}

impl SampleResult {
    pub fn discard_ratio(&self) -> f64 {
        if self.sampled_bytes == 0 {
            0.0
        } else {
            self.discarded_bytes as f64 / self.sampled_bytes as f64
        }
    }

    /// True when the sample stopped (EOF, time budget) before covering
    /// enough of the file to trust the discard ratio (§4.3).
    fn under_filled(&self) -> bool {
        self.sampled_count < self.max_entries && (self.sampled_bytes as f64) < 0.75 * self.window_size as f64
    }
}

/// `NoRewrite` whenever the sample is statistically too small to trust,
/// regardless of the observed ratio; otherwise, rewrite once discard meets
/// the threshold (§4.3 "`(sampled_count < countWindow && sampled_size <
/// 0.75 × sizeWindow) || discard < discardRatio × total`").
pub fn should_rewrite(result: &SampleResult, discard_ratio_threshold: f64) -> bool {
    if result.under_filled() {
        return false;
    }
    result.discard_ratio() >= discard_ratio_threshold
}

/// Returns whether the on-disk copy at `vp` is superseded: deleted, expired,
/// inlined back into the LSM below the value threshold, or no longer the
/// current value pointer for `entry.key`.
pub fn discard_entry(entry: &Entry, vp: &ValuePointer, lsm: &dyn LsmEngine, now_unix: u64) -> bool {
    if entry.is_deleted_or_expired(now_unix) {
        return true;
    }

    let current = lsm.get(&entry.key);
    if current.is_empty() {
        return true;
    }
    if !current.meta.contains(EntryMeta::VALUE_POINTER) {
        // The LSM now holds this key's value inline; the vlog copy is stale.
        return true;
    }

    if current.version != parse_ts(&entry.key) {
        return true;
    }

    match ValuePointer::decode(&current.value) {
        Ok(current_vp) => current_vp != *vp,
        Err(_) => true,
    }
}

/// Samples `fid` and estimates what fraction of its bytes are discardable.
pub fn sample(vlog: &ValueLog, fid: Fid, lsm: &dyn LsmEngine, now_unix: u64) -> Result<SampleResult> {
    let opts = vlog.opts();
    let file = vlog.file(fid)?;
    let file_size = file.size() as u64;

    let window_size = ((file_size as f64) * opts.sample_size_ratio) as u64;
    let max_entries =
        ((opts.value_log_max_entries as f64) * opts.sample_count_ratio).ceil() as u64;

    let header = VLOG_HEADER_SIZE as u64;
    let latest_start = file_size.saturating_sub(window_size).max(header);
    let start_offset = if latest_start > header {
        rand::thread_rng().gen_range(header..=latest_start)
    } else {
        header
    } as u32;

    let deadline = Instant::now() + opts.sample_time_budget.max(Duration::from_millis(1));
    let cipher_key = vlog.resolve_cipher_for(file.key_id)?;
    let cipher = cipher_key.as_ref().map(|k| (k, &file.base_iv));

    let mut sampled_bytes = 0u64;
    let mut discarded_bytes = 0u64;
    let mut count = 0u64;

    file.iterate(start_offset, opts.verify_value_checksum, cipher, |entry, vp| {
        if Instant::now() >= deadline {
            return IterAction::Stop;
        }

        sampled_bytes += vp.len as u64;
        count += 1;
        if discard_entry(entry, vp, lsm, now_unix) {
            discarded_bytes += vp.len as u64;
        }

        if sampled_bytes >= window_size.max(1) || count >= max_entries.max(1) {
            IterAction::Stop
        } else {
            IterAction::Continue
        }
    })?;

    Ok(SampleResult {
        fid,
        sampled_bytes,
        discarded_bytes,
        sampled_count: count,
        window_size,
        max_entries,
    })
}
