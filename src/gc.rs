//! Garbage collection driver: candidate selection and rewrite-through-LSM
//! (§4.3).

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::consts::{FINAL_FLUSH_CHUNK_SIZE, VLOG_HEADER_SIZE};
use crate::err::{Result, VLogError};
use crate::lsm::LsmEngine;
use crate::sampler::{self, SampleResult};
use crate::types::{EntryMeta, Fid};
use crate::vlog::{IterAction, ValueLog};

#[derive(Debug, Clone, Copy)]
pub struct GcOutcome {
    pub fid: Fid,
    pub sample: SampleResult,
    pub rewritten_entries: u64,
    pub rewritten_bytes: u64,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Picks the file with the largest recorded discard total; falls back to a
/// randomized pick biased toward older fids when discard stats have nothing
/// to go on (a fresh value log, or one whose stats were just compacted).
fn pick_candidate(vlog: &ValueLog) -> Option<Fid> {
    let head = vlog.head_fid();

    if let Some((fid, total)) = vlog.discard().max_discard() {
        if total > 0 && fid != head {
            return Some(fid);
        }
    }

    let mut candidates: Vec<Fid> = vlog.fids().into_iter().filter(|&f| f != head).collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_unstable();

    // Square a uniform [0,1) draw to bias the index toward zero (older fids
    // are more likely to be fully superseded and cheaper to rewrite).
    let r: f64 = rand::thread_rng().gen::<f64>();
    let idx = ((r * r) * candidates.len() as f64) as usize;
    Some(candidates[idx.min(candidates.len() - 1)])
}

/// Sends `entries` through `lsm.batch_set`, halving the batch on
/// [`VLogError::TxnTooBig`] until it fits or a single entry alone doesn't.
fn flush_with_backoff(lsm: &dyn LsmEngine, mut entries: Vec<crate::types::Entry>) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    match lsm.batch_set(entries.clone()) {
        Ok(()) => Ok(()),
        Err(VLogError::TxnTooBig) if entries.len() > 1 => {
            let tail = entries.split_off(entries.len() / 2);
            flush_with_backoff(lsm, entries)?;
            flush_with_backoff(lsm, tail)
        }
        // Can't halve a single entry any further (§4.3/§7.2 "aborts with NoRewrite").
        Err(VLogError::TxnTooBig) => Err(VLogError::NoRewrite),
        Err(e) => Err(e),
    }
}

/// Rewrites every live entry of `fid` through the LSM and marks the file for
/// deletion. Assumes the caller already decided `fid` is worth rewriting.
fn rewrite(vlog: &ValueLog, fid: Fid, lsm: &dyn LsmEngine, now: u64) -> Result<(u64, u64)> {
    let file = vlog.file(fid)?;
    let cipher_key = vlog.resolve_cipher_for(file.key_id)?;
    let cipher = cipher_key.as_ref().map(|k| (k, &file.base_iv));

    let mut live = Vec::new();
    file.iterate(VLOG_HEADER_SIZE as u32, true, cipher, |entry, vp| {
        if !sampler::discard_entry(entry, vp, lsm, now) {
            let mut e = entry.clone();
            // Let the LSM re-decide vlog-vs-inline placement on reinsertion.
            e.meta.remove(EntryMeta::VALUE_POINTER);
            live.push(e);
        }
        IterAction::Continue
    })?;

    let rewritten_entries = live.len() as u64;
    let rewritten_bytes: u64 = live
        .iter()
        .map(|e| (e.key.len() + e.value.len()) as u64)
        .sum();

    let chunk_size = FINAL_FLUSH_CHUNK_SIZE.max(1);
    for chunk in live.chunks(chunk_size) {
        flush_with_backoff(lsm, chunk.to_vec())?;
    }

    vlog.mark_for_deletion(fid)?;
    vlog.discard().update(fid, -1)?;

    Ok((rewritten_entries, rewritten_bytes))
}

/// Runs one GC pass: picks a candidate, samples it, and rewrites it if the
/// discard ratio clears `discard_ratio_threshold` (defaults to
/// `opts.default_discard_ratio`). Returns [`VLogError::Rejected`] if a pass
/// is already running, or [`VLogError::NoRewrite`] if no candidate cleared
/// the threshold.
pub fn run_gc(
    vlog: &ValueLog,
    lsm: &dyn LsmEngine,
    discard_ratio_threshold: Option<f64>,
) -> Result<GcOutcome> {
    let _guard = vlog.try_acquire_gc()?;

    let fid = pick_candidate(vlog).ok_or(VLogError::NoRewrite)?;
    let now = now_unix();
    let sample = sampler::sample(vlog, fid, lsm, now)?;

    let threshold = discard_ratio_threshold.unwrap_or(vlog.opts().default_discard_ratio);
    if !sampler::should_rewrite(&sample, threshold) {
        return Err(VLogError::NoRewrite);
    }

    let (rewritten_entries, rewritten_bytes) = rewrite(vlog, fid, lsm, now)?;

    Ok(GcOutcome {
        fid,
        sample,
        rewritten_entries,
        rewritten_bytes,
    })
}
