//! The multi-file registry: fid bookkeeping, rotation, the write pipeline,
//! read dispatch, and deferred deletion (§4.2, §4.3).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};

use crate::codec::{decode_entry, encode_entry};
use crate::config::Options;
use crate::consts::*;
use crate::crypto::{DataKey, KeyRegistry};
use crate::discard::DiscardStats;
use crate::err::{Result, VLogError};
use crate::types::{Entry, Fid, ValuePointer};
use crate::vlog::log_file::{IterAction, LogFile};

/// Values shorter than `value_threshold` are inlined into the LSM instead of
/// being appended to the value log; `write` emits a zero [`ValuePointer`] for
/// them (§4.3 "`skipVlog(e)` ... emit a zero pointer", SPEC_FULL §10.5).
fn skip_vlog(entry: &Entry, value_threshold: usize) -> bool {
    entry.value.len() < value_threshold
}

struct FileRegistry {
    /// All files currently readable, keyed by fid. The highest fid is always
    /// the writable head (§4.2).
    files: BTreeMap<Fid, Arc<LogFile>>,
}

/// Held for the duration of a GC/rewrite pass; dropping it (including on
/// panic unwind) returns the single token so the next pass can proceed.
pub struct GcGuard(Sender<()>);

impl Drop for GcGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub struct ValueLog {
    opts: Options,
    key_registry: Option<Arc<dyn KeyRegistry>>,
    files: RwLock<FileRegistry>,
    max_fid: AtomicU32,
    /// Entries written to the current head since it was created; reset on
    /// rotation. Drives the count-based rotation trigger (§3, §4.2).
    num_entries_written: AtomicU32,
    num_active_iterators: AtomicI32,
    files_to_be_deleted: RwLock<Vec<Fid>>,
    discard: DiscardStats,
    /// Bounded-1 channel used purely as a mutual-exclusion gate: a GC pass
    /// takes the single token and returns it on drop, matching §5's "a single
    /// bounded channel" concurrency primitive.
    gc_token_tx: Sender<()>,
    gc_token_rx: Receiver<()>,
}

impl ValueLog {
    /// Opens (or creates) the value log rooted at `opts.value_dir`, replaying
    /// the previous head to find its true end and then always starting a
    /// fresh head file (§4.2).
    pub fn open(opts: Options, key_registry: Option<Arc<dyn KeyRegistry>>) -> Result<Self> {
        std::fs::create_dir_all(&opts.value_dir)?;

        let mut fids = Self::existing_fids(&opts.value_dir)?;
        fids.sort_unstable();

        let mut files = BTreeMap::new();
        let mut max_fid: Fid;

        if fids.is_empty() {
            let key_id = key_registry.as_ref().map(|r| r.latest_key_id()).unwrap_or(0);
            let head = LogFile::create_head(
                Self::path_for(&opts.value_dir, 0),
                0,
                opts.value_log_file_size * 2,
                key_id,
            )?;
            files.insert(0, Arc::new(head));
            max_fid = 0;
        } else {
            for (i, &fid) in fids.iter().enumerate() {
                let is_last = i == fids.len() - 1;
                let path = Self::path_for(&opts.value_dir, fid);

                if is_last {
                    let head = LogFile::open_existing(path.clone(), fid, true)?;
                    let cipher_key = Self::resolve_cipher(&key_registry, head.key_id)?;
                    let cipher = cipher_key.as_ref().map(|k| (k, &head.base_iv));
                    // `size` is only known to be file_len here, which for a
                    // preallocated head includes trailing zero-fill; iterate
                    // stops there anyway because the CRC check fails on the
                    // first all-zero "record" it decodes.
                    let end_offset = head.iterate(VLOG_HEADER_SIZE as u32, true, cipher, |_, _| {
                        IterAction::Continue
                    })?;
                    head.done_writing(end_offset)?;
                    info!("recovered head fid {fid} at offset {end_offset}");
                    files.insert(fid, Arc::new(head));
                } else {
                    let frozen = LogFile::open_existing(path, fid, false)?;
                    files.insert(fid, Arc::new(frozen));
                }
                max_fid = fid;
            }

            let next_fid = max_fid + 1;
            let key_id = key_registry.as_ref().map(|r| r.latest_key_id()).unwrap_or(0);
            let head = LogFile::create_head(
                Self::path_for(&opts.value_dir, next_fid),
                next_fid,
                opts.value_log_file_size * 2,
                key_id,
            )?;
            files.insert(next_fid, Arc::new(head));
            max_fid = next_fid;
        }

        let discard = DiscardStats::open(opts.value_dir.join(DISCARD_STATS_FILE_NAME))?;
        let (gc_token_tx, gc_token_rx) = bounded(1);
        gc_token_tx.send(()).ok();

        Ok(Self {
            opts,
            key_registry,
            files: RwLock::new(FileRegistry { files }),
            max_fid: AtomicU32::new(max_fid),
            num_entries_written: AtomicU32::new(0),
            num_active_iterators: AtomicI32::new(0),
            files_to_be_deleted: RwLock::new(Vec::new()),
            discard,
            gc_token_tx,
            gc_token_rx,
        })
    }

    fn existing_fids(dir: &std::path::Path) -> Result<Vec<Fid>> {
        let mut fids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VLOG_FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(fid) = stem.parse::<Fid>() {
                    fids.push(fid);
                }
            }
        }
        Ok(fids)
    }

    fn path_for(dir: &std::path::Path, fid: Fid) -> PathBuf {
        dir.join(vlog_file_name(fid))
    }

    fn resolve_cipher(
        key_registry: &Option<Arc<dyn KeyRegistry>>,
        key_id: u64,
    ) -> Result<Option<DataKey>> {
        if key_id == 0 {
            return Ok(None);
        }
        match key_registry {
            Some(reg) => reg.data_key(key_id),
            None => Ok(None),
        }
    }

    pub fn opts(&self) -> &Options {
        &self.opts
    }

    pub fn discard(&self) -> &DiscardStats {
        &self.discard
    }

    pub fn head_fid(&self) -> Fid {
        self.max_fid.load(Ordering::Acquire)
    }

    /// Snapshot of every currently-readable fid, oldest first. Used by the
    /// sampler and GC candidate search.
    pub fn fids(&self) -> Vec<Fid> {
        self.files.read().unwrap().files.keys().copied().collect()
    }

    pub(crate) fn file(&self, fid: Fid) -> Result<Arc<LogFile>> {
        self.files
            .read()
            .unwrap()
            .files
            .get(&fid)
            .cloned()
            .ok_or(VLogError::UnknownFid(fid))
    }

    /// Encodes and appends `entries` to the head file, rotating first if the
    /// batch wouldn't fit. Entries below `value_threshold` are not written at
    /// all; they get a zero pointer, and the LSM is expected to inline their
    /// value directly. Returns one [`ValuePointer`] per entry, in order
    /// (§4.2, §4.3).
    pub fn write(&self, entries: &[Entry]) -> Result<Vec<ValuePointer>> {
        let mut pointers = Vec::with_capacity(entries.len());
        let file_capacity = self.opts.value_log_file_size * 2;

        for entry in entries {
            if skip_vlog(entry, self.opts.value_threshold) {
                pointers.push(ValuePointer::default());
                continue;
            }

            // Upfront size check (§4.3/§8.8 `validateWrites`): an entry that
            // can never fit in a freshly-rotated head must fail fast instead
            // of looping through rotations forever.
            let max_record_size =
                (MAX_HEADER_SIZE + entry.key.len() + entry.value.len() + CRC_SIZE) as u64;
            if max_record_size > file_capacity {
                return Err(VLogError::FileSizeExceeded);
            }

            loop {
                let head_fid = self.head_fid();
                let head = self.file(head_fid)?;
                let cipher_key = Self::resolve_cipher(&self.key_registry, head.key_id)?;
                let cipher = cipher_key.as_ref().map(|k| (k, &head.base_iv));

                let offset = head.write_at();
                let mut buf = Vec::new();
                encode_entry(&mut buf, entry, offset, cipher)?;

                match head.append(&buf) {
                    Ok(written_at) => {
                        pointers.push(ValuePointer {
                            fid: head_fid,
                            offset: written_at,
                            len: buf.len() as u32,
                        });
                        let entries_written =
                            self.num_entries_written.fetch_add(1, Ordering::AcqRel) + 1;
                        if head.write_at() as u64 >= self.opts.value_log_file_size
                            || entries_written as u64 >= self.opts.value_log_max_entries as u64
                        {
                            self.rotate()?;
                        }
                        break;
                    }
                    Err(VLogError::FileSizeExceeded) => {
                        self.rotate()?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if self.opts.sync_writes {
            self.sync()?;
        }

        Ok(pointers)
    }

    /// Freezes the current head and opens a new one (§4.2).
    pub fn rotate(&self) -> Result<()> {
        let mut registry = self.files.write().unwrap();
        let old_fid = self.max_fid.load(Ordering::Acquire);
        if let Some(old_head) = registry.files.get(&old_fid) {
            old_head.done_writing(old_head.write_at())?;
        }

        let new_fid = old_fid + 1;
        let key_id = self
            .key_registry
            .as_ref()
            .map(|r| r.latest_key_id())
            .unwrap_or(0);
        let new_head = LogFile::create_head(
            Self::path_for(&self.opts.value_dir, new_fid),
            new_fid,
            self.opts.value_log_file_size * 2,
            key_id,
        )?;
        registry.files.insert(new_fid, Arc::new(new_head));
        self.max_fid.store(new_fid, Ordering::Release);
        self.num_entries_written.store(0, Ordering::Release);
        info!("rotated value log: new head fid {new_fid}");
        Ok(())
    }

    /// Reads the value referenced by `vp`, verifying its checksum if
    /// `opts.verify_value_checksum` is set.
    ///
    /// A pointer into the head file is rejected if its offset has not
    /// actually been written yet: the head's mmap is preallocated well past
    /// `write_at`, so without this check a stale or bogus pointer into that
    /// padding would decode as a spurious empty record instead of erroring
    /// (§4.2/§4.3/§5 "check `pointer.offset < writableLogOffset`").
    pub fn read(&self, vp: ValuePointer) -> Result<Bytes> {
        let file = self.file(vp.fid)?;
        if vp.fid == self.head_fid() && vp.offset >= file.write_at() {
            return Err(VLogError::Truncate {
                file: file.path.clone(),
                offset: vp.offset,
                valid_offset: file.write_at(),
            });
        }
        let raw = file.read_at(vp.offset, vp.len)?;

        let cipher_key = Self::resolve_cipher(&self.key_registry, file.key_id)?;
        let cipher = cipher_key.as_ref().map(|k| (k, &file.base_iv));

        let decoded = decode_entry(&raw, vp.offset, self.opts.verify_value_checksum, cipher)
            .map_err(|_| VLogError::ChecksumMismatch {
                fid: vp.fid,
                offset: vp.offset,
            })?;

        Ok(Bytes::from(decoded.entry.value))
    }

    pub fn sync(&self) -> Result<()> {
        let head_fid = self.head_fid();
        self.file(head_fid)?.sync()
    }

    pub fn incr_iterator_count(&self) {
        self.num_active_iterators.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops the iterator reference count; physically deletes any files
    /// queued by [`ValueLog::mark_for_deletion`] once it reaches zero (§4.3
    /// "deferred deletion").
    pub fn decr_iterator_count(&self) -> Result<()> {
        let remaining = self.num_active_iterators.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining != 0 {
            return Ok(());
        }

        let mut pending = self.files_to_be_deleted.write().unwrap();
        for fid in pending.drain(..) {
            let path = Self::path_for(&self.opts.value_dir, fid);
            if let Err(e) = LogFile::delete(&path) {
                warn!("failed to delete vlog file {fid}: {e}");
            } else {
                debug!("deleted vlog file {fid}");
            }
        }
        Ok(())
    }

    /// Removes `fid` from the registry so new reads see it as gone, then
    /// either deletes it immediately (no active iterators) or defers the
    /// unlink until the iterator count drops to zero.
    pub(crate) fn mark_for_deletion(&self, fid: Fid) -> Result<()> {
        {
            let mut registry = self.files.write().unwrap();
            registry.files.remove(&fid);
        }

        if self.num_active_iterators.load(Ordering::Acquire) == 0 {
            let path = Self::path_for(&self.opts.value_dir, fid);
            LogFile::delete(&path)?;
        } else {
            self.files_to_be_deleted.write().unwrap().push(fid);
        }
        Ok(())
    }

    /// Attempts to take the single GC slot. Returns [`VLogError::Rejected`]
    /// if a pass is already running (§4.3 "one GC/rewrite at a time").
    pub(crate) fn try_acquire_gc(&self) -> Result<GcGuard> {
        match self.gc_token_rx.try_recv() {
            Ok(()) => Ok(GcGuard(self.gc_token_tx.clone())),
            Err(TryRecvError::Empty) => Err(VLogError::Rejected),
            Err(TryRecvError::Disconnected) => Err(VLogError::Closed),
        }
    }

    pub(crate) fn resolve_cipher_for(&self, key_id: u64) -> Result<Option<DataKey>> {
        Self::resolve_cipher(&self.key_registry, key_id)
    }

    pub fn close(&self) -> Result<()> {
        let registry = self.files.read().unwrap();
        for file in registry.files.values() {
            file.close(None)?;
        }
        self.discard.flush()
    }

    /// Deletes every value log file and recreates a fresh, empty head at
    /// fid 1. Returns the number of files removed (§4.3 "public contract",
    /// §6 "Interfaces exposed to the LSM").
    pub fn drop_all(&self) -> Result<usize> {
        let mut registry = self.files.write().unwrap();
        let old_fids: Vec<Fid> = registry.files.keys().copied().collect();

        for (&fid, file) in registry.files.iter() {
            file.close(None)?;
            LogFile::delete(&Self::path_for(&self.opts.value_dir, fid))?;
        }
        registry.files.clear();

        for &fid in &old_fids {
            self.discard.update(fid, -1)?;
        }
        self.discard.compact()?;

        let key_id = self
            .key_registry
            .as_ref()
            .map(|r| r.latest_key_id())
            .unwrap_or(0);
        let head = LogFile::create_head(
            Self::path_for(&self.opts.value_dir, 1),
            1,
            self.opts.value_log_file_size * 2,
            key_id,
        )?;
        registry.files.insert(1, Arc::new(head));
        self.max_fid.store(1, Ordering::Release);
        self.num_entries_written.store(0, Ordering::Release);
        self.files_to_be_deleted.write().unwrap().clear();

        info!("dropped all value log files; recreated head at fid 1");
        Ok(old_fids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entry;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new(dir.path()).with_value_threshold(0);
        let vlog = ValueLog::open(opts, None).unwrap();

        let entries = vec![Entry::new("k1", "v1"), Entry::new("k2", "v2")];
        let pointers = vlog.write(&entries).unwrap();
        assert_eq!(pointers.len(), 2);

        assert_eq!(&vlog.read(pointers[0]).unwrap()[..], b"v1");
        assert_eq!(&vlog.read(pointers[1]).unwrap()[..], b"v2");
    }

    #[test]
    fn rotation_creates_a_new_head() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new(dir.path())
            .with_value_log_file_size(60)
            .with_value_threshold(0);
        let vlog = ValueLog::open(opts, None).unwrap();

        for i in 0..5u32 {
            let entries = vec![Entry::new(format!("key-{i}"), "0123456789012345678901234")];
            vlog.write(&entries).unwrap();
        }

        assert!(vlog.head_fid() > 0);
        assert!(vlog.fids().len() >= 2);
    }

    #[test]
    fn gc_gate_allows_only_one_holder_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let vlog = ValueLog::open(Options::new(dir.path()), None).unwrap();

        let guard = vlog.try_acquire_gc().unwrap();
        let err = vlog.try_acquire_gc().unwrap_err();
        assert!(matches!(err, VLogError::Rejected));

        drop(guard);
        assert!(vlog.try_acquire_gc().is_ok());
    }

    #[test]
    fn reopen_recovers_previous_head_and_starts_a_fresh_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let first_fid;
        {
            let opts = Options::new(&path).with_value_threshold(0);
            let vlog = ValueLog::open(opts, None).unwrap();
            vlog.write(&[Entry::new("k", "v")]).unwrap();
            first_fid = vlog.head_fid();
        }

        let vlog = ValueLog::open(Options::new(&path).with_value_threshold(0), None).unwrap();
        assert!(vlog.head_fid() > first_fid);
        assert!(vlog.fids().contains(&first_fid));
    }

    #[test]
    fn values_under_the_threshold_are_inlined_with_a_zero_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new(dir.path()).with_value_threshold(100);
        let vlog = ValueLog::open(opts, None).unwrap();

        let pointers = vlog.write(&[Entry::new("k", "short")]).unwrap();
        assert!(pointers[0].is_zero());
    }

    #[test]
    fn an_entry_too_big_for_any_head_fails_fast_instead_of_looping() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new(dir.path())
            .with_value_log_file_size(32)
            .with_value_threshold(0);
        let vlog = ValueLog::open(opts, None).unwrap();

        let huge_value = vec![0u8; 1024];
        let err = vlog.write(&[Entry::new("k", huge_value)]).unwrap_err();
        assert!(matches!(err, VLogError::FileSizeExceeded));
    }

    #[test]
    fn drop_all_deletes_every_file_and_restarts_at_fid_one() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::new(dir.path())
            .with_value_log_file_size(60)
            .with_value_threshold(0);
        let vlog = ValueLog::open(opts, None).unwrap();

        for i in 0..5u32 {
            vlog.write(&[Entry::new(format!("key-{i}"), "0123456789012345678901234")])
                .unwrap();
        }
        assert!(vlog.fids().len() >= 2);

        let removed = vlog.drop_all().unwrap();
        assert!(removed >= 2);
        assert_eq!(vlog.fids(), vec![1]);
        assert_eq!(vlog.head_fid(), 1);

        let pointers = vlog.write(&[Entry::new("k", "v")]).unwrap();
        assert_eq!(&vlog.read(pointers[0]).unwrap()[..], b"v");
    }
}
