//! Persisted discard-byte accounting per fid (§4.3, SPEC_FULL §10.5).
//!
//! An append-only log of `(fid, delta)` records backs an in-memory running
//! total per fid. The log is periodically compacted back down to one record
//! per fid so it never grows unbounded relative to the number of files.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::err::Result;
use crate::types::Fid;

const RECORD_SIZE: usize = 4 + 8;
/// Compact once this many records have been appended since the last compaction.
const COMPACT_THRESHOLD: usize = 256;

struct Inner {
    file: File,
    map: BTreeMap<Fid, i64>,
    records_since_compact: usize,
}

pub struct DiscardStats {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl DiscardStats {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut map = BTreeMap::new();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        for chunk in buf.chunks_exact(RECORD_SIZE) {
            let fid = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let delta = i64::from_le_bytes(chunk[4..12].try_into().unwrap());
            if delta == -1 {
                map.insert(fid, 0);
            } else {
                *map.entry(fid).or_insert(0) += delta;
            }
        }

        let records_since_compact = buf.len() / RECORD_SIZE;

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                map,
                records_since_compact,
            }),
        })
    }

    /// Adds `delta` bytes of discard for `fid`, returning its new running
    /// total. `delta == -1` is a sentinel meaning "reset to zero, file
    /// deleted" (§4.4 public contract) rather than an actual byte count.
    pub fn update(&self, fid: Fid, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        Self::append_record(&mut inner.file, fid, delta)?;
        let total = if delta == -1 {
            inner.map.insert(fid, 0);
            0
        } else {
            let total = inner.map.entry(fid).or_insert(0);
            *total += delta;
            *total
        };
        inner.records_since_compact += 1;

        if inner.records_since_compact >= COMPACT_THRESHOLD {
            Self::compact_locked(&self.path, &mut inner)?;
        }
        Ok(total)
    }

    pub fn update_many(&self, deltas: &[(Fid, i64)]) -> Result<()> {
        for &(fid, delta) in deltas {
            self.update(fid, delta)?;
        }
        Ok(())
    }

    /// The fid with the largest accumulated discard, if any is nonzero.
    pub fn max_discard(&self) -> Option<(Fid, i64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .map
            .iter()
            .filter(|&(_, &total)| total > 0)
            .max_by_key(|&(_, &total)| total)
            .map(|(&fid, &total)| (fid, total))
    }

    pub fn get(&self, fid: Fid) -> i64 {
        self.inner.lock().unwrap().map.get(&fid).copied().unwrap_or(0)
    }

    fn append_record(file: &mut File, fid: Fid, delta: i64) -> Result<()> {
        file.seek(SeekFrom::End(0))?;
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&fid.to_le_bytes());
        buf[4..12].copy_from_slice(&delta.to_le_bytes());
        file.write_all(&buf)?;
        Ok(())
    }

    /// Rewrites the log as one record per fid, collapsing history.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::compact_locked(&self.path, &mut inner)
    }

    fn compact_locked(path: &PathBuf, inner: &mut Inner) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        for (&fid, &total) in inner.map.iter() {
            if total == 0 {
                continue;
            }
            Self::append_record(&mut file, fid, total)?;
        }
        file.sync_all()?;
        inner.file = file;
        inner.records_since_compact = 0;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().unwrap().file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DISCARD");

        {
            let stats = DiscardStats::open(path.clone()).unwrap();
            stats.update(1, 100).unwrap();
            stats.update(1, 50).unwrap();
            stats.update(2, 10).unwrap();
            assert_eq!(stats.get(1), 150);
        }

        let reopened = DiscardStats::open(path).unwrap();
        assert_eq!(reopened.get(1), 150);
        assert_eq!(reopened.get(2), 10);
        assert_eq!(reopened.max_discard(), Some((1, 150)));
    }

    #[test]
    fn compaction_collapses_history_without_losing_totals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DISCARD");
        let stats = DiscardStats::open(path.clone()).unwrap();

        for _ in 0..10 {
            stats.update(7, 5).unwrap();
        }
        stats.compact().unwrap();
        assert_eq!(stats.get(7), 50);

        let reopened = DiscardStats::open(path).unwrap();
        assert_eq!(reopened.get(7), 50);
    }
}
