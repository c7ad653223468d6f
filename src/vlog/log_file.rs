//! One on-disk log file: header, memory map, bounded iteration, and the
//! read/write primitives `ValueLog` builds its write pipeline and read
//! dispatch on top of (§4.2).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::codec::decode_entry;
use crate::consts::{BASE_IV_SIZE, KEY_ID_SIZE, VLOG_HEADER_SIZE};
use crate::crypto::DataKey;
use crate::err::{Result, VLogError};
use crate::types::{Entry, Fid, ValuePointer};

/// Outcome of the closure passed to [`LogFile::iterate`]: mirrors the
/// spec's "aborts with Stop if fn returns Stop" without threading a `Stop`
/// error through `Result` (it never escapes as an error, per §4.1).
pub enum IterAction {
    Continue,
    Stop,
}

enum FileMap {
    Writable(memmap2::MmapMut),
    ReadOnly(memmap2::Mmap),
}

impl FileMap {
    fn as_slice(&self) -> &[u8] {
        match self {
            FileMap::Writable(m) => &m[..],
            FileMap::ReadOnly(m) => &m[..],
        }
    }
}

pub struct LogFile {
    pub fid: Fid,
    pub path: PathBuf,
    file: File,
    map: RwLock<FileMap>,
    /// Next offset the single writer will append at. Only meaningful for the
    /// head file; frozen files keep it equal to `size`.
    write_at: AtomicU32,
    /// Logical length of the written portion of the file (may be less than
    /// the mmap's capacity for a head file, which is preallocated).
    size: AtomicU32,
    pub key_id: u64,
    pub base_iv: [u8; BASE_IV_SIZE],
}

impl LogFile {
    /// Creates a brand-new head file: writes the 20-byte header and
    /// preallocates `prealloc_size` bytes so the writer can append without
    /// remapping (§4.2 "memory-maps up to 2 × ValueLogFileSize").
    pub fn create_head(path: PathBuf, fid: Fid, prealloc_size: u64, key_id: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let base_iv: [u8; BASE_IV_SIZE] = rand::random();
        let mut header = [0u8; VLOG_HEADER_SIZE];
        header[..KEY_ID_SIZE].copy_from_slice(&key_id.to_le_bytes());
        header[KEY_ID_SIZE..].copy_from_slice(&base_iv);
        file.write_all(&header)?;
        file.set_len(prealloc_size.max(VLOG_HEADER_SIZE as u64))?;
        file.sync_all()?;

        let mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };

        Ok(Self {
            fid,
            path,
            file,
            map: RwLock::new(FileMap::Writable(mmap)),
            write_at: AtomicU32::new(VLOG_HEADER_SIZE as u32),
            size: AtomicU32::new(VLOG_HEADER_SIZE as u32),
            key_id,
            base_iv,
        })
    }

    /// Opens a file already on disk. `writable` maps it mutably so the
    /// caller (only used during `ValueLog::open`'s head-recovery step) can
    /// iterate, truncate, and then freeze it with [`LogFile::done_writing`].
    pub fn open_existing(path: PathBuf, fid: Fid, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_reader = &file;
        header_reader.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; VLOG_HEADER_SIZE];
        header_reader.read_exact(&mut header)?;
        let key_id = u64::from_le_bytes(header[..KEY_ID_SIZE].try_into().unwrap());
        let mut base_iv = [0u8; BASE_IV_SIZE];
        base_iv.copy_from_slice(&header[KEY_ID_SIZE..]);

        let file_len = file.metadata()?.len();
        let size = file_len.min(crate::consts::MAX_VLOG_FILE_SIZE) as u32;

        let map = if writable {
            FileMap::Writable(unsafe { memmap2::MmapMut::map_mut(&file)? })
        } else {
            FileMap::ReadOnly(unsafe { memmap2::Mmap::map(&file)? })
        };

        Ok(Self {
            fid,
            path,
            file,
            map: RwLock::new(map),
            write_at: AtomicU32::new(size),
            size: AtomicU32::new(size),
            key_id,
            base_iv,
        })
    }

    pub fn write_at(&self) -> u32 {
        self.write_at.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        matches!(&*self.map.read().unwrap(), FileMap::Writable(_))
    }

    /// Appends `buf` at the current write offset. Only valid for the head
    /// file; the caller (`ValueLog::write`) is the single writer and serializes
    /// all calls, so no additional locking is required beyond the map's own
    /// rwlock (taken briefly here to satisfy Rust's aliasing rules around the
    /// shared mmap — see DESIGN.md for why this differs slightly from the
    /// "writer never holds the per-file lock" aspiration in §5).
    pub fn append(&self, buf: &[u8]) -> Result<u32> {
        let mut guard = self.map.write().unwrap();
        match &mut *guard {
            FileMap::Writable(mmap) => {
                let offset = self.write_at.load(Ordering::Acquire);
                let end = offset as usize + buf.len();
                if end > mmap.len() {
                    return Err(VLogError::FileSizeExceeded);
                }
                mmap[offset as usize..end].copy_from_slice(buf);
                self.write_at.store(end as u32, Ordering::Release);
                self.size.store(end as u32, Ordering::Release);
                Ok(offset)
            }
            FileMap::ReadOnly(_) => Err(VLogError::Closed),
        }
    }

    /// Returns a fresh copy of `len` bytes at `offset`. Copying (rather than
    /// returning a guard borrowing the mmap) avoids a self-referential type
    /// while preserving the read-lock's safety guarantee: the bytes cannot be
    /// unmapped out from under us mid-copy (see DESIGN.md).
    pub fn read_at(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let guard = self.map.read().unwrap();
        let data = guard.as_slice();
        let end = offset as usize + len as usize;
        if end > data.len() {
            return Err(VLogError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of log file",
            )));
        }
        Ok(data[offset as usize..end].to_vec())
    }

    /// Scans records from `start_offset` up to the file's logical `size`,
    /// invoking `f(entry, pointer)` for each. Stops at the first corrupt
    /// record (swallowed, not surfaced) or when `f` returns `Stop`. Returns
    /// the offset one past the last good record (§4.2).
    pub fn iterate(
        &self,
        start_offset: u32,
        verify_crc: bool,
        cipher: Option<(&DataKey, &[u8; BASE_IV_SIZE])>,
        mut f: impl FnMut(&Entry, &ValuePointer) -> IterAction,
    ) -> Result<u32> {
        let guard = self.map.read().unwrap();
        let data = guard.as_slice();
        let limit = (self.size.load(Ordering::Acquire) as usize).min(data.len());
        let mut offset = start_offset as usize;

        while offset < limit {
            match decode_entry(&data[offset..limit], offset as u32, verify_crc, cipher) {
                Ok(rec) => {
                    let vp = ValuePointer {
                        fid: self.fid,
                        offset: offset as u32,
                        len: rec.record_len as u32,
                    };
                    let action = f(&rec.entry, &vp);
                    offset += rec.record_len;
                    if matches!(action, IterAction::Stop) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        Ok(offset as u32)
    }

    /// Syncs, truncates to `end_offset`, and remaps read-only. Frozen from
    /// here on (§4.2).
    pub fn done_writing(&self, end_offset: u32) -> Result<()> {
        {
            let guard = self.map.read().unwrap();
            if let FileMap::Writable(m) = &*guard {
                m.flush()?;
            }
        }
        self.file.set_len(end_offset as u64)?;
        self.file.sync_all()?;

        let ro = unsafe { memmap2::Mmap::map(&self.file)? };
        *self.map.write().unwrap() = FileMap::ReadOnly(ro);
        self.write_at.store(end_offset, Ordering::Release);
        self.size.store(end_offset, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let guard = self.map.read().unwrap();
        if let FileMap::Writable(m) = &*guard {
            m.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Truncates to `offset` (if given) and flushes. The mmap itself is
    /// unmapped when the `LogFile` is dropped.
    pub fn close(&self, offset: Option<u32>) -> Result<()> {
        if let Some(off) = offset {
            self.file.set_len(off as u64)?;
        }
        self.sync()
    }

    pub fn delete(path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("fid", &self.fid)
            .field("path", &self.path)
            .field("write_at", &self.write_at())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_entry;
    use crate::types::Entry;

    #[test]
    fn append_and_iterate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000.vlog");
        let file = LogFile::create_head(path, 0, 4096, 0).unwrap();

        let mut offsets = Vec::new();
        for (k, v) in [("a", "1"), ("bb", "22"), ("ccc", "333")] {
            let entry = Entry::new(k, v);
            let mut buf = Vec::new();
            encode_entry(&mut buf, &entry, file.write_at(), None).unwrap();
            offsets.push(file.append(&buf).unwrap());
        }

        let mut seen = Vec::new();
        let end = file
            .iterate(VLOG_HEADER_SIZE as u32, true, None, |entry, vp| {
                seen.push((entry.key.clone(), entry.value.clone(), vp.offset));
                IterAction::Continue
            })
            .unwrap();

        assert_eq!(end, file.write_at());
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec(), offsets[0]),
                (b"bb".to_vec(), b"22".to_vec(), offsets[1]),
                (b"ccc".to_vec(), b"333".to_vec(), offsets[2]),
            ]
        );
    }

    #[test]
    fn done_writing_freezes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000.vlog");
        let file = LogFile::create_head(path, 0, 4096, 0).unwrap();

        let entry = Entry::new("k", "v");
        let mut buf = Vec::new();
        encode_entry(&mut buf, &entry, file.write_at(), None).unwrap();
        file.append(&buf).unwrap();

        assert!(file.is_writable());
        let end_offset = file.write_at();
        file.done_writing(end_offset).unwrap();
        assert!(!file.is_writable());
        assert_eq!(file.size(), end_offset);

        let err = file.append(&buf).unwrap_err();
        assert!(matches!(err, VLogError::Closed));
    }

    #[test]
    fn iterate_stops_on_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000.vlog");
        let file = LogFile::create_head(path, 0, 4096, 0).unwrap();

        let entry = Entry::new("k", "v");
        let mut buf = Vec::new();
        encode_entry(&mut buf, &entry, file.write_at(), None).unwrap();
        let good_end = file.append(&buf).unwrap() + buf.len() as u32;

        // Simulate a torn write: a few extra, truncated bytes past the last
        // good record (e.g. a crash mid-append).
        file.append(&buf[..3]).unwrap();

        let end = file
            .iterate(VLOG_HEADER_SIZE as u32, true, None, |_, _| IterAction::Continue)
            .unwrap();
        assert_eq!(end, good_end);
    }
}
