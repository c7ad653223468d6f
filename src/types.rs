//! Shared data types: entries, value pointers, and the `meta` bit flags.

use bitflags::bitflags;

use crate::err::{Result, VLogError};

pub type Fid = u32;

bitflags! {
    /// Bit flags carried alongside every entry (§3). Stable on disk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryMeta: u8 {
        /// Tombstone.
        const DELETE = 1 << 0;
        /// Value lives in the value log rather than inlined in the LSM.
        const VALUE_POINTER = 1 << 1;
        /// Older MVCC versions of this key are discardable.
        const DISCARD_EARLIER_VERSIONS = 1 << 2;
        /// Produced by a merge operator; must not be dropped in compaction.
        const MERGE_ENTRY = 1 << 3;
        /// Part of a transaction.
        const TXN = 1 << 6;
        /// Transaction terminator marker.
        const FIN_TXN = 1 << 7;
    }
}

/// `(fid, offset, len)` reference into the value log (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct ValuePointer {
    pub fid: Fid,
    pub offset: u32,
    pub len: u32,
}

pub const VALUE_POINTER_ENCODED_SIZE: usize = 12;

impl ValuePointer {
    pub fn is_zero(&self) -> bool {
        *self == ValuePointer::default()
    }

    pub fn encode(&self) -> [u8; VALUE_POINTER_ENCODED_SIZE] {
        let mut buf = [0u8; VALUE_POINTER_ENCODED_SIZE];
        buf[0..4].copy_from_slice(&self.fid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < VALUE_POINTER_ENCODED_SIZE {
            return Err(VLogError::Encryption(
                "value pointer buffer too short".into(),
            ));
        }
        Ok(Self {
            fid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            len: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            offset: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

/// An entry as held in memory, before or after being framed on disk (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub user_meta: u8,
    pub meta: EntryMeta,
    pub expires_at: u64,
    /// Byte offset of this record's header within its file, once persisted.
    pub offset: u32,
    /// Length of the header alone (key/value/crc follow), once persisted.
    pub header_len: u32,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            user_meta: 0,
            meta: EntryMeta::empty(),
            expires_at: 0,
            offset: 0,
            header_len: 0,
        }
    }

    pub fn with_meta(mut self, meta: EntryMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_user_meta(mut self, user_meta: u8) -> Self {
        self.user_meta = user_meta;
        self
    }

    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_deleted_or_expired(&self, now_unix: u64) -> bool {
        self.meta.contains(EntryMeta::DELETE)
            || (self.expires_at != 0 && self.expires_at <= now_unix)
    }
}

/// What the LSM tree returns for a key (§6, "Interfaces required from the LSM").
///
/// The external `get` never fails on a missing key — it returns an empty
/// `ValueMeta` instead, matching the contract in the spec verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueMeta {
    pub version: u64,
    pub value: Vec<u8>,
    pub meta: EntryMeta,
    pub expires_at: u64,
}

impl ValueMeta {
    pub fn is_empty(&self) -> bool {
        self.version == 0 && self.value.is_empty() && self.meta.is_empty() && self.expires_at == 0
    }
}

/// Extracts the big-endian MVCC version suffix appended to every user key.
///
/// Open Question (§9 / SPEC_FULL §10.5): the distilled spec references
/// `parseTs(key)` without defining the key layout. We follow the corpus
/// convention (badger-family key format) of an 8-byte big-endian version
/// suffix appended to the user key.
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() < 8 {
        return 0;
    }
    let (_, ts) = key.split_at(key.len() - 8);
    u64::from_be_bytes(ts.try_into().unwrap())
}
