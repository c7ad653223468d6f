//! External collaborators the value log depends on but does not implement
//! (§1 "Out of scope", §6 "Interfaces required from the LSM").

use crate::err::Result;
use crate::types::{Entry, ValueMeta};

/// The minimal surface the LSM tree must provide for the value log's GC path
/// to work: point lookups and a batched re-insert sink.
pub trait LsmEngine: Send + Sync {
    /// Never fails on a missing key — returns an empty [`ValueMeta`] instead.
    fn get(&self, key: &[u8]) -> ValueMeta;

    /// Re-inserts a batch of rewritten entries. May fail with
    /// [`crate::err::VLogError::TxnTooBig`], which the rewriter reacts to by
    /// halving its batch size.
    fn batch_set(&self, entries: Vec<Entry>) -> Result<()>;
}
