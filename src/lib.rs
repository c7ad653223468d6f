//! A WiSCKey-style value log: keys and small values are expected to live in
//! an external LSM tree, while values at or above `value_threshold` are
//! appended to on-disk log files and referenced from the LSM by a
//! [`types::ValuePointer`].
//!
//! The LSM tree itself, write-ahead logging/replay, transactions, and the
//! key-encryption-key registry are external collaborators this crate only
//! defines trait surfaces for ([`lsm::LsmEngine`], [`crypto::KeyRegistry`]).

pub mod codec;
pub mod config;
pub mod consts;
pub mod crypto;
pub mod discard;
pub mod err;
pub mod gc;
pub mod lsm;
pub mod sampler;
pub mod types;
pub mod vlog;

pub use config::Options;
pub use err::{Result, VLogError};
pub use gc::{run_gc, GcOutcome};
pub use types::{Entry, EntryMeta, ValueMeta, ValuePointer};
pub use vlog::ValueLog;
