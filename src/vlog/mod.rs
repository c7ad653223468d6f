//! The value log: on-disk files, the multi-fid registry, and the write/read
//! pipeline built on top of them (§4).

pub mod log_file;
pub mod value_log;

pub use log_file::{IterAction, LogFile};
pub use value_log::{GcGuard, ValueLog};
