//! Filesystem, clock and network side of the runtime.

pub mod config;
pub mod lock;
pub mod net;
pub mod recovery;
pub mod replay;
pub mod wal_reader;
pub mod wal_writer;
