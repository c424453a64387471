//! Archival state machine for Coldstream
//!
//! Archival metadata commands are appended through the partition's
//! consensus layer (the `ReplicatedLog` seam) and replayed
//! deterministically into the partition manifest. The replay boundary is
//! what separates "uploaded" from "visible".

pub mod command;
pub mod log;
pub mod memory;
pub mod stm;

pub use command::ArchivalCommand;
pub use log::{BatchMeta, LocalSegment, ReplicatedLog, SegmentReadLock};
pub use memory::{BatchSpec, MemoryLog, SegmentSpec};
pub use stm::ArchivalStm;
