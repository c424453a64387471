//! Per-partition cloud archival worker
//!
//! One `NtpArchiver` runs per partition replica. While the replica leads
//! its replication group the worker uploads committed segments to the
//! remote store, replicates manifest deltas through the archival state
//! machine and runs retention, garbage collection and adjacent-segment
//! merging on a jittered cadence. Read-replica workers only mirror the
//! remote manifest.

pub mod archiver;
pub mod housekeeping;
pub mod policy;
pub mod probe;

pub use archiver::{ArchiverRole, BatchResult, NtpArchiver, UploadGroupResult};
pub use housekeeping::{
    compute_retention_start, find_adjacent_run, AdjacentSegmentRun, ReuploadCandidate,
    ReuploadSource,
};
pub use policy::{ArchivalPolicy, SegmentSource, UploadCandidate, UploadCandidateWithLocks};
pub use probe::ArchiverProbe;
