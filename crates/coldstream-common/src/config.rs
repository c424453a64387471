//! Configuration types for Coldstream
//!
//! Per-worker archiver configuration. The supervisor materializes one
//! snapshot per worker; a config change is applied by recreating the
//! worker with a new snapshot.

use serde::{Deserialize, Serialize};

/// Configuration of one archiver worker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Max in-flight segment PUTs per upload iteration
    pub upload_concurrency: usize,
    /// Mirror-mode poll interval and per-sync deadline (ms)
    pub sync_manifest_timeout_ms: u64,
    /// Base housekeeping cadence (ms); jittered +/-25%
    pub housekeeping_interval_ms: u64,
    /// Bound on the garbage-collection deletion queue
    pub max_segments_pending_deletion: usize,
    /// Toggles the adjacent-small-segment merge job
    pub segment_merging_enabled: bool,
    /// Runs of contiguous entries below this combined size are merged
    pub segment_merge_target_bytes: u64,
    /// Retention threshold by total remote bytes
    pub retention_bytes: Option<u64>,
    /// Retention threshold by entry age (ms)
    pub retention_ms: Option<u64>,
    /// Replaces the configured bucket for this worker
    pub bucket_override: Option<String>,
    /// Initial backoff of the upload loop when no data is ready (ms)
    pub upload_loop_initial_backoff_ms: u64,
    /// Cap on the upload loop backoff (ms)
    pub upload_loop_max_backoff_ms: u64,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 4,
            sync_manifest_timeout_ms: 60_000,
            housekeeping_interval_ms: 300_000,
            max_segments_pending_deletion: 5_000,
            segment_merging_enabled: true,
            segment_merge_target_bytes: 64 * 1024 * 1024,
            retention_bytes: None,
            retention_ms: None,
            bucket_override: None,
            upload_loop_initial_backoff_ms: 100,
            upload_loop_max_backoff_ms: 10_000,
        }
    }
}
