//! Per-partition archiver metrics
//!
//! Counters updated by the worker and rendered in Prometheus text format.
//!
//! # Prometheus Metrics
//!
//! - `coldstream_uploaded_segments_total` - Segments uploaded successfully
//! - `coldstream_failed_uploads_total` - Segment uploads that exhausted retries
//! - `coldstream_cancelled_uploads_total` - Segment uploads cancelled by pause/stop
//! - `coldstream_uploaded_bytes_total` - Payload bytes uploaded
//! - `coldstream_manifest_uploads_total` - Partition manifest uploads
//! - `coldstream_manifest_downloads_total` - Partition manifest downloads
//! - `coldstream_deleted_segments_total` - Remote segments deleted by GC
//! - `coldstream_gc_failures_total` - GC deletions that failed this tick
//! - `coldstream_pending_deletions` - Deletion queue depth
//! - `coldstream_backlog_bytes` - Local bytes not yet uploaded

use coldstream_common::Ntp;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter set for one partition's archiver
pub struct ArchiverProbe {
    labels: String,
    uploaded_segments: AtomicU64,
    failed_uploads: AtomicU64,
    cancelled_uploads: AtomicU64,
    uploaded_bytes: AtomicU64,
    manifest_uploads: AtomicU64,
    manifest_downloads: AtomicU64,
    deleted_segments: AtomicU64,
    gc_failures: AtomicU64,
    pending_deletions: AtomicU64,
    backlog_bytes: AtomicU64,
}

impl ArchiverProbe {
    #[must_use]
    pub fn new(ntp: &Ntp) -> Self {
        Self {
            labels: format!(
                "namespace=\"{}\",topic=\"{}\",partition=\"{}\"",
                ntp.namespace, ntp.topic, ntp.partition
            ),
            uploaded_segments: AtomicU64::new(0),
            failed_uploads: AtomicU64::new(0),
            cancelled_uploads: AtomicU64::new(0),
            uploaded_bytes: AtomicU64::new(0),
            manifest_uploads: AtomicU64::new(0),
            manifest_downloads: AtomicU64::new(0),
            deleted_segments: AtomicU64::new(0),
            gc_failures: AtomicU64::new(0),
            pending_deletions: AtomicU64::new(0),
            backlog_bytes: AtomicU64::new(0),
        }
    }

    pub fn segment_uploaded(&self, bytes: u64) {
        self.uploaded_segments.fetch_add(1, Ordering::Relaxed);
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload_failed(&self) {
        self.failed_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_cancelled(&self) {
        self.cancelled_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn manifest_uploaded(&self) {
        self.manifest_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn manifest_downloaded(&self) {
        self.manifest_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_deleted(&self) {
        self.deleted_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gc_failed(&self) {
        self.gc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending_deletions(&self, depth: u64) {
        self.pending_deletions.store(depth, Ordering::Relaxed);
    }

    pub fn set_backlog_bytes(&self, bytes: u64) {
        self.backlog_bytes.store(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn uploaded_segments(&self) -> u64 {
        self.uploaded_segments.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_uploads(&self) -> u64 {
        self.failed_uploads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cancelled_uploads(&self) -> u64 {
        self.cancelled_uploads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deleted_segments(&self) -> u64 {
        self.deleted_segments.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn gc_failures(&self) -> u64 {
        self.gc_failures.load(Ordering::Relaxed)
    }

    /// Render all metrics in Prometheus text format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        self.counter(&mut out, "coldstream_uploaded_segments_total", &self.uploaded_segments);
        self.counter(&mut out, "coldstream_failed_uploads_total", &self.failed_uploads);
        self.counter(&mut out, "coldstream_cancelled_uploads_total", &self.cancelled_uploads);
        self.counter(&mut out, "coldstream_uploaded_bytes_total", &self.uploaded_bytes);
        self.counter(&mut out, "coldstream_manifest_uploads_total", &self.manifest_uploads);
        self.counter(&mut out, "coldstream_manifest_downloads_total", &self.manifest_downloads);
        self.counter(&mut out, "coldstream_deleted_segments_total", &self.deleted_segments);
        self.counter(&mut out, "coldstream_gc_failures_total", &self.gc_failures);
        self.gauge(&mut out, "coldstream_pending_deletions", &self.pending_deletions);
        self.gauge(&mut out, "coldstream_backlog_bytes", &self.backlog_bytes);
        out
    }

    fn counter(&self, out: &mut String, name: &str, value: &AtomicU64) {
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(
            out,
            "{name}{{{}}} {}",
            self.labels,
            value.load(Ordering::Relaxed)
        );
    }

    fn gauge(&self, out: &mut String, name: &str, value: &AtomicU64) {
        let _ = writeln!(out, "# TYPE {name} gauge");
        let _ = writeln!(
            out,
            "{name}{{{}}} {}",
            self.labels,
            value.load(Ordering::Relaxed)
        );
    }
}
