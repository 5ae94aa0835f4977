//! Counters tracking how uploads end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the outcomes of uploads dispatched by a [`CsvUploader`].
///
/// Clones are cheap and share the same underlying counters.
///
/// [`CsvUploader`]: crate::CsvUploader
#[derive(Debug, Clone, Default)]
pub struct UploadMetrics {
    aborted: Arc<AtomicU64>,
    format_errors: Arc<AtomicU64>,
    errors_reported: Arc<AtomicU64>,
}

impl UploadMetrics {
    /// Uploads cancelled before every chunk was written.
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Uploads rejected because the CSV could not be parsed or converted to
    /// line protocol.
    pub fn format_errors(&self) -> u64 {
        self.format_errors.load(Ordering::Relaxed)
    }

    /// Uploads that failed for any other reason.
    pub fn errors_reported(&self) -> u64 {
        self.errors_reported.load(Ordering::Relaxed)
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_format_error(&self) {
        self.format_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_reported.fetch_add(1, Ordering::Relaxed);
    }
}
