//! Uploads annotated CSV to an InfluxDB 2.x bucket as line protocol.
//!
//! A [`CsvUploader`] parses an annotated CSV export, converts it row by row
//! to line protocol and writes the result through a bounded number of
//! concurrent `/api/v2/write` requests. Every call to
//! [`upload`](CsvUploader::upload) returns an independent [`UploadSession`]
//! exposing progress, lifecycle state and cancellation.
//!
//! ```no_run
//! # async fn example() -> Result<(), csv_uploader::UploadError> {
//! use csv_uploader::CsvUploader;
//! use write_client::Client;
//!
//! let client = Client::new("http://localhost:8086").with_auth_token("my-token");
//! let uploader = CsvUploader::new(client, "my-org");
//!
//! let csv = std::fs::read_to_string("export.csv").unwrap();
//! let session = uploader.upload(csv, "my-bucket");
//! session.join().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use write_client::Client;

mod error;
mod metrics;
mod session;
pub mod time;
mod upload;

pub use error::UploadError;
pub use metrics::UploadMetrics;
pub use session::{UploadSession, UploadState};

use crate::time::{SystemProvider, TimeProvider};
use crate::upload::UploadJob;

/// Number of chunks a CSV is split into for writing. Browsers cap the
/// concurrent requests to one origin at six; the uploader keeps the same
/// bound so a whole file is written through six parallel requests.
const CONCURRENT_REQUEST_LIMIT: usize = 6;

/// Writes annotated CSV files to a bucket as concurrent line protocol
/// requests.
#[derive(Debug)]
pub struct CsvUploader {
    client: Client,
    org: String,
    concurrency_limit: usize,
    time_provider: Arc<dyn TimeProvider>,
    metrics: UploadMetrics,
}

impl CsvUploader {
    /// Create an uploader writing through `client` to the organization
    /// `org`.
    pub fn new(client: Client, org: impl Into<String>) -> Self {
        Self {
            client,
            org: org.into(),
            concurrency_limit: CONCURRENT_REQUEST_LIMIT,
            time_provider: Arc::new(SystemProvider::new()),
            metrics: UploadMetrics::default(),
        }
    }

    /// Override the number of chunks an upload is split into. Clamped to at
    /// least one.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Use `time_provider` for the timestamp applied to rows without a
    /// `_time` column.
    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    /// Counters shared by every upload dispatched from this uploader.
    pub fn metrics(&self) -> &UploadMetrics {
        &self.metrics
    }

    /// Start writing `csv` to `bucket`.
    ///
    /// The session is already `Loading` when this returns; parsing,
    /// conversion and the write requests all run on spawned tasks. Must be
    /// called from within a tokio runtime.
    pub fn upload(&self, csv: String, bucket: impl Into<String>) -> UploadSession {
        let (state_tx, state_rx) = watch::channel(UploadState::NotStarted);
        let (progress_tx, progress_rx) = watch::channel(0_u8);
        let token = CancellationToken::new();

        state_tx.send_replace(UploadState::Loading);

        let job = UploadJob {
            client: self.client.clone(),
            org: self.org.clone(),
            bucket: bucket.into(),
            concurrency_limit: self.concurrency_limit,
            time_provider: Arc::clone(&self.time_provider),
            metrics: self.metrics.clone(),
            state_tx,
            progress_tx,
            token: token.clone(),
        };

        let handle = tokio::spawn(job.run(csv));

        UploadSession::new(state_rx, progress_rx, token, handle)
    }
}
