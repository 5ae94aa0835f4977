//! The spawned task that converts a CSV and writes it chunk by chunk.

use std::mem;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use observability_deps::tracing::{debug, error};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use csv2lp::{Chunk, RowConverter};
use write_client::{Client, Precision, RequestError};

use crate::error::UploadError;
use crate::metrics::UploadMetrics;
use crate::session::UploadState;
use crate::time::TimeProvider;

/// Message of a write failure when no failing response carried a body.
const WRITE_FAILED_FALLBACK: &str = "Looks like some of the CSV data could not be written to \
     the bucket. Please make sure that CSV was in Annotated Format";

/// One dispatched upload.
///
/// Owns the session's channel senders: when the job ends, the channels seen
/// by the [`UploadSession`](crate::UploadSession) close.
#[derive(Debug)]
pub(crate) struct UploadJob {
    pub(crate) client: Client,
    pub(crate) org: String,
    pub(crate) bucket: String,
    pub(crate) concurrency_limit: usize,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) metrics: UploadMetrics,
    pub(crate) state_tx: watch::Sender<UploadState>,
    pub(crate) progress_tx: watch::Sender<u8>,
    pub(crate) token: CancellationToken,
}

impl UploadJob {
    pub(crate) async fn run(self, csv: String) -> Result<(), UploadError> {
        let outcome = self.dispatch(csv).await;

        match &outcome {
            Ok(()) => {
                debug!(org = %self.org, bucket = %self.bucket, "CSV upload complete");
                self.state_tx.send_replace(UploadState::Done);
            }
            Err(e) => {
                self.observe_failure(e);
                self.state_tx.send_replace(UploadState::Error);
            }
        }

        outcome
    }

    /// Convert the CSV row by row, writing a chunk whenever a stride boundary
    /// passes, then wait for every chunk request.
    async fn dispatch(&self, csv: String) -> Result<(), UploadError> {
        let table = annotated_csv::parse(&csv)?;
        let converter = RowConverter::new(&table);

        let rows = table.row_count();
        let stride = csv2lp::chunk_stride(rows, self.concurrency_limit);
        let total_chunks = csv2lp::chunk_count(rows, self.concurrency_limit) as u64;

        let writes = FuturesUnordered::new();
        let mut chunk = Chunk::new();

        for row in 0..rows {
            if row != 0 && stride != 0 && row % stride == 0 {
                writes.push(self.spawn_write(mem::take(&mut chunk).into_body()));
            }

            let default_time = self.time_provider.now().timestamp_millis();
            // A conversion error ends the upload, but chunks written so far
            // stay in flight.
            chunk.push(converter.record(row, default_time)?);
        }
        if !chunk.is_empty() {
            writes.push(self.spawn_write(chunk.into_body()));
        }

        debug!(
            org = %self.org,
            bucket = %self.bucket,
            rows,
            chunks = total_chunks,
            "dispatched CSV upload"
        );

        self.drain(writes, total_chunks).await
    }

    /// Race one chunk's write request against the session token.
    fn spawn_write(&self, body: String) -> JoinHandle<Result<(), UploadError>> {
        let client = self.client.clone();
        let org = self.org.clone();
        let bucket = self.bucket.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                // Cancellation is polled first: a session cancelled before
                // this task runs never starts its request.
                biased;
                _ = token.cancelled() => Err(UploadError::Aborted),
                result = client.write(&org, &bucket, Precision::Nanosecond, body) => {
                    result.map_err(|e| match e {
                        RequestError::Http { text, .. } => UploadError::WriteFailed { message: text },
                        source => UploadError::Request { source },
                    })
                }
            }
        })
    }

    /// Wait for every chunk task, publishing progress as responses arrive,
    /// and merge the outcomes into one result.
    async fn drain(
        &self,
        mut writes: FuturesUnordered<JoinHandle<Result<(), UploadError>>>,
        total_chunks: u64,
    ) -> Result<(), UploadError> {
        let mut completed = 0_u64;
        let mut aborted = false;
        let mut rejected = false;
        let mut server_message: Option<String> = None;
        let mut transport: Option<UploadError> = None;
        let mut task_failure: Option<UploadError> = None;

        while let Some(joined) = writes.next().await {
            match joined {
                Ok(Ok(())) => {
                    completed += 1;
                    self.publish_progress(completed, total_chunks);
                }
                Ok(Err(UploadError::WriteFailed { message })) => {
                    // A rejected chunk still completed its HTTP exchange, so
                    // it counts towards progress.
                    completed += 1;
                    self.publish_progress(completed, total_chunks);
                    rejected = true;
                    if server_message.is_none() && !message.is_empty() {
                        server_message = Some(message);
                    }
                }
                Ok(Err(UploadError::Aborted)) => aborted = true,
                Ok(Err(e)) => {
                    if transport.is_none() {
                        transport = Some(e);
                    }
                }
                Err(source) => {
                    if task_failure.is_none() {
                        task_failure = Some(UploadError::TaskFailed { source });
                    }
                }
            }
        }

        if aborted {
            return Err(UploadError::Aborted);
        }
        if let Some(e) = transport {
            return Err(e);
        }
        if rejected {
            return Err(UploadError::WriteFailed {
                message: server_message.unwrap_or_else(|| WRITE_FAILED_FALLBACK.to_string()),
            });
        }
        if let Some(e) = task_failure {
            return Err(e);
        }

        Ok(())
    }

    fn publish_progress(&self, completed: u64, total_chunks: u64) {
        self.progress_tx
            .send_replace((completed * 100 / total_chunks) as u8);
    }

    fn observe_failure(&self, error: &UploadError) {
        match error {
            UploadError::Aborted => {
                self.metrics.record_aborted();
                debug!(org = %self.org, bucket = %self.bucket, "CSV upload aborted");
            }
            UploadError::Parse(_) | UploadError::Format(_) => {
                self.metrics.record_format_error();
                debug!(%error, "rejected malformed CSV upload");
            }
            _ => {
                self.metrics.record_error();
                error!(%error, org = %self.org, bucket = %self.bucket, "CSV upload failed");
            }
        }
    }
}
