//! The ways an upload can end unsuccessfully.

/// Errors that terminate a CSV upload.
///
/// Whatever goes wrong, the upload task catches it: the session lands in the
/// `Error` state and [`UploadSession::join`] returns the value here.
///
/// [`UploadSession::join`]: crate::UploadSession::join
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The input could not be parsed as annotated CSV at all.
    #[error("The CSV could not be parsed. Please make sure that the CSV was in Annotated Format")]
    Parse(#[from] annotated_csv::Error),

    /// A row was missing one of the parts a line protocol record requires.
    #[error(transparent)]
    Format(#[from] csv2lp::Error),

    /// A chunk request failed in the HTTP transport.
    #[error("failed to send a write request: {source}")]
    Request {
        /// The underlying client error.
        source: write_client::RequestError,
    },

    /// The server rejected at least one chunk of the upload.
    #[error("{message}")]
    WriteFailed {
        /// Body text of the first failing response, or a generic fallback
        /// when every failing response body was empty.
        message: String,
    },

    /// The upload was cancelled before every chunk was written.
    #[error("the CSV upload was aborted")]
    Aborted,

    /// The upload task did not run to completion.
    #[error("upload task failed: {source}")]
    TaskFailed {
        /// The join error of the failed task.
        source: tokio::task::JoinError,
    },
}
