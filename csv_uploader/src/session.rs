//! Handle to one dispatched upload.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

/// Lifecycle of one CSV upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadState {
    /// No upload has been dispatched.
    #[default]
    NotStarted,
    /// Rows are being converted and written.
    Loading,
    /// Every chunk was accepted by the server.
    Done,
    /// The upload ended with an error.
    Error,
}

/// A running CSV upload.
///
/// Dropping the session leaves the upload running to completion; use
/// [`cancel`](Self::cancel) to abort it.
#[derive(Debug)]
pub struct UploadSession {
    state: watch::Receiver<UploadState>,
    progress: watch::Receiver<u8>,
    token: CancellationToken,
    handle: JoinHandle<Result<(), UploadError>>,
}

impl UploadSession {
    pub(crate) fn new(
        state: watch::Receiver<UploadState>,
        progress: watch::Receiver<u8>,
        token: CancellationToken,
        handle: JoinHandle<Result<(), UploadError>>,
    ) -> Self {
        Self {
            state,
            progress,
            token,
            handle,
        }
    }

    /// The most recently published lifecycle state.
    pub fn state(&self) -> UploadState {
        *self.state.borrow()
    }

    /// A channel following the lifecycle state. The channel closes once the
    /// upload task has ended.
    pub fn watch_state(&self) -> watch::Receiver<UploadState> {
        self.state.clone()
    }

    /// Percentage of chunks written so far, from 0 to 100.
    pub fn progress(&self) -> u8 {
        *self.progress.borrow()
    }

    /// A channel following the progress percentage. The channel closes once
    /// the upload task has ended.
    pub fn watch_progress(&self) -> watch::Receiver<u8> {
        self.progress.clone()
    }

    /// Abort the upload: in-flight chunk requests are dropped and no further
    /// chunk is written. Valid in any state.
    pub fn cancel(&self) {
        self.token.cancel()
    }

    /// Wait for the upload to end and return its outcome.
    pub async fn join(self) -> Result<(), UploadError> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(source) => Err(UploadError::TaskFailed { source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_state_defaults_to_not_started() {
        assert_eq!(UploadState::default(), UploadState::NotStarted);
    }
}
