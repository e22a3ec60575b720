use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::registry::ERROR_MARKER;

mod http;
pub use http::{HttpUploader, UploadProgressFn};

/// How long the bridge needs to reboot into new firmware after a
/// successful upload, before a caller should reconnect.
pub const REBOOT_GRACE: Duration = Duration::from_secs(5);

/// The busy-slot name reported when an upload blocks a channel command.
pub const UPLOAD_SLOT: &str = "upload_esp_firmware";

/// Lifecycle state of a firmware upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum UploadState {
    /// Created, no bytes sent yet
    Pending,
    /// Transfer running
    InProgress,
    /// Transfer finished and the device accepted the image
    Succeeded,
    /// Transfer failed, or the device rejected the image
    Failed,
    /// The caller aborted the transfer
    Aborted,
}

/// Reasons a firmware upload failed.
#[derive(Error, Debug, Diagnostic)]
pub enum UploadError {
    /// A command or another upload is already active.
    #[error("another operation is already in progress")]
    #[diagnostic(code(lampctl::upload::busy))]
    Busy,
    /// The device rejected the image; its message is reproduced verbatim.
    #[error("{0}")]
    #[diagnostic(code(lampctl::upload::device_error))]
    DeviceReported(String),
    /// The transfer failed below the protocol level; there is no device
    /// message to show.
    #[error("upload failed")]
    #[diagnostic(code(lampctl::upload::transport))]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The caller aborted the transfer.
    #[error("upload aborted")]
    #[diagnostic(code(lampctl::upload::aborted))]
    Aborted,
    /// No upload endpoint was configured for this client.
    #[error("no upload endpoint configured")]
    #[diagnostic(code(lampctl::upload::not_configured))]
    NotConfigured,
}

/// A progress snapshot, normalized to file bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// File bytes transferred so far, protocol overhead subtracted
    pub file_bytes: u64,
    /// The declared file size
    pub declared_size: u64,
    /// `floor(file_bytes / declared_size * 100)`
    pub percent: u8,
}

/// Tracks a single in-flight firmware transfer.
///
/// The transport reports cumulative bytes including protocol overhead
/// (multipart framing, headers); [`UploadSession::record_progress`]
/// subtracts the overhead estimate so callers see plain file bytes. One
/// session exists at a time; it is independent of the command dispatcher
/// but shares the one-operation-at-a-time policy at the client boundary.
#[derive(Debug)]
pub struct UploadSession {
    declared_size: u64,
    transferred: u64,
    state: UploadState,
}

impl UploadSession {
    /// Creates a pending session for a file of the declared size.
    pub fn new(declared_size: u64) -> Self {
        Self {
            declared_size,
            transferred: 0,
            state: UploadState::Pending,
        }
    }

    /// The declared file size in bytes.
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    /// Normalized file bytes transferred so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// The current lifecycle state.
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Whether the session has not yet reached a terminal state.
    pub fn is_active(&self) -> bool {
        matches!(self.state, UploadState::Pending | UploadState::InProgress)
    }

    /// Records transport progress.
    ///
    /// `loaded` and `reported_total` are cumulative byte counts including
    /// protocol overhead; the overhead estimate is
    /// `reported_total - declared_size`. On a session that already reached
    /// a terminal state this is a no-op returning the final snapshot, so a
    /// late transport callback cannot mutate a finished session.
    pub fn record_progress(&mut self, loaded: u64, reported_total: u64) -> UploadProgress {
        if !self.is_active() {
            return self.snapshot();
        }
        self.state = UploadState::InProgress;

        let overhead = reported_total.saturating_sub(self.declared_size);
        self.transferred = loaded.saturating_sub(overhead).min(self.declared_size);

        self.snapshot()
    }

    fn snapshot(&self) -> UploadProgress {
        UploadProgress {
            file_bytes: self.transferred,
            declared_size: self.declared_size,
            percent: percent(self.transferred, self.declared_size),
        }
    }

    /// Finalizes the session from the device's response body.
    pub fn complete(&mut self, body: &str) -> Result<(), UploadError> {
        if body.starts_with(ERROR_MARKER) {
            self.state = UploadState::Failed;
            return Err(UploadError::DeviceReported(body.to_string()));
        }
        self.state = UploadState::Succeeded;
        self.transferred = self.declared_size;
        Ok(())
    }

    /// Marks the session failed after a transport error.
    pub fn fail(&mut self) {
        self.state = UploadState::Failed;
    }

    /// Marks the session aborted by the caller.
    pub fn abort(&mut self) {
        self.state = UploadState::Aborted;
    }
}

fn percent(file_bytes: u64, declared_size: u64) -> u8 {
    if declared_size == 0 {
        return 100;
    }
    (file_bytes * 100 / declared_size) as u8
}
