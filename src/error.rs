//! Custom error types for the sequencing core.
//!
//! [`ExposeError`] is the single error enum for everything the exposure
//! orchestrator can refuse or fail at. Using `thiserror` keeps the variants
//! self-describing and lets callers match on the failure class instead of
//! parsing messages.
//!
//! None of these errors are fatal to the process: batch-level failures
//! funnel the orchestrator back to `Idle` and per-frame failures leave the
//! rest of the batch running (see the `expose` module).

use thiserror::Error;

use crate::detector::{DetectorCommand, DetectorStatus};
use crate::storage::StoreError;

/// Convenience alias for results produced by the sequencing core.
pub type ExposeResult<T> = std::result::Result<T, ExposeError>;

/// Everything that can go wrong while sequencing exposures.
#[derive(Debug, Error)]
pub enum ExposeError {
    /// Another acquisition is already in progress.
    #[error("cannot start exposure: another acquisition is already in progress")]
    NotIdle,

    /// The detector is not in its idle status (e.g. it is trimming).
    #[error("cannot start exposure: the detector is not idle (status: {0})")]
    DeviceBusy(DetectorStatus),

    /// The detector refused a prepare/trigger/stop command.
    #[error("detector rejected the {command} command: {message}")]
    DeviceRejected {
        /// The command that was rejected.
        command: DetectorCommand,
        /// Rejection message reported by the hardware.
        message: String,
    },

    /// The image file for a frame never appeared on disk. Non-fatal to the
    /// batch: other frames continue independently.
    #[error("image for {prefix}/{fsn} did not appear before the timeout")]
    ImageTimeout {
        /// Sequence prefix of the affected frame.
        prefix: String,
        /// Sequence number of the affected frame.
        fsn: u32,
    },

    /// The acquisition was stopped on user request. Non-fatal.
    #[error("exposure stopped on user request")]
    Stopped,

    /// The frame store failed (sequence reservation, image or mask lookup).
    #[error("frame store error: {0}")]
    Store(#[from] StoreError),

    /// The detector link failed while sending a command.
    #[error("detector transport error: {0}")]
    Detector(String),

    /// The orchestrator task has shut down and no longer accepts commands.
    #[error("exposer control channel closed")]
    ChannelClosed,
}
