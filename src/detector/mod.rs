//! Detector control interface.
//!
//! The area detector is a slow, partially observable device: it reports no
//! progress while exposing, and commands only acknowledge *receipt*, never
//! physical completion. This module pins that contract down as the
//! [`DetectorControl`] trait plus two independent notification channels
//! folded into one event stream:
//!
//! - **command replies** ([`DetectorEvent::CommandReply`]): the asynchronous
//!   success/failure acknowledgement for each prepare/trigger/stop command;
//! - **status changes** ([`DetectorEvent::StatusChanged`]): the enumerated
//!   status variable, the only way to observe physical completion.
//!
//! The wire-protocol parser that turns hardware byte strings into these
//! typed events lives in the device driver layer, outside this crate.

pub mod mock;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub use mock::{MockBehavior, MockDetector};

/// Enumerated detector status variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorStatus {
    /// Ready for a new acquisition.
    Idle,
    /// Recalibrating its threshold; busy, but not exposing.
    Trimming,
    /// Exposing a single frame.
    Exposing,
    /// Exposing a multi-frame series.
    ExposingMulti,
    /// Winding down after a stop request.
    Stopping,
}

impl DetectorStatus {
    /// Whether the detector can accept a new acquisition.
    pub fn is_idle(self) -> bool {
        self == DetectorStatus::Idle
    }

    /// Whether the detector reports an exposure in progress.
    pub fn is_exposing(self) -> bool {
        matches!(self, DetectorStatus::Exposing | DetectorStatus::ExposingMulti)
    }
}

impl fmt::Display for DetectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectorStatus::Idle => "idle",
            DetectorStatus::Trimming => "trimming",
            DetectorStatus::Exposing => "exposing",
            DetectorStatus::ExposingMulti => "exposing (multi-frame)",
            DetectorStatus::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// The three commands the sequencing core issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorCommand {
    /// Program exposure time, frame count, delay and destination.
    Prepare,
    /// Start the prepared exposure.
    Trigger,
    /// Abort the running exposure.
    Stop,
}

impl fmt::Display for DetectorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectorCommand::Prepare => "prepare",
            DetectorCommand::Trigger => "trigger",
            DetectorCommand::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Asynchronous notifications from the detector.
#[derive(Debug, Clone)]
pub enum DetectorEvent {
    /// A command was acknowledged. Success means "the hardware accepted the
    /// request", nothing more.
    CommandReply {
        /// Which command this reply answers.
        command: DetectorCommand,
        /// Whether the hardware accepted the request.
        success: bool,
        /// Free-form message from the hardware (rejection reason, timing).
        message: String,
    },
    /// The status variable changed. Never delivered synchronously with a
    /// command.
    StatusChanged {
        /// Previous status.
        from: DetectorStatus,
        /// New status.
        to: DetectorStatus,
    },
    /// The connection to the detector computer dropped.
    ConnectionLost,
}

/// Parameters of a prepare command.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    /// Sequence prefix the images will be filed under.
    pub prefix: String,
    /// Duration of a single exposure in seconds.
    pub exposure_time: f64,
    /// Number of frames in the series.
    pub frame_count: usize,
    /// Dead time between frames in seconds; must cover the readout time.
    pub delay: f64,
}

/// Typed command/notification interface of the area detector.
///
/// Command methods return as soon as the request is on the wire; the
/// acknowledgement arrives later as a [`DetectorEvent::CommandReply`] on the
/// subscribed event stream.
#[async_trait]
pub trait DetectorControl: Send + Sync {
    /// Queues a prepare command.
    async fn prepare(&self, request: PrepareRequest) -> Result<()>;

    /// Queues a trigger command. `first_frame_file` is the file name the
    /// detector writes the first frame under.
    async fn trigger(&self, first_frame_file: &str) -> Result<()>;

    /// Queues a stop command. Best effort; the hardware may refuse.
    async fn stop(&self) -> Result<()>;

    /// Last observed value of the status variable.
    fn status(&self) -> DetectorStatus;

    /// Subscribes to command replies and status changes.
    fn subscribe(&self) -> broadcast::Receiver<DetectorEvent>;
}
