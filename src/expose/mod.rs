//! Exposure acquisition sequencing.
//!
//! This is the core of the instrument: coordinating a slow, partially
//! observable detector so that a request for one or many frames reliably
//! produces one result per frame, even though the hardware reports no
//! progress while exposing and acknowledges commands asynchronously.
//!
//! Two state machines share the work:
//!
//! - the [`Exposer`] orchestrator accepts one acquisition request at a
//!   time and drives the detector through prepare → trigger → (stop);
//! - one [`ExposureTask`] per frame estimates its own start and end from
//!   the single shared trigger-acknowledgement timestamp plus its index,
//!   and polls the frame store for its image once its time has passed.
//!
//! The detector's status variable and the tasks' clocks are two independent
//! notifications of the same physical events. They are never synchronized:
//! the orchestrator inspects detector status only to decide whether a new
//! batch may start, while each task decides its own fate from its own
//! timers.
//!
//! # Event flow
//!
//! ```text
//! Exposer ──commands──> DetectorControl
//! Exposer <──replies/status── DetectorControl
//! Exposer ──arm──> ExposureTask ──poll──> FrameStore
//! Exposer ──ExposureEvent──> subscribers (GUI, reduction, scans)
//! ```

pub mod exposer;
pub mod task;

use std::sync::Arc;

use tokio::time::Instant;

use crate::data::Frame;

pub use exposer::{Exposer, ExposerState};
pub use task::{ExposureTask, TaskStatus};

/// One acquisition request: a batch of one or more frames.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    /// Sequence prefix the frames are filed under.
    pub prefix: String,
    /// Duration of a single exposure in seconds.
    pub exposure_time: f64,
    /// Number of frames in the batch.
    pub frame_count: usize,
    /// Dead time between frames in seconds. Must be long enough to cover
    /// the detector readout time.
    pub delay: f64,
    /// Mask to use for every frame of this batch instead of the configured
    /// one.
    pub mask_override: Option<String>,
}

impl AcquisitionRequest {
    /// A single- or multi-frame request with the default inter-frame delay.
    pub fn new(prefix: impl Into<String>, exposure_time: f64, frame_count: usize) -> Self {
        Self {
            prefix: prefix.into(),
            exposure_time,
            frame_count,
            delay: 0.003,
            mask_override: None,
        }
    }

    /// Sets the inter-frame delay in seconds.
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Overrides the mask for every frame of this batch.
    pub fn with_mask_override(mut self, mask: impl Into<String>) -> Self {
        self.mask_override = Some(mask.into());
        self
    }
}

/// Events emitted by the sequencing core.
///
/// For every acquisition request there is exactly one `BatchStarted` /
/// `BatchFinished` pair, and exactly one `FrameFinished` per task that was
/// created, whether the frame succeeded, timed out or was stopped.
#[derive(Debug, Clone)]
pub enum ExposureEvent {
    /// The detector acknowledged the trigger; the batch is underway. Also
    /// emitted (immediately followed by a failed `BatchFinished`) when the
    /// detector rejects the batch, so consumers always see a start paired
    /// with an end.
    BatchStarted,
    /// Periodic progress report while a frame is being exposed.
    BatchProgress {
        /// Prefix of the currently exposed frame.
        prefix: String,
        /// Sequence number of the currently exposed frame.
        fsn: u32,
        /// Time of this report.
        now: Instant,
        /// Estimated start of the current frame's exposure.
        start: Instant,
        /// Estimated end of the current frame's exposure.
        end: Instant,
    },
    /// The batch is over; another acquisition may be started. Images may
    /// still be in flight for individual frames.
    BatchFinished {
        /// False when the batch was stopped or rejected.
        success: bool,
    },
    /// A frame reached a terminal state.
    FrameFinished {
        /// Prefix of the frame.
        prefix: String,
        /// Sequence number of the frame.
        fsn: u32,
        /// Whether the image was retrieved.
        success: bool,
        /// The finished frame, present exactly when `success` is true.
        frame: Option<Arc<Frame>>,
    },
}
