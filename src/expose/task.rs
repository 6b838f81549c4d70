//! Per-frame exposure task.
//!
//! An [`ExposureTask`] represents one physical frame within a batch. The
//! detector reports nothing while exposing, so the task estimates its own
//! start and end from the single shared trigger-acknowledgement timestamp
//! plus its index in the sequence, and schedules all of its transitions as
//! delayed callbacks against that estimate:
//!
//! ```text
//! Initializing ──arm──> Pending ──start timer──> Running
//!     Running ──end timer──> WaitingForImage ──image found──> Finished
//!                            WaitingForImage ──timeout timer──> TimedOut
//!     any non-terminal ──cancel──> Stopped
//! ```
//!
//! Task 0 skips the `Pending` wait and starts running the moment the
//! acknowledgement arrives. While `WaitingForImage`, a short-period poll
//! repeatedly asks the frame store for the image; an independent timeout
//! timer wins the race if the file never appears. Cancelling a task tears
//! all of its timers down first, so no stale callback can fire afterwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ExposureSettings;
use crate::data::{Frame, ImageData, MaskData};
use crate::expose::AcquisitionRequest;
use crate::metadata::{FrameHeader, SnapshotSource};
use crate::storage::{FrameStore, StoreError};
use crate::timer::{DelayedCall, RepeatingCall};

/// Lifecycle of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created; the trigger has not been acknowledged yet.
    Initializing,
    /// Waiting for its turn in a multi-frame batch.
    Pending,
    /// Being exposed right now (by the clock's estimate).
    Running,
    /// Exposure over; polling the store for the image file.
    WaitingForImage,
    /// Image retrieved. Terminal.
    Finished,
    /// Image never appeared. Terminal.
    TimedOut,
    /// Cancelled on external request. Terminal.
    Stopped,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::TimedOut | TaskStatus::Stopped
        )
    }
}

/// Which of a task's timers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The estimated exposure start was reached.
    Start,
    /// The estimated exposure end was reached.
    End,
    /// The image-wait grace period elapsed.
    ImageTimeout,
    /// Periodic image poll tick.
    ImagePoll,
}

/// Timer callback message posted back onto the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerMsg {
    /// Control-loop id of the task the timer belongs to. Unlike the fsn,
    /// which repeats across prefixes, this is unique across batches.
    pub task_id: u64,
    /// Which timer fired.
    pub kind: TimerKind,
}

/// What a task transition means to the orchestrator.
#[derive(Debug)]
pub enum TaskEvent {
    /// The frame's exposure started (clock estimate).
    Started,
    /// The frame's exposure ended (clock estimate); image retrieval begins.
    Ended,
    /// The image was retrieved and the frame assembled. Terminal.
    Finished(Arc<Frame>),
    /// The image never appeared. Terminal.
    TimedOut,
    /// The task was cancelled. Terminal.
    Cancelled,
}

/// One frame of a batch, with its own sub-state and timers.
pub struct ExposureTask {
    task_id: u64,
    prefix: String,
    fsn: u32,
    index: usize,
    exposure_time: f64,
    delay: f64,
    image_timeout: f64,
    poll_period: f64,
    mask_override: Option<String>,
    ack_time: Option<Instant>,
    status: TaskStatus,
    store: Arc<dyn FrameStore>,
    snapshots: Arc<dyn SnapshotSource>,
    start_call: Option<DelayedCall>,
    end_call: Option<DelayedCall>,
    timeout_call: Option<DelayedCall>,
    poll_call: Option<RepeatingCall>,
}

impl ExposureTask {
    /// Creates a task for frame `index` of `request`, to be filed as
    /// `(prefix, fsn)` and addressed as `task_id` in timer callbacks.
    pub fn new(
        task_id: u64,
        fsn: u32,
        index: usize,
        request: &AcquisitionRequest,
        settings: &ExposureSettings,
        store: Arc<dyn FrameStore>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            task_id,
            prefix: request.prefix.clone(),
            fsn,
            index,
            exposure_time: request.exposure_time,
            delay: request.delay,
            image_timeout: settings.image_timeout_secs,
            poll_period: settings.image_poll_secs,
            mask_override: request.mask_override.clone(),
            ack_time: None,
            status: TaskStatus::Initializing,
            store,
            snapshots,
            start_call: None,
            end_call: None,
            timeout_call: None,
            poll_call: None,
        }
    }

    /// Control-loop id of this task.
    pub fn id(&self) -> u64 {
        self.task_id
    }

    /// Sequence number of this frame.
    pub fn fsn(&self) -> u32 {
        self.fsn
    }

    /// Sequence prefix of this frame.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Estimated exposure start: the shared acknowledgement timestamp plus
    /// this frame's offset in the sequence. `None` until armed.
    pub fn start_time(&self) -> Option<Instant> {
        let ack = self.ack_time?;
        Some(ack + Duration::from_secs_f64((self.exposure_time + self.delay) * self.index as f64))
    }

    /// Estimated exposure end. `None` until armed.
    pub fn end_time(&self) -> Option<Instant> {
        Some(self.start_time()? + Duration::from_secs_f64(self.exposure_time))
    }

    /// Records the shared trigger-acknowledgement timestamp and arms the
    /// timers. Called exactly once per task, when the detector acknowledges
    /// the trigger command for the whole batch.
    ///
    /// Task 0 transitions straight to `Running` and returns
    /// [`TaskEvent::Started`]; later tasks wait in `Pending` for their start
    /// timer.
    pub fn arm(
        &mut self,
        ack: Instant,
        tx: &mpsc::UnboundedSender<TimerMsg>,
    ) -> Option<TaskEvent> {
        if self.status != TaskStatus::Initializing {
            warn!(
                fsn = self.fsn,
                status = ?self.status,
                "ignoring arm on a task that is not initializing"
            );
            return None;
        }
        self.ack_time = Some(ack);

        let start = ack
            + Duration::from_secs_f64((self.exposure_time + self.delay) * self.index as f64);
        let end = start + Duration::from_secs_f64(self.exposure_time);
        let deadline = end + Duration::from_secs_f64(self.image_timeout);

        self.end_call = Some(DelayedCall::at(
            end,
            tx.clone(),
            TimerMsg {
                task_id: self.task_id,
                kind: TimerKind::End,
            },
        ));
        self.timeout_call = Some(DelayedCall::at(
            deadline,
            tx.clone(),
            TimerMsg {
                task_id: self.task_id,
                kind: TimerKind::ImageTimeout,
            },
        ));

        self.status = TaskStatus::Pending;
        if self.index == 0 {
            self.status = TaskStatus::Running;
            Some(TaskEvent::Started)
        } else {
            self.start_call = Some(DelayedCall::at(
                start,
                tx.clone(),
                TimerMsg {
                    task_id: self.task_id,
                    kind: TimerKind::Start,
                },
            ));
            None
        }
    }

    /// Handles a fired timer. Timers that no longer match the task's state
    /// (a cancelled-but-already-posted callback) are ignored.
    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        tx: &mpsc::UnboundedSender<TimerMsg>,
    ) -> Option<TaskEvent> {
        match kind {
            TimerKind::Start if self.status == TaskStatus::Pending => {
                self.start_call = None;
                self.status = TaskStatus::Running;
                Some(TaskEvent::Started)
            }
            TimerKind::End if self.status == TaskStatus::Running => {
                self.end_call = None;
                self.status = TaskStatus::WaitingForImage;
                self.poll_call = Some(RepeatingCall::every(
                    Duration::from_secs_f64(self.poll_period),
                    tx.clone(),
                    TimerMsg {
                        task_id: self.task_id,
                        kind: TimerKind::ImagePoll,
                    },
                ));
                Some(TaskEvent::Ended)
            }
            TimerKind::ImageTimeout if self.status == TaskStatus::WaitingForImage => {
                self.teardown_timers();
                self.status = TaskStatus::TimedOut;
                Some(TaskEvent::TimedOut)
            }
            TimerKind::ImagePoll if self.status == TaskStatus::WaitingForImage => {
                self.try_load_image()
            }
            _ => {
                debug!(
                    fsn = self.fsn,
                    ?kind,
                    status = ?self.status,
                    "ignoring stale timer"
                );
                None
            }
        }
    }

    /// Force-cancels the task: tears every timer down and marks it
    /// `Stopped`. Tasks already in a terminal state are immune.
    pub fn cancel(&mut self) -> Option<TaskEvent> {
        if self.status.is_terminal() {
            return None;
        }
        self.teardown_timers();
        self.status = TaskStatus::Stopped;
        Some(TaskEvent::Cancelled)
    }

    fn teardown_timers(&mut self) {
        // Dropping a call aborts its timer task.
        self.start_call = None;
        self.end_call = None;
        self.timeout_call = None;
        self.poll_call = None;
    }

    fn try_load_image(&mut self) -> Option<TaskEvent> {
        let image = match self.store.load_image(&self.prefix, self.fsn) {
            Ok(image) => image,
            Err(StoreError::NotFound(_)) => return None, // not there yet, keep polling
            Err(err) => {
                warn!(
                    fsn = self.fsn,
                    error = %err,
                    "image load failed, retrying until timeout"
                );
                return None;
            }
        };
        self.teardown_timers();
        self.status = TaskStatus::Finished;
        Some(TaskEvent::Finished(Arc::new(self.assemble_frame(image))))
    }

    fn assemble_frame(&self, image: ImageData) -> Frame {
        let start_date = self.start_time().map_or_else(Utc::now, wall_clock_of);
        let end_date = self.end_time().map_or_else(Utc::now, wall_clock_of);

        let header = FrameHeader::assemble(
            &self.prefix,
            self.fsn,
            self.exposure_time,
            start_date,
            end_date,
            self.mask_override.as_deref(),
            self.snapshots.as_ref(),
        );
        if let Err(err) = self.store.write_header(&header) {
            warn!(fsn = self.fsn, error = %err, "could not persist frame header");
        }

        let mask = match self.store.resolve_mask(&header.mask) {
            Ok(mask) => mask,
            Err(err) => {
                warn!(
                    mask = %header.mask,
                    error = %err,
                    "mask not available, substituting an all-valid mask"
                );
                MaskData::ones(image.width, image.height)
            }
        };
        let uncertainty = image.poisson_uncertainty();

        Frame {
            header,
            image,
            uncertainty,
            mask,
        }
    }
}

/// Converts a monotonic instant in the past into a wall-clock date.
fn wall_clock_of(instant: Instant) -> DateTime<Utc> {
    let elapsed = Instant::now().saturating_duration_since(instant);
    Utc::now() - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
}
