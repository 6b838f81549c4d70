//! Exposure orchestrator.
//!
//! The [`Exposer`] owns the batch lifecycle: it checks that both it and the
//! detector are idle, reserves sequence numbers, drives the detector through
//! prepare → trigger, fans out one [`ExposureTask`] per frame and aggregates
//! their completions into batch-level events.
//!
//! All state lives in a single actor task; commands arrive on an mpsc
//! channel with oneshot replies (the handle methods on [`Exposer`]),
//! detector notifications on the detector's broadcast channel, and task
//! timer callbacks on an internal channel. One `tokio::select!` loop
//! serializes every transition, so the two completion notifications for the
//! same physical exposure (the detector's status variable and each task's
//! own clock) are free to arrive in either order without locking.
//!
//! # Batch state machine
//!
//! ```text
//! Idle ──start──> Preparing ──prepare ok──> Starting ──trigger ok──> Exposing
//!   ^                │                         │                        │
//!   │          prepare failed            trigger failed           stop ok│
//!   │                v                         v                        v
//!   └──── (batch failed, paired events) <──────┘        Stopping ───────┘
//!   └──────────── detector status returns to idle ──────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ExposureSettings;
use crate::detector::{DetectorCommand, DetectorControl, DetectorEvent, PrepareRequest};
use crate::error::{ExposeError, ExposeResult};
use crate::expose::task::{ExposureTask, TaskEvent, TaskStatus, TimerMsg};
use crate::expose::{AcquisitionRequest, ExposureEvent};
use crate::metadata::SnapshotSource;
use crate::storage::{frame_file_name, FrameStore};

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposerState {
    /// Ready for a new acquisition.
    Idle,
    /// Prepare command sent, waiting for its acknowledgement.
    Preparing,
    /// Trigger command sent, waiting for its acknowledgement.
    Starting,
    /// The detector is exposing.
    Exposing,
    /// Stop requested, waiting for the detector to confirm idleness.
    Stopping,
}

impl fmt::Display for ExposerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExposerState::Idle => "idle",
            ExposerState::Preparing => "preparing",
            ExposerState::Starting => "starting",
            ExposerState::Exposing => "exposing",
            ExposerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Commands accepted by the orchestrator actor.
enum Command {
    Start {
        request: AcquisitionRequest,
        reply: oneshot::Sender<ExposeResult<u32>>,
    },
    Stop {
        reply: oneshot::Sender<ExposeResult<()>>,
    },
    ImagesPending {
        reply: oneshot::Sender<usize>,
    },
    State {
        reply: oneshot::Sender<ExposerState>,
    },
}

/// Handle to the exposure orchestrator.
///
/// Cheap to clone; all clones talk to the same actor. The actor stops when
/// every handle is dropped.
#[derive(Clone)]
pub struct Exposer {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ExposureEvent>,
}

impl Exposer {
    /// Spawns the orchestrator actor on the current runtime.
    pub fn spawn(
        detector: Arc<dyn DetectorControl>,
        store: Arc<dyn FrameStore>,
        snapshots: Arc<dyn SnapshotSource>,
        settings: ExposureSettings,
    ) -> Self {
        let (commands, cmd_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(256);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let actor = ExposerActor {
            detector,
            store,
            snapshots,
            settings,
            state: ExposerState::Idle,
            tasks: HashMap::new(),
            next_task_id: 0,
            active: None,
            stop_pending: false,
            first_frame_file: None,
            events: events.clone(),
            timer_tx,
        };
        tokio::spawn(actor.run(cmd_rx, timer_rx));

        Self { commands, events }
    }

    /// Subscribes to the orchestrator's event stream. Subscribe before
    /// starting an acquisition to see its `BatchStarted`.
    pub fn subscribe(&self) -> broadcast::Receiver<ExposureEvent> {
        self.events.subscribe()
    }

    /// Requests a batch acquisition and returns the first reserved sequence
    /// number. The acquisition itself proceeds asynchronously; progress and
    /// completion arrive on the event stream.
    ///
    /// # Errors
    ///
    /// [`ExposeError::NotIdle`] if a batch is already in progress,
    /// [`ExposeError::DeviceBusy`] if the detector is not idle. Neither has
    /// any side effect.
    pub async fn start_acquisition(&self, request: AcquisitionRequest) -> ExposeResult<u32> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { request, reply })
            .await
            .map_err(|_| ExposeError::ChannelClosed)?;
        rx.await.map_err(|_| ExposeError::ChannelClosed)?
    }

    /// Forwards a stop request to the detector. A no-op when idle. Tasks
    /// are cancelled only once the detector status confirms idleness,
    /// because a stop request and an in-flight frame completion can race.
    pub async fn stop_acquisition(&self) -> ExposeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| ExposeError::ChannelClosed)?;
        rx.await.map_err(|_| ExposeError::ChannelClosed)?
    }

    /// Number of frames not yet in a terminal state. The panic/shutdown
    /// sequence may declare the exposer quiesced when this reaches zero.
    pub async fn images_pending(&self) -> ExposeResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ImagesPending { reply })
            .await
            .map_err(|_| ExposeError::ChannelClosed)?;
        rx.await.map_err(|_| ExposeError::ChannelClosed)
    }

    /// Current orchestrator state.
    pub async fn state(&self) -> ExposeResult<ExposerState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::State { reply })
            .await
            .map_err(|_| ExposeError::ChannelClosed)?;
        rx.await.map_err(|_| ExposeError::ChannelClosed)
    }
}

struct ExposerActor {
    detector: Arc<dyn DetectorControl>,
    store: Arc<dyn FrameStore>,
    snapshots: Arc<dyn SnapshotSource>,
    settings: ExposureSettings,
    state: ExposerState,
    /// Live (non-terminal) tasks, keyed by their control-loop id. Sequence
    /// numbers repeat across prefixes, so they cannot key this map. Tasks
    /// are removed the moment they reach a terminal state, independent of
    /// batch state.
    tasks: HashMap<u64, ExposureTask>,
    next_task_id: u64,
    /// The task currently believed to be physically exposing.
    active: Option<u64>,
    /// A stop was acknowledged before the trigger was; it is repeated once
    /// the exposure is actually running.
    stop_pending: bool,
    first_frame_file: Option<String>,
    events: broadcast::Sender<ExposureEvent>,
    timer_tx: mpsc::UnboundedSender<TimerMsg>,
}

impl ExposerActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerMsg>,
    ) {
        let mut detector_events = self.detector.subscribe();
        let mut progress = time::interval(self.settings.progress_period());
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break, // every handle dropped
                },
                event = detector_events.recv() => match event {
                    Ok(event) => self.handle_detector_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "lagging behind the detector event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("detector event stream closed, shutting the exposer down");
                        self.handle_connection_lost();
                        break;
                    }
                },
                Some(msg) = timer_rx.recv() => self.handle_timer(msg),
                _ = progress.tick() => self.emit_progress(),
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                let result = self.handle_start(request).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let result = self.handle_stop().await;
                let _ = reply.send(result);
            }
            Command::ImagesPending { reply } => {
                let _ = reply.send(self.tasks.len());
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    async fn handle_start(&mut self, request: AcquisitionRequest) -> ExposeResult<u32> {
        if self.state != ExposerState::Idle {
            return Err(ExposeError::NotIdle);
        }
        let status = self.detector.status();
        if !status.is_idle() {
            return Err(ExposeError::DeviceBusy(status));
        }

        let first_fsn = self.store.reserve(&request.prefix, request.frame_count)?;
        info!(
            prefix = %request.prefix,
            first_fsn,
            frames = request.frame_count,
            exposure_time = request.exposure_time,
            "starting acquisition"
        );

        // Idle -> Preparing
        self.state = ExposerState::Preparing;
        self.first_frame_file = Some(frame_file_name(&request.prefix, first_fsn));
        if let Err(err) = self
            .detector
            .prepare(PrepareRequest {
                prefix: request.prefix.clone(),
                exposure_time: request.exposure_time,
                frame_count: request.frame_count,
                delay: request.delay,
            })
            .await
        {
            self.state = ExposerState::Idle;
            return Err(ExposeError::Detector(err.to_string()));
        }

        debug!("creating {} exposure tasks", request.frame_count);
        for index in 0..request.frame_count {
            let fsn = first_fsn + index as u32;
            let task_id = self.next_task_id;
            self.next_task_id += 1;
            let task = ExposureTask::new(
                task_id,
                fsn,
                index,
                &request,
                &self.settings,
                Arc::clone(&self.store),
                Arc::clone(&self.snapshots),
            );
            self.tasks.insert(task_id, task);
        }
        self.active = None;
        Ok(first_fsn)
    }

    async fn handle_stop(&mut self) -> ExposeResult<()> {
        if self.state == ExposerState::Idle {
            debug!("stop requested while idle, nothing to do");
            return Ok(());
        }
        info!("exposure stop requested");
        self.detector
            .stop()
            .await
            .map_err(|err| ExposeError::Detector(err.to_string()))
    }

    async fn handle_detector_event(&mut self, event: DetectorEvent) {
        match event {
            DetectorEvent::CommandReply {
                command: DetectorCommand::Prepare,
                success: true,
                ..
            } => {
                if self.state != ExposerState::Preparing {
                    warn!(state = %self.state, "prepare acknowledged but the exposer is not preparing");
                    return;
                }
                // Preparing -> Starting
                debug!("detector prepared, instructing it to start the exposure");
                let first_frame_file = self.first_frame_file.clone().unwrap_or_default();
                match self.detector.trigger(&first_frame_file).await {
                    Ok(()) => self.state = ExposerState::Starting,
                    Err(err) => {
                        self.fail_batch(DetectorCommand::Trigger, &err.to_string());
                    }
                }
            }
            DetectorEvent::CommandReply {
                command: DetectorCommand::Prepare,
                success: false,
                message,
            } => {
                if self.state != ExposerState::Preparing {
                    warn!(state = %self.state, "prepare rejected but the exposer is not preparing");
                    return;
                }
                self.fail_batch(DetectorCommand::Prepare, &message);
            }
            DetectorEvent::CommandReply {
                command: DetectorCommand::Trigger,
                success: true,
                ..
            } => {
                if self.state != ExposerState::Starting {
                    warn!(state = %self.state, "trigger acknowledged but the exposer is not starting");
                    return;
                }
                // Starting -> Exposing. The acknowledgement instant is the
                // shared time origin for every task of the batch.
                self.state = ExposerState::Exposing;
                info!("detector acknowledged the trigger, batch underway");
                self.emit(ExposureEvent::BatchStarted);

                let ack = Instant::now();
                let mut unarmed: Vec<u64> = self
                    .tasks
                    .iter()
                    .filter(|(_, task)| task.status() == TaskStatus::Initializing)
                    .map(|(&task_id, _)| task_id)
                    .collect();
                unarmed.sort_unstable();
                for task_id in unarmed {
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        if let Some(TaskEvent::Started) = task.arm(ack, &self.timer_tx) {
                            debug!(fsn = task.fsn(), "frame exposure started");
                            self.active = Some(task_id);
                        }
                    }
                }

                if self.stop_pending {
                    // The stop was acknowledged before the exposure began
                    // and aborted nothing; repeat it now that the detector
                    // is actually running.
                    self.stop_pending = false;
                    info!("repeating the stop request that preceded the trigger acknowledgement");
                    if let Err(err) = self.detector.stop().await {
                        error!(error = %err, "could not repeat the stop request");
                    }
                }
            }
            DetectorEvent::CommandReply {
                command: DetectorCommand::Trigger,
                success: false,
                message,
            } => {
                if self.state != ExposerState::Starting {
                    warn!(state = %self.state, "trigger rejected but the exposer is not starting");
                    return;
                }
                self.fail_batch(DetectorCommand::Trigger, &message);
            }
            DetectorEvent::CommandReply {
                command: DetectorCommand::Stop,
                success: true,
                ..
            } => match self.state {
                ExposerState::Exposing => {
                    // Exposing -> Stopping. Tasks stay alive until the
                    // status channel confirms the detector is idle.
                    info!("detector acknowledged the stop request");
                    self.state = ExposerState::Stopping;
                }
                ExposerState::Preparing | ExposerState::Starting => {
                    // The stop reached the detector before the trigger did
                    // and aborted nothing. Defer it to the trigger
                    // acknowledgement instead of entering Stopping, where
                    // an idle detector would never confirm anything.
                    info!("stop acknowledged before the batch started, deferring");
                    self.stop_pending = true;
                }
                ExposerState::Idle | ExposerState::Stopping => {
                    warn!(state = %self.state, "stop acknowledged but no exposure is running");
                }
            },
            DetectorEvent::CommandReply {
                command: DetectorCommand::Stop,
                success: false,
                message,
            } => {
                let err = ExposeError::DeviceRejected {
                    command: DetectorCommand::Stop,
                    message,
                };
                error!(error = %err, "exposure cannot be stopped");
            }
            DetectorEvent::StatusChanged { from, to } => {
                debug!(%from, %to, "detector status changed");
                if to.is_idle()
                    && matches!(self.state, ExposerState::Exposing | ExposerState::Stopping)
                {
                    // Exposing/Stopping -> Idle. Some frames may still be
                    // waiting for their image; that does not block the next
                    // batch.
                    let stopped = self.state == ExposerState::Stopping;
                    if stopped {
                        info!("exposure stopped");
                        self.cancel_live_tasks();
                    } else {
                        info!("exposure finished");
                    }
                    self.state = ExposerState::Idle;
                    self.stop_pending = false;
                    self.emit(ExposureEvent::BatchFinished { success: !stopped });
                }
            }
            DetectorEvent::ConnectionLost => self.handle_connection_lost(),
        }
    }

    /// The detector rejected the batch (prepare or trigger). Tasks of this
    /// batch are still initializing and are discarded, each emitting its
    /// paired frame-finished. The start/finish pair is emitted here since
    /// no status change will arrive from the detector.
    fn fail_batch(&mut self, command: DetectorCommand, message: &str) {
        let err = ExposeError::DeviceRejected {
            command,
            message: message.to_string(),
        };
        error!(error = %err, "acquisition failed to start");

        self.emit(ExposureEvent::BatchStarted);
        let unarmed: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.status() == TaskStatus::Initializing)
            .map(|(&task_id, _)| task_id)
            .collect();
        for task_id in unarmed {
            self.finish_cancelled(task_id);
        }
        self.state = ExposerState::Idle;
        self.stop_pending = false;
        self.emit(ExposureEvent::BatchFinished { success: false });
    }

    fn handle_connection_lost(&mut self) {
        if self.state == ExposerState::Idle {
            return;
        }
        warn!("detector connection lost while a batch was in flight, treating as a stop");
        self.cancel_live_tasks();
        self.state = ExposerState::Idle;
        self.stop_pending = false;
        self.emit(ExposureEvent::BatchFinished { success: false });
    }

    /// Force-cancels every non-terminal task, emitting one failed
    /// frame-finished per task.
    fn cancel_live_tasks(&mut self) {
        let task_ids: Vec<u64> = self.tasks.keys().copied().collect();
        for task_id in task_ids {
            self.finish_cancelled(task_id);
        }
    }

    fn finish_cancelled(&mut self, task_id: u64) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.cancel().is_none() {
            return; // already terminal
        }
        let prefix = task.prefix().to_string();
        let fsn = task.fsn();
        debug!(fsn, "frame cancelled");
        self.tasks.remove(&task_id);
        if self.active == Some(task_id) {
            self.active = None;
        }
        self.emit(ExposureEvent::FrameFinished {
            prefix,
            fsn,
            success: false,
            frame: None,
        });
    }

    fn handle_timer(&mut self, msg: TimerMsg) {
        let (event, prefix, fsn) = match self.tasks.get_mut(&msg.task_id) {
            Some(task) => {
                let event = task.on_timer(msg.kind, &self.timer_tx);
                (event, task.prefix().to_string(), task.fsn())
            }
            // A callback posted just before its task was removed.
            None => return,
        };
        match event {
            Some(TaskEvent::Started) => {
                debug!(fsn, "frame exposure started");
                self.active = Some(msg.task_id);
            }
            Some(TaskEvent::Ended) => {
                debug!(fsn, "frame exposure ended, waiting for the image");
                if self.active == Some(msg.task_id) {
                    self.active = None;
                } else if self.active.is_some() {
                    warn!(fsn, "the frame that ended was not the active frame");
                }
            }
            Some(TaskEvent::Finished(frame)) => {
                info!(fsn, "frame finished successfully");
                self.tasks.remove(&msg.task_id);
                self.emit(ExposureEvent::FrameFinished {
                    prefix,
                    fsn,
                    success: true,
                    frame: Some(frame),
                });
            }
            Some(TaskEvent::TimedOut) => {
                let err = ExposeError::ImageTimeout {
                    prefix: prefix.clone(),
                    fsn,
                };
                error!(error = %err, "frame failed");
                self.tasks.remove(&msg.task_id);
                self.emit(ExposureEvent::FrameFinished {
                    prefix,
                    fsn,
                    success: false,
                    frame: None,
                });
            }
            // Cancellation never arrives through a timer.
            Some(TaskEvent::Cancelled) | None => {}
        }
    }

    fn emit_progress(&self) {
        let Some(task_id) = self.active else { return };
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        if task.status() != TaskStatus::Running {
            return;
        }
        let (Some(start), Some(end)) = (task.start_time(), task.end_time()) else {
            return;
        };
        self.emit(ExposureEvent::BatchProgress {
            prefix: task.prefix().to_string(),
            fsn: task.fsn(),
            now: Instant::now(),
            start,
            end,
        });
    }

    fn emit(&self, event: ExposureEvent) {
        // No subscribers is fine; events are best effort.
        let _ = self.events.send(event);
    }
}
