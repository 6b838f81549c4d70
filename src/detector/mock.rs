//! Mock detector.
//!
//! Simulates the acknowledgement and status behavior of a Pilatus-class
//! area detector without hardware: commands are acknowledged after a short
//! latency, the status variable walks through exposing/stopping/idle, and
//! finished frames are deposited into a shared [`MemoryStore`] exactly when
//! their nominal exposure time elapses. This reproduces the production
//! setup, where the detector computer writes image files that the control
//! software polls for.
//!
//! All waits use `tokio::time::sleep`, so tests can drive the mock
//! deterministically with a paused clock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::data::ImageData;
use crate::detector::{
    DetectorCommand, DetectorControl, DetectorEvent, DetectorStatus, PrepareRequest,
};
use crate::storage::{parse_frame_file_name, MemoryStore};

/// Tunable behavior of the mock detector.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Delay before a command is acknowledged.
    pub ack_latency: Duration,
    /// Delay between the stop acknowledgement and the idle status.
    pub stopping_latency: Duration,
    /// Reject the prepare command.
    pub fail_prepare: bool,
    /// Reject the trigger command.
    pub fail_trigger: bool,
    /// Reject the stop command.
    pub fail_stop: bool,
    /// Frame indices whose image is never written (simulates a lost file).
    pub drop_frames: HashSet<usize>,
    /// Size of the generated images in pixels.
    pub image_size: (u32, u32),
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            ack_latency: Duration::from_millis(5),
            stopping_latency: Duration::from_millis(10),
            fail_prepare: false,
            fail_trigger: false,
            fail_stop: false,
            drop_frames: HashSet::new(),
            image_size: (32, 32),
        }
    }
}

/// Simulated area detector backed by a [`MemoryStore`].
pub struct MockDetector {
    store: Arc<MemoryStore>,
    behavior: MockBehavior,
    status_tx: watch::Sender<DetectorStatus>,
    // Kept so status writes never fail with no receivers.
    _status_rx: watch::Receiver<DetectorStatus>,
    events: broadcast::Sender<DetectorEvent>,
    prepared: Mutex<Option<PrepareRequest>>,
    run: Mutex<Option<JoinHandle<()>>>,
}

impl MockDetector {
    /// Creates an idle mock detector with default behavior.
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self::with_behavior(store, MockBehavior::default())
    }

    /// Creates an idle mock detector with the given behavior.
    pub fn with_behavior(store: Arc<MemoryStore>, behavior: MockBehavior) -> Self {
        let (status_tx, status_rx) = watch::channel(DetectorStatus::Idle);
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            behavior,
            status_tx,
            _status_rx: status_rx,
            events,
            prepared: Mutex::new(None),
            run: Mutex::new(None),
        }
    }

    /// Forces the status variable to `status`. Test hook for simulating a
    /// detector that is busy outside our control (e.g. trimming).
    pub fn set_status(&self, status: DetectorStatus) {
        publish_status(&self.status_tx, &self.events, status);
    }

    /// Simulates a dropped connection to the detector computer. Any running
    /// frame production stops; no further images appear.
    pub async fn disconnect(&self) {
        if let Some(run) = self.run.lock().await.take() {
            run.abort();
        }
        let _ = self.events.send(DetectorEvent::ConnectionLost);
    }

    fn reply(&self, command: DetectorCommand, success: bool, message: &str) {
        let _ = self.events.send(DetectorEvent::CommandReply {
            command,
            success,
            message: message.to_string(),
        });
    }
}

fn publish_status(
    status_tx: &watch::Sender<DetectorStatus>,
    events: &broadcast::Sender<DetectorEvent>,
    to: DetectorStatus,
) {
    let from = *status_tx.borrow();
    if from == to {
        return;
    }
    status_tx.send_replace(to);
    let _ = events.send(DetectorEvent::StatusChanged { from, to });
}

/// Generates a flat-field-ish counts image scaled by the exposure time.
fn synth_image(width: u32, height: u32, exposure_time: f64) -> ImageData {
    let mut rng = rand::thread_rng();
    let mean = (100.0 * exposure_time).max(1.0);
    let pixels = (0..(width as usize) * (height as usize))
        .map(|_| rng.gen_range(0.0..2.0 * mean).round())
        .collect();
    ImageData::new(width, height, pixels)
}

#[async_trait]
impl DetectorControl for MockDetector {
    async fn prepare(&self, request: PrepareRequest) -> Result<()> {
        debug!(
            prefix = %request.prefix,
            frames = request.frame_count,
            "mock detector: prepare queued"
        );
        *self.prepared.lock().await = Some(request);

        let events = self.events.clone();
        let behavior = self.behavior.clone();
        tokio::spawn(async move {
            sleep(behavior.ack_latency).await;
            let (success, message) = if behavior.fail_prepare {
                (false, "cannot program exposure: access denied")
            } else {
                (true, "exposure programmed")
            };
            let _ = events.send(DetectorEvent::CommandReply {
                command: DetectorCommand::Prepare,
                success,
                message: message.to_string(),
            });
        });
        Ok(())
    }

    async fn trigger(&self, first_frame_file: &str) -> Result<()> {
        let request = self
            .prepared
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("trigger received before prepare"))?;
        let (_, first_fsn) = parse_frame_file_name(first_frame_file)
            .ok_or_else(|| anyhow!("malformed frame file name: {first_frame_file}"))?;

        // The acknowledgement runs in its own task: a stop can abort the
        // exposure, but every command still gets its reply.
        {
            let events = self.events.clone();
            let behavior = self.behavior.clone();
            tokio::spawn(async move {
                sleep(behavior.ack_latency).await;
                let (success, message) = if behavior.fail_trigger {
                    (false, "cannot start exposure: shutter fault")
                } else {
                    (true, "exposure started")
                };
                let _ = events.send(DetectorEvent::CommandReply {
                    command: DetectorCommand::Trigger,
                    success,
                    message: message.to_string(),
                });
            });
        }
        if self.behavior.fail_trigger {
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let status_tx = self.status_tx.clone();
        let behavior = self.behavior.clone();

        let handle = tokio::spawn(async move {
            sleep(behavior.ack_latency).await;
            let status = if request.frame_count > 1 {
                DetectorStatus::ExposingMulti
            } else {
                DetectorStatus::Exposing
            };
            publish_status(&status_tx, &events, status);

            let (width, height) = behavior.image_size;
            for index in 0..request.frame_count {
                sleep(Duration::from_secs_f64(request.exposure_time)).await;
                if behavior.drop_frames.contains(&index) {
                    debug!(index, "mock detector: dropping frame");
                } else {
                    let image = synth_image(width, height, request.exposure_time);
                    store.insert_image(&request.prefix, first_fsn + index as u32, image);
                }
                if index + 1 < request.frame_count {
                    sleep(Duration::from_secs_f64(request.delay)).await;
                }
            }
            publish_status(&status_tx, &events, DetectorStatus::Idle);
        });
        *self.run.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.behavior.fail_stop {
            let events = self.events.clone();
            let latency = self.behavior.ack_latency;
            tokio::spawn(async move {
                sleep(latency).await;
                let _ = events.send(DetectorEvent::CommandReply {
                    command: DetectorCommand::Stop,
                    success: false,
                    message: "cannot stop: camserver busy".to_string(),
                });
            });
            return Ok(());
        }

        // Abort frame production right away; acknowledge and wind down the
        // status variable on the simulated hardware's schedule. The detector
        // reports a stopping cycle even when nothing was running, so every
        // stop ends in an observable idle status.
        if let Some(run) = self.run.lock().await.take() {
            run.abort();
        }
        let events = self.events.clone();
        let status_tx = self.status_tx.clone();
        let behavior = self.behavior.clone();
        tokio::spawn(async move {
            sleep(behavior.ack_latency).await;
            let _ = events.send(DetectorEvent::CommandReply {
                command: DetectorCommand::Stop,
                success: true,
                message: "exposure stop initiated".to_string(),
            });
            publish_status(&status_tx, &events, DetectorStatus::Stopping);
            sleep(behavior.stopping_latency).await;
            publish_status(&status_tx, &events, DetectorStatus::Idle);
        });
        Ok(())
    }

    fn status(&self) -> DetectorStatus {
        *self.status_tx.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FrameStore;

    #[tokio::test(start_paused = true)]
    async fn prepare_is_acknowledged_asynchronously() {
        let store = Arc::new(MemoryStore::new());
        let detector = MockDetector::new(store);
        let mut events = detector.subscribe();

        detector
            .prepare(PrepareRequest {
                prefix: "tst".to_string(),
                exposure_time: 0.1,
                frame_count: 1,
                delay: 0.003,
            })
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            DetectorEvent::CommandReply {
                command, success, ..
            } => {
                assert_eq!(command, DetectorCommand::Prepare);
                assert!(success);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_produces_frames_and_returns_to_idle() {
        let store = Arc::new(MemoryStore::new());
        let detector = MockDetector::new(Arc::clone(&store));
        let mut events = detector.subscribe();

        detector
            .prepare(PrepareRequest {
                prefix: "tst".to_string(),
                exposure_time: 0.5,
                frame_count: 2,
                delay: 0.01,
            })
            .await
            .unwrap();
        detector.trigger("tst_00000").await.unwrap();

        // Drain events until the detector goes idle again.
        loop {
            match events.recv().await.unwrap() {
                DetectorEvent::StatusChanged { to, .. } if to.is_idle() => break,
                _ => {}
            }
        }
        assert!(store.load_image("tst", 0).is_ok());
        assert!(store.load_image("tst", 1).is_ok());
        assert!(detector.status().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_frame_production() {
        let store = Arc::new(MemoryStore::new());
        let detector = MockDetector::new(Arc::clone(&store));
        let mut events = detector.subscribe();

        detector
            .prepare(PrepareRequest {
                prefix: "tst".to_string(),
                exposure_time: 10.0,
                frame_count: 3,
                delay: 0.01,
            })
            .await
            .unwrap();
        detector.trigger("tst_00000").await.unwrap();

        // Wait for the exposure to start, then stop it.
        loop {
            if let DetectorEvent::StatusChanged { to, .. } = events.recv().await.unwrap() {
                if to.is_exposing() {
                    break;
                }
            }
        }
        detector.stop().await.unwrap();
        loop {
            if let DetectorEvent::StatusChanged { to, .. } = events.recv().await.unwrap() {
                if to.is_idle() {
                    break;
                }
            }
        }
        assert_eq!(store.image_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_is_acknowledged_even_when_stopped_right_away() {
        let store = Arc::new(MemoryStore::new());
        let detector = MockDetector::new(Arc::clone(&store));
        let mut events = detector.subscribe();

        detector
            .prepare(PrepareRequest {
                prefix: "tst".to_string(),
                exposure_time: 5.0,
                frame_count: 1,
                delay: 0.003,
            })
            .await
            .unwrap();
        detector.trigger("tst_00000").await.unwrap();
        // Stop lands before the acknowledgement latency has elapsed.
        detector.stop().await.unwrap();

        let mut trigger_acked = false;
        loop {
            match events.recv().await.unwrap() {
                DetectorEvent::CommandReply {
                    command: DetectorCommand::Trigger,
                    success,
                    ..
                } => {
                    assert!(success);
                    trigger_acked = true;
                }
                DetectorEvent::StatusChanged { to, .. } if to.is_idle() => break,
                _ => {}
            }
        }
        assert!(trigger_acked);
        assert_eq!(store.image_count(), 0);
    }
}
