//! End-to-end sequencing behavior against the simulated detector.
//!
//! Every test runs on a paused clock, so nominal exposure times cost no
//! wall time and timer ordering is deterministic.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;

use saxs_ctrl::config::ExposureSettings;
use saxs_ctrl::data::MaskData;
use saxs_ctrl::detector::{DetectorControl, DetectorStatus, MockBehavior, MockDetector};
use saxs_ctrl::error::ExposeError;
use saxs_ctrl::expose::{AcquisitionRequest, Exposer, ExposerState, ExposureEvent};
use saxs_ctrl::metadata::StaticSnapshots;
use saxs_ctrl::storage::{FrameStore, MemoryStore};

struct Rig {
    exposer: Exposer,
    detector: Arc<MockDetector>,
    store: Arc<MemoryStore>,
}

fn rig_with(behavior: MockBehavior) -> Rig {
    let store = Arc::new(MemoryStore::new());
    store.insert_mask("default.mask", MaskData::ones(32, 32));
    let detector = Arc::new(MockDetector::with_behavior(Arc::clone(&store), behavior));
    let exposer = Exposer::spawn(
        Arc::clone(&detector) as Arc<dyn DetectorControl>,
        Arc::clone(&store) as Arc<dyn FrameStore>,
        Arc::new(StaticSnapshots::default()),
        ExposureSettings::default(),
    );
    Rig {
        exposer,
        detector,
        store,
    }
}

fn rig() -> Rig {
    rig_with(MockBehavior::default())
}

/// Everything one batch emitted, in arrival order per category.
#[derive(Debug, Default)]
struct BatchLog {
    started: usize,
    finished: Vec<bool>,
    /// (fsn, success, carries a frame payload)
    frames: Vec<(u32, bool, bool)>,
    progress: usize,
}

impl BatchLog {
    fn sorted_frames(&self) -> Vec<(u32, bool, bool)> {
        let mut frames = self.frames.clone();
        frames.sort_unstable();
        frames
    }
}

/// Receives events until one `BatchFinished` and `expected_frames`
/// `FrameFinished` events have arrived, in either order.
async fn drain_batch(
    events: &mut broadcast::Receiver<ExposureEvent>,
    expected_frames: usize,
) -> BatchLog {
    let mut log = BatchLog::default();
    while log.finished.is_empty() || log.frames.len() < expected_frames {
        match events.recv().await.unwrap() {
            ExposureEvent::BatchStarted => log.started += 1,
            ExposureEvent::BatchProgress { .. } => log.progress += 1,
            ExposureEvent::BatchFinished { success } => log.finished.push(success),
            ExposureEvent::FrameFinished {
                fsn,
                success,
                frame,
                ..
            } => log.frames.push((fsn, success, frame.is_some())),
        }
    }
    log
}

#[tokio::test(start_paused = true)]
async fn single_frame_batch_succeeds() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    let first_fsn = rig
        .exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap();
    assert_eq!(first_fsn, 0);

    let log = drain_batch(&mut events, 1).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![true]);
    assert_eq!(log.frames, vec![(0, true, true)]);

    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 0);
    assert_eq!(rig.store.headers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn multi_frame_batch_yields_one_result_per_frame() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 3).with_delay(0.01))
        .await
        .unwrap();

    let log = drain_batch(&mut events, 3).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![true]);
    assert_eq!(
        log.sorted_frames(),
        vec![(0, true, true), (1, true, true), (2, true, true)]
    );
    assert!(log.progress >= 1);
    assert_eq!(rig.store.headers().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn finished_frames_carry_assembled_metadata() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap();

    loop {
        if let ExposureEvent::FrameFinished { frame, .. } = events.recv().await.unwrap() {
            let frame = frame.unwrap();
            assert_eq!(frame.header.prefix, "tst");
            assert_eq!(frame.header.fsn, 0);
            assert_eq!(frame.header.exposure_time, 0.5);
            assert_eq!(frame.header.mask, "default.mask");
            assert_eq!(frame.image.len(), frame.uncertainty.len());
            assert_eq!(frame.mask, MaskData::ones(32, 32));
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn progress_is_reported_while_exposing() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 2.0, 1))
        .await
        .unwrap();

    let mut saw_progress = false;
    loop {
        match events.recv().await.unwrap() {
            ExposureEvent::BatchProgress {
                prefix,
                fsn,
                now,
                start,
                end,
            } => {
                assert_eq!(prefix, "tst");
                assert_eq!(fsn, 0);
                assert!(start <= now && now <= end);
                saw_progress = true;
            }
            ExposureEvent::BatchFinished { .. } => break,
            _ => {}
        }
    }
    assert!(saw_progress);
}

#[tokio::test(start_paused = true)]
async fn dropped_frame_times_out_while_the_others_finish() {
    let rig = rig_with(MockBehavior {
        drop_frames: HashSet::from([1]),
        ..MockBehavior::default()
    });
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 3).with_delay(0.01))
        .await
        .unwrap();

    let log = drain_batch(&mut events, 3).await;
    // The detector itself completed normally; only the lost frame fails.
    assert_eq!(log.finished, vec![true]);
    assert_eq!(
        log.sorted_frames(),
        vec![(0, true, true), (1, false, false), (2, true, true)]
    );
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_trigger_fails_every_frame_and_pairs_the_batch_events() {
    let rig = rig_with(MockBehavior {
        fail_trigger: true,
        ..MockBehavior::default()
    });
    let mut events = rig.exposer.subscribe();

    // The start call itself succeeds: the rejection arrives asynchronously.
    let first_fsn = rig
        .exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 2))
        .await
        .unwrap();
    assert_eq!(first_fsn, 0);

    let log = drain_batch(&mut events, 2).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![false]);
    assert_eq!(log.sorted_frames(), vec![(0, false, false), (1, false, false)]);

    // The exposer recovered; sequence numbers were consumed by the
    // reservation and are not reused.
    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_prepare_fails_the_batch_the_same_way() {
    let rig = rig_with(MockBehavior {
        fail_prepare: true,
        ..MockBehavior::default()
    });
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap();

    let log = drain_batch(&mut events, 1).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![false]);
    assert_eq!(log.frames, vec![(0, false, false)]);
    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn busy_detector_rejects_the_start_without_side_effects() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();
    rig.detector.set_status(DetectorStatus::Trimming);

    let err = rig
        .exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExposeError::DeviceBusy(DetectorStatus::Trimming)
    ));

    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
    assert!(events.try_recv().is_err());
    // No sequence numbers were reserved.
    assert_eq!(rig.store.reserve("tst", 1).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_remaining_frames_and_allows_a_restart() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 1.0, 3))
        .await
        .unwrap();

    // Let frame 0 complete, then stop during frame 1.
    sleep(Duration::from_millis(1500)).await;
    rig.exposer.stop_acquisition().await.unwrap();

    let log = drain_batch(&mut events, 3).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![false]);
    assert_eq!(
        log.sorted_frames(),
        vec![(0, true, true), (1, false, false), (2, false, false)]
    );

    // Idle again; the next batch continues the sequence numbering.
    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
    let next = rig
        .exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap();
    assert_eq!(next, 3);
    let log = drain_batch(&mut events, 1).await;
    assert_eq!(log.finished, vec![true]);
    assert_eq!(log.frames, vec![(3, true, true)]);
}

#[tokio::test(start_paused = true)]
async fn frames_under_different_prefixes_do_not_collide() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    // First batch: its frame is still waiting for the image when the
    // detector goes idle.
    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap();
    let log = drain_batch(&mut events, 0).await;
    assert_eq!(log.finished, vec![true]);

    // The second prefix starts its own numbering at 0, colliding with the
    // live frame's sequence number.
    let first = rig
        .exposer
        .start_acquisition(AcquisitionRequest::new("crd", 0.5, 1))
        .await
        .unwrap();
    assert_eq!(first, 0);

    let mut frames = Vec::new();
    while frames.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("both frames must finish")
            .unwrap();
        if let ExposureEvent::FrameFinished {
            prefix,
            fsn,
            success,
            ..
        } = event
        {
            frames.push((prefix, fsn, success));
        }
    }
    frames.sort();
    assert_eq!(
        frames,
        vec![("crd".to_string(), 0, true), ("tst".to_string(), 0, true)]
    );
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_racing_the_trigger_acknowledgement_settles_idle() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 5.0, 1))
        .await
        .unwrap();
    // Between the prepare acknowledgement and the trigger acknowledgement.
    sleep(Duration::from_millis(6)).await;
    rig.exposer.stop_acquisition().await.unwrap();

    let log = drain_batch(&mut events, 1).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![false]);
    assert_eq!(log.frames, vec![(0, false, false)]);
    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_requested_while_preparing_still_stops_the_batch() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 5.0, 1))
        .await
        .unwrap();
    // Before the prepare acknowledgement: the hardware stop lands before
    // the trigger and aborts nothing, so it has to be repeated.
    sleep(Duration::from_millis(1)).await;
    rig.exposer.stop_acquisition().await.unwrap();

    let log = drain_batch(&mut events, 1).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![false]);
    assert_eq!(log.frames, vec![(0, false, false)]);
    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_stop_leaves_the_batch_running() {
    let rig = rig_with(MockBehavior {
        fail_stop: true,
        ..MockBehavior::default()
    });
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 1.0, 2).with_delay(0.01))
        .await
        .unwrap();
    sleep(Duration::from_millis(500)).await;
    // The request goes through; the hardware rejects it asynchronously.
    rig.exposer.stop_acquisition().await.unwrap();

    let log = drain_batch(&mut events, 2).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![true]);
    assert_eq!(log.sorted_frames(), vec![(0, true, true), (1, true, true)]);
    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_fails_the_batch() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 10.0, 1))
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;
    rig.detector.disconnect().await;

    let log = drain_batch(&mut events, 1).await;
    assert_eq!(log.started, 1);
    assert_eq!(log.finished, vec![false]);
    assert_eq!(log.frames, vec![(0, false, false)]);
    assert_eq!(rig.exposer.state().await.unwrap(), ExposerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn next_batch_may_start_while_an_image_is_still_in_flight() {
    let rig = rig();
    let mut events = rig.exposer.subscribe();

    rig.exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap();

    // The detector goes idle the moment the last exposure ends, while the
    // frame is still polling for its image.
    let log = drain_batch(&mut events, 0).await;
    assert_eq!(log.finished, vec![true]);
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 1);

    let next = rig
        .exposer
        .start_acquisition(AcquisitionRequest::new("tst", 0.5, 1))
        .await
        .unwrap();
    assert_eq!(next, 1);

    // Both the late frame of batch one and the frame of batch two complete.
    let log = drain_batch(&mut events, 2).await;
    assert_eq!(log.finished, vec![true]);
    assert_eq!(log.sorted_frames(), vec![(0, true, true), (1, true, true)]);
    assert_eq!(rig.exposer.images_pending().await.unwrap(), 0);
}
