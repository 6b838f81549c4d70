//! Command line front end.
//!
//! Drives the exposure sequencing core against the mock detector. Useful
//! for demos and for exercising failure paths (dropped frames, mid-batch
//! stops) without hardware.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use saxs_ctrl::config::{Settings, DEFAULT_CONFIG_PATH};
use saxs_ctrl::data::MaskData;
use saxs_ctrl::detector::{MockBehavior, MockDetector};
use saxs_ctrl::expose::{AcquisitionRequest, Exposer, ExposureEvent};
use saxs_ctrl::metadata::StaticSnapshots;
use saxs_ctrl::storage::{FrameStore, MemoryStore};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// SAXS exposure sequencing demo.
#[derive(Parser)]
#[command(name = "saxs-ctrl", version, about)]
struct Cli {
    /// Configuration file path.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Acquire a batch of exposures on the simulated detector.
    Expose {
        /// Sequence prefix the frames are filed under.
        #[arg(long, default_value = "tst")]
        prefix: String,

        /// Exposure time per frame in seconds.
        #[arg(long, default_value_t = 0.5)]
        exposure_time: f64,

        /// Number of frames in the batch.
        #[arg(long, default_value_t = 1)]
        frames: usize,

        /// Inter-frame delay in seconds. Defaults to the configured value.
        #[arg(long)]
        delay: Option<f64>,

        /// Mask to use instead of the configured one.
        #[arg(long)]
        mask: Option<String>,

        /// Frame indices whose image the simulated detector never writes.
        /// Those frames will time out.
        #[arg(long = "drop-frame")]
        drop_frames: Vec<usize>,

        /// Stop the batch after this many seconds.
        #[arg(long)]
        stop_after: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config).context("loading configuration")?;
    settings.validate().map_err(|msg| anyhow!(msg))?;
    saxs_ctrl::logging::init(&settings.application.log_level)?;

    match cli.command {
        CliCommand::Expose {
            prefix,
            exposure_time,
            frames,
            delay,
            mask,
            drop_frames,
            stop_after,
        } => {
            run_expose(
                &settings, prefix, exposure_time, frames, delay, mask, drop_frames, stop_after,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_expose(
    settings: &Settings,
    prefix: String,
    exposure_time: f64,
    frames: usize,
    delay: Option<f64>,
    mask: Option<String>,
    drop_frames: Vec<usize>,
    stop_after: Option<f64>,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.insert_mask("default.mask", MaskData::ones(32, 32));
    let behavior = MockBehavior {
        drop_frames: drop_frames.into_iter().collect(),
        ..MockBehavior::default()
    };
    let detector = Arc::new(MockDetector::with_behavior(Arc::clone(&store), behavior));
    let exposer = Exposer::spawn(
        detector,
        Arc::clone(&store) as Arc<dyn FrameStore>,
        Arc::new(StaticSnapshots::default()),
        settings.exposure.clone(),
    );
    let mut events = exposer.subscribe();

    let delay = delay.unwrap_or(settings.exposure.default_delay_secs);
    let mut request = AcquisitionRequest::new(prefix, exposure_time, frames).with_delay(delay);
    if let Some(mask) = mask {
        request = request.with_mask_override(mask);
    }

    let first_fsn = exposer.start_acquisition(request).await?;
    info!(first_fsn, frames, "acquisition accepted");

    if let Some(secs) = stop_after {
        let stopper = exposer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            if let Err(err) = stopper.stop_acquisition().await {
                error!(error = %err, "stop request failed");
            }
        });
    }

    let mut finished = 0usize;
    let mut succeeded = 0usize;
    let mut batch_done = false;
    let mut last_header = None;
    while finished < frames || !batch_done {
        match events.recv().await? {
            ExposureEvent::BatchStarted => info!("batch started"),
            ExposureEvent::BatchProgress {
                fsn,
                now,
                start,
                end,
                ..
            } => {
                let elapsed = now.saturating_duration_since(start).as_secs_f64();
                let total = (end - start).as_secs_f64();
                info!(fsn, "exposing: {elapsed:.1}/{total:.1} s");
            }
            ExposureEvent::BatchFinished { success } => {
                info!(success, "batch finished");
                batch_done = true;
            }
            ExposureEvent::FrameFinished {
                fsn,
                success,
                frame,
                ..
            } => {
                finished += 1;
                if success {
                    succeeded += 1;
                }
                info!(fsn, success, "frame finished");
                if let Some(frame) = frame {
                    last_header = Some(frame.header.clone());
                }
            }
        }
    }

    println!("{succeeded}/{frames} frames acquired");
    if let Some(header) = last_header {
        println!("{}", serde_json::to_string_pretty(&header)?);
    }
    Ok(())
}
