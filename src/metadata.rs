//! Frame metadata assembly.
//!
//! Every finished exposure carries a [`FrameHeader`]: the frame identity,
//! its nominal timing, and snapshots of the instrument environment and
//! geometry taken at the moment the image was read back. Snapshots come
//! from a [`SnapshotSource`] collaborator so the sequencing core never
//! talks to environmental sensors or the geometry store directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Environmental sensor readings at frame completion.
///
/// Readings are optional: a sensor that is offline simply contributes
/// nothing instead of failing the frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Flight-tube vacuum pressure in mbar, if the gauge is online.
    pub vacuum_pressure: Option<f64>,
    /// Sample stage temperature in degrees Celsius, if the sensor is online.
    pub temperature: Option<f64>,
}

/// Instrument geometry at frame completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometrySnapshot {
    /// Nominal sample-to-detector distance in mm.
    pub sample_detector_distance: f64,
    /// Uncertainty of the nominal distance in mm.
    pub sample_detector_distance_error: f64,
    /// Beam center on the detector, (column, row) in pixels.
    pub beam_center: (f64, f64),
    /// Detector pixel size in mm.
    pub pixel_size: f64,
    /// X-ray wavelength in angstroms.
    pub wavelength: f64,
    /// Default mask name for this geometry.
    pub mask: String,
}

impl Default for GeometrySnapshot {
    fn default() -> Self {
        // Plausible pinhole-camera defaults: Cu K-alpha source, Pilatus-class
        // pixel size. Real deployments override these from the geometry store.
        Self {
            sample_detector_distance: 1000.0,
            sample_detector_distance_error: 0.5,
            beam_center: (300.0, 250.0),
            pixel_size: 0.172,
            wavelength: 1.5418,
            mask: "default.mask".to_string(),
        }
    }
}

/// The sample currently in the beam, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSnapshot {
    /// Sample name.
    pub name: String,
    /// Correction subtracted from the nominal sample-to-detector distance
    /// (thick samples sit closer to the detector than the stage reference).
    pub distance_correction: f64,
    /// Uncertainty of the distance correction in mm.
    pub distance_correction_error: f64,
    /// Per-sample mask override, if the sample defines one.
    pub mask_override: Option<String>,
}

/// Source of environment, geometry and sample snapshots.
///
/// Implemented by the instrument composition layer; the sequencing core
/// only reads through this trait while assembling headers.
pub trait SnapshotSource: Send + Sync {
    /// Current environmental sensor readings.
    fn environment(&self) -> EnvironmentSnapshot;
    /// Current instrument geometry.
    fn geometry(&self) -> GeometrySnapshot;
    /// The sample currently in the beam, or `None` between samples.
    fn sample(&self) -> Option<SampleSnapshot>;
}

/// Fixed snapshots, for tests and the simulated instrument.
#[derive(Debug, Clone, Default)]
pub struct StaticSnapshots {
    /// Environment returned by every call.
    pub environment: EnvironmentSnapshot,
    /// Geometry returned by every call.
    pub geometry: GeometrySnapshot,
    /// Sample returned by every call.
    pub sample: Option<SampleSnapshot>,
}

impl SnapshotSource for StaticSnapshots {
    fn environment(&self) -> EnvironmentSnapshot {
        self.environment.clone()
    }

    fn geometry(&self) -> GeometrySnapshot {
        self.geometry.clone()
    }

    fn sample(&self) -> Option<SampleSnapshot> {
        self.sample.clone()
    }
}

/// Metadata record persisted alongside every finished frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Sequence prefix ("crd", "tst", "scn", ...).
    pub prefix: String,
    /// File sequence number within the prefix.
    pub fsn: u32,
    /// Nominal exposure time in seconds.
    pub exposure_time: f64,
    /// Wall-clock time of the estimated exposure start.
    pub start_date: DateTime<Utc>,
    /// Wall-clock time of the estimated exposure end.
    pub end_date: DateTime<Utc>,
    /// Mask selected for this frame after override resolution.
    pub mask: String,
    /// Sample-to-detector distance corrected for the sample position.
    pub true_distance: f64,
    /// Uncertainty of the corrected distance.
    pub true_distance_error: f64,
    /// Environmental readings at readback time.
    pub environment: EnvironmentSnapshot,
    /// Instrument geometry at readback time.
    pub geometry: GeometrySnapshot,
    /// Sample in the beam, if any.
    pub sample: Option<SampleSnapshot>,
}

impl FrameHeader {
    /// Assembles the header for a finished frame.
    ///
    /// Mask precedence: an explicit per-frame override wins over the sample's
    /// own override, which wins over the geometry default. The true
    /// sample-to-detector distance subtracts the sample's distance correction
    /// from the nominal geometry value, with errors added in quadrature.
    pub fn assemble(
        prefix: &str,
        fsn: u32,
        exposure_time: f64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        mask_override: Option<&str>,
        source: &dyn SnapshotSource,
    ) -> Self {
        let geometry = source.geometry();
        let sample = source.sample();
        let environment = source.environment();

        let mask = mask_override
            .map(str::to_owned)
            .or_else(|| sample.as_ref().and_then(|s| s.mask_override.clone()))
            .unwrap_or_else(|| geometry.mask.clone());

        let (true_distance, true_distance_error) = match &sample {
            Some(s) => (
                geometry.sample_detector_distance - s.distance_correction,
                (geometry.sample_detector_distance_error.powi(2)
                    + s.distance_correction_error.powi(2))
                .sqrt(),
            ),
            None => (
                geometry.sample_detector_distance,
                geometry.sample_detector_distance_error,
            ),
        };

        Self {
            prefix: prefix.to_string(),
            fsn,
            exposure_time,
            start_date,
            end_date,
            mask,
            true_distance,
            true_distance_error,
            environment,
            geometry,
            sample,
        }
    }
}
