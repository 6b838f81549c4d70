//! Exposure sequencing core for a SAXS instrument control system.
//!
//! The instrument's area detector is slow and only partially observable:
//! it acknowledges commands asynchronously, reports no progress while
//! exposing, and deposits finished images as files some time after each
//! exposure nominally ended. This crate turns that into a reliable
//! request/response surface: one acquisition request in, exactly one
//! result per frame out, plus a paired start/finish event per batch.
//!
//! # Module map
//!
//! - [`expose`]: the sequencing core, the [`expose::Exposer`] orchestrator
//!   and the per-frame [`expose::ExposureTask`] state machine
//! - [`detector`]: the [`detector::DetectorControl`] trait and a
//!   deterministic mock implementation
//! - [`storage`]: the [`storage::FrameStore`] trait (sequence-number
//!   reservation, image lookup, mask resolution) and an in-memory backend
//! - [`metadata`]: frame headers and the instrument snapshots they are
//!   assembled from
//! - [`data`]: image, uncertainty and mask buffers
//! - [`timer`]: delayed and repeating callback primitives for the control
//!   loop
//! - [`config`]: figment-backed settings with environment overrides
//! - [`error`]: the exposure error taxonomy
//! - [`logging`]: tracing subscriber setup

pub mod config;
pub mod data;
pub mod detector;
pub mod error;
pub mod expose;
pub mod logging;
pub mod metadata;
pub mod storage;
pub mod timer;

pub use config::Settings;
pub use error::{ExposeError, ExposeResult};
pub use expose::{AcquisitionRequest, Exposer, ExposerState, ExposureEvent};
