//! File sequence and mask resolution.
//!
//! The sequencing core never touches the filesystem directly: it reserves
//! sequence numbers, polls for finished images and resolves masks through
//! the [`FrameStore`] trait. The production implementation sits in the
//! instrument's I/O layer; [`memory::MemoryStore`] is the in-process
//! reference used by tests and the simulator binary.
//!
//! Frame identity is `(prefix, fsn)`: the prefix is the logical sequence
//! name ("crd" for sample frames, "tst" for test frames, ...) and the fsn
//! is a unique, monotonically assigned number within that prefix.

pub mod memory;

use thiserror::Error;

use crate::data::{ImageData, MaskData};
use crate::metadata::FrameHeader;

pub use memory::MemoryStore;

/// Errors from the frame store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested image or mask does not exist (yet). Image polling
    /// treats this as "keep waiting", everything else as a failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Convenience alias for store results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The file/mask resolver contract consumed by the sequencing core.
///
/// Implementations must be cheap to call from the control loop: image and
/// mask lookups are local filesystem (or in-memory) operations.
pub trait FrameStore: Send + Sync {
    /// Reserves `count` consecutive sequence numbers for `prefix` and
    /// returns the first one. Side-effecting: must be called exactly once
    /// per batch, before any task is created.
    fn reserve(&self, prefix: &str, count: usize) -> StoreResult<u32>;

    /// Loads the raw image for a frame. Returns [`StoreError::NotFound`]
    /// while the file does not exist yet.
    fn load_image(&self, prefix: &str, fsn: u32) -> StoreResult<ImageData>;

    /// Loads a mask by name. Returns [`StoreError::NotFound`] if absent.
    fn resolve_mask(&self, name: &str) -> StoreResult<MaskData>;

    /// Persists the metadata record of a finished frame.
    fn write_header(&self, header: &FrameHeader) -> StoreResult<()>;
}

/// Canonical frame file name: `{prefix}_{fsn:05}`.
///
/// The detector receives this name with the trigger command and writes the
/// image under it; the store resolves it back when the image is polled.
pub fn frame_file_name(prefix: &str, fsn: u32) -> String {
    format!("{prefix}_{fsn:05}")
}

/// Splits a frame file name back into `(prefix, fsn)`.
///
/// Accepts anything `frame_file_name` produces, with or without an
/// extension. Returns `None` for names without a numeric suffix.
pub fn parse_frame_file_name(name: &str) -> Option<(&str, u32)> {
    let stem = name.split('.').next().unwrap_or(name);
    let (prefix, digits) = stem.rsplit_once('_')?;
    let fsn = digits.parse().ok()?;
    Some((prefix, fsn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_zero_padded() {
        assert_eq!(frame_file_name("tst", 7), "tst_00007");
        assert_eq!(frame_file_name("crd", 123456), "crd_123456");
    }

    #[test]
    fn parse_round_trips_and_handles_extensions() {
        assert_eq!(parse_frame_file_name("tst_00007"), Some(("tst", 7)));
        assert_eq!(parse_frame_file_name("crd_00042.cbf"), Some(("crd", 42)));
        assert_eq!(parse_frame_file_name("no_digits_"), None);
        assert_eq!(parse_frame_file_name("plain"), None);
    }
}
