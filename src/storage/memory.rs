//! In-memory frame store.
//!
//! Reference [`FrameStore`] implementation backing the integration tests
//! and the simulator binary. Images "arrive" when something (normally the
//! mock detector) inserts them, which reproduces the production situation
//! where the detector writes files that the control software then polls.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::data::{ImageData, MaskData};
use crate::metadata::FrameHeader;
use crate::storage::{FrameStore, StoreError, StoreResult};

/// Thread-safe in-memory image, mask and header storage with per-prefix
/// sequence counters.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, u32>>,
    images: Mutex<HashMap<(String, u32), ImageData>>,
    masks: Mutex<HashMap<String, MaskData>>,
    headers: Mutex<Vec<FrameHeader>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposits a raw image, making it visible to `load_image`.
    pub fn insert_image(&self, prefix: &str, fsn: u32, image: ImageData) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((prefix.to_string(), fsn), image);
    }

    /// Registers a named mask.
    pub fn insert_mask(&self, name: &str, mask: MaskData) {
        self.masks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), mask);
    }

    /// All headers written so far, in write order.
    pub fn headers(&self) -> Vec<FrameHeader> {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of images currently stored.
    pub fn image_count(&self) -> usize {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl FrameStore for MemoryStore {
    fn reserve(&self, prefix: &str, count: usize) -> StoreResult<u32> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = counters.entry(prefix.to_string()).or_insert(0);
        let first = *next;
        *next += count as u32;
        Ok(first)
    }

    fn load_image(&self, prefix: &str, fsn: u32) -> StoreResult<ImageData> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(prefix.to_string(), fsn))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(crate::storage::frame_file_name(prefix, fsn))
            })
    }

    fn resolve_mask(&self, name: &str) -> StoreResult<MaskData> {
        self.masks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn write_header(&self, header: &FrameHeader) -> StoreResult<()> {
        self.headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(header.clone());
        Ok(())
    }
}
