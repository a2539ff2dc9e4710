//! Pooled image buffers and generation-tagged image handles.
//!
//! `ImageData` is the mutable pooled buffer: pixel bytes plus the per-request
//! metadata filled in when the completion event arrives. `Image` is the
//! consumer-facing handle; it captures the pool slot's generation at checkout
//! and is only valid while the slot has not been recycled for another
//! request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::pool::{Checkout, ObjectPool, Reusable};

/// Distortion calibration grid dimensions: 64x64 points of 2 floats, with two
/// stacked maps (one per stereo sensor).
pub const DISTORTION_GRID_WIDTH: usize = 64;
pub const DISTORTION_GRID_HEIGHT: usize = 64;
pub const DISTORTION_GRID_FLOATS: usize = DISTORTION_GRID_WIDTH * DISTORTION_GRID_HEIGHT * 2 * 2;

/// Versioned distortion calibration grid, shared by reference across every
/// image taken under the same calibration generation.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionData {
    /// Increases monotonically whenever the physical calibration changes
    /// (device reorientation or device swap).
    pub version: u64,
    pub grid: Vec<f32>,
}

impl DistortionData {
    pub fn is_valid(&self) -> bool {
        self.version > 0 && self.grid.len() == DISTORTION_GRID_FLOATS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ImageKind {
    Default,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ImageFormat {
    Infrared,
    Rgb,
}

/// Pooled, mutable image buffer. Mutated in place while a request is pending;
/// reset (retaining its pixel allocation) when checked back in.
#[derive(Debug)]
pub struct ImageData {
    pub kind: ImageKind,
    pub format: ImageFormat,
    pub bytes_per_pixel: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: i64,
    pub frame_id: i64,
    pub ray_offset_x: f32,
    pub ray_offset_y: f32,
    pub ray_scale_x: f32,
    pub ray_scale_y: f32,
    pub pixels: Vec<u8>,
    pub distortion: Option<Arc<DistortionData>>,
    pub complete: bool,
}

impl Default for ImageData {
    fn default() -> Self {
        Self {
            kind: ImageKind::Default,
            format: ImageFormat::Infrared,
            bytes_per_pixel: 1,
            width: 0,
            height: 0,
            timestamp_us: 0,
            frame_id: -1,
            ray_offset_x: 0.0,
            ray_offset_y: 0.0,
            ray_scale_x: 0.0,
            ray_scale_y: 0.0,
            pixels: Vec::new(),
            distortion: None,
            complete: false,
        }
    }
}

impl Reusable for ImageData {
    fn reset(&mut self) {
        self.kind = ImageKind::Default;
        self.format = ImageFormat::Infrared;
        self.bytes_per_pixel = 1;
        self.width = 0;
        self.height = 0;
        self.timestamp_us = 0;
        self.frame_id = -1;
        self.ray_offset_x = 0.0;
        self.ray_offset_y = 0.0;
        self.ray_scale_x = 0.0;
        self.ray_scale_y = 0.0;
        self.pixels.clear();
        self.distortion = None;
        self.complete = false;
    }
}

/// Shared pool type for image buffers.
pub type ImagePool = Arc<Mutex<ObjectPool<ImageData>>>;

struct ImageGuard {
    data: Arc<Mutex<ImageData>>,
    pool: Weak<Mutex<ObjectPool<ImageData>>>,
    pool_index: usize,
    generation: u64,
    surrendered: AtomicBool,
}

impl ImageGuard {
    fn check_in(&self) {
        if let Some(pool) = self.pool.upgrade() {
            if let Ok(mut pool) = pool.lock() {
                pool.check_in(self.pool_index, self.generation);
            }
        }
    }
}

impl Drop for ImageGuard {
    fn drop(&mut self) {
        if !self.surrendered.load(Ordering::Acquire) {
            self.check_in();
        }
    }
}

/// Weak handle onto a pooled image buffer. Clones share the same underlying
/// reservation; the buffer returns to the pool when the last clone drops (or
/// when the connection surrenders it after a failed request).
#[derive(Clone)]
pub struct Image {
    guard: Arc<ImageGuard>,
}

impl Image {
    pub(crate) fn new(pool: &ImagePool, checkout: Checkout<ImageData>) -> Self {
        Self {
            guard: Arc::new(ImageGuard {
                data: checkout.item,
                pool: Arc::downgrade(pool),
                pool_index: checkout.pool_index,
                generation: checkout.generation,
                surrendered: AtomicBool::new(false),
            }),
        }
    }

    /// True only while the pool slot still holds this handle's generation,
    /// i.e. the slot has not been recycled for another request.
    pub fn is_valid(&self) -> bool {
        let Some(pool) = self.guard.pool.upgrade() else {
            return false;
        };
        let Ok(pool) = pool.lock() else {
            return false;
        };
        pool.current_generation(self.guard.pool_index) == self.guard.generation
    }

    /// Generation stamp captured at checkout; doubles as a request sequence
    /// number.
    pub fn sequence(&self) -> u64 {
        self.guard.generation
    }

    pub fn pool_index(&self) -> usize {
        self.guard.pool_index
    }

    pub fn is_complete(&self) -> bool {
        self.with_data(|d| d.complete).unwrap_or(false)
    }

    /// Runs `f` against the underlying buffer, or returns `None` when the
    /// slot has been recycled out from under this handle.
    pub fn with_data<R>(&self, f: impl FnOnce(&ImageData) -> R) -> Option<R> {
        if !self.is_valid() {
            return None;
        }
        let data = self.guard.data.lock().ok()?;
        Some(f(&data))
    }

    pub fn width(&self) -> u32 {
        self.with_data(|d| d.width).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.with_data(|d| d.height).unwrap_or(0)
    }

    pub fn frame_id(&self) -> i64 {
        self.with_data(|d| d.frame_id).unwrap_or(-1)
    }

    pub fn distortion(&self) -> Option<Arc<DistortionData>> {
        self.with_data(|d| d.distortion.clone()).flatten()
    }

    pub(crate) fn data(&self) -> &Arc<Mutex<ImageData>> {
        &self.guard.data
    }

    /// Returns the buffer to the pool immediately, invalidating every clone
    /// of this handle. Used when a request fails or is purged.
    pub(crate) fn surrender(&self) {
        if !self.guard.surrendered.swap(true, Ordering::AcqRel) {
            self.guard.check_in();
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("pool_index", &self.guard.pool_index)
            .field("sequence", &self.guard.generation)
            .field("valid", &self.is_valid())
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> ImagePool {
        Arc::new(Mutex::new(ObjectPool::new(capacity, false)))
    }

    fn check_out(pool: &ImagePool) -> Image {
        let checkout = pool.lock().unwrap().check_out();
        Image::new(pool, checkout)
    }

    #[test]
    fn handle_is_valid_until_slot_recycled() {
        let pool = pool(1);
        let first = check_out(&pool);
        assert!(first.is_valid());

        // Capacity 1 and no check-in: the next checkout recycles the slot.
        let second = check_out(&pool);
        assert!(!first.is_valid(), "stale generation after forced recycle");
        assert!(second.is_valid());
    }

    #[test]
    fn drop_of_last_clone_returns_buffer() {
        let pool = pool(2);
        let image = check_out(&pool);
        let clone = image.clone();
        drop(image);
        assert!(clone.is_valid(), "reservation survives while a clone lives");
        drop(clone);
        assert_eq!(pool.lock().unwrap().in_use(), 0);
    }

    #[test]
    fn surrender_invalidates_all_clones() {
        let pool = pool(2);
        let image = check_out(&pool);
        let clone = image.clone();
        image.surrender();
        assert!(!clone.is_valid());
        assert_eq!(pool.lock().unwrap().in_use(), 0);
        // Later drops must not check the slot in a second time.
        drop(clone);
        drop(image);
        assert_eq!(pool.lock().unwrap().in_use(), 0);
    }

    #[test]
    fn stale_handle_reads_nothing() {
        let pool = pool(1);
        let first = check_out(&pool);
        first.data().lock().unwrap().width = 640;
        let _second = check_out(&pool);
        assert_eq!(first.with_data(|d| d.width), None);
        assert_eq!(first.width(), 0);
    }

    #[test]
    fn reset_keeps_pixel_allocation() {
        let mut data = ImageData::default();
        data.pixels.resize(4096, 7);
        let cap = data.pixels.capacity();
        data.reset();
        assert!(data.pixels.is_empty());
        assert_eq!(data.pixels.capacity(), cap);
    }
}
