//! Frame containers and stage hand-off slots.
//!
//! - `Frame`: an RGB pixel buffer tagged with its capture sequence and instant.
//! - `FrameSlot`: single-capacity, replace-on-push buffer between pipeline stages.
//!
//! Frames are immutable once produced and travel between stages as
//! `SharedFrame` (`Arc<Frame>`), so fan-out to several consumers never copies
//! pixel data.

use image::{imageops::FilterType, Rgb, RgbImage};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Shared handle to an immutable frame.
pub type SharedFrame = Arc<Frame>;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded video frame (RGB8, row-major).
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Capture sequence number. 0 is reserved for synthesized placeholders.
    pub seq: u64,
    /// Monotonic capture instant of the source frame.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            captured_at: Instant::now(),
        }
    }

    /// Derive a new frame from this one, keeping its capture identity.
    pub fn derive(&self, image: RgbImage) -> Self {
        Self {
            image,
            seq: self.seq,
            captured_at: self.captured_at,
        }
    }

    /// Black placeholder frame used before any real frame is available.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(RgbImage::from_pixel(width, height, Rgb([0, 0, 0])), 0)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Resized copy at the given output resolution. Returns a plain clone when
    /// the frame already has those dimensions.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        if self.width() == width && self.height() == height {
            return self.clone();
        }
        let image = image::imageops::resize(&self.image, width, height, FilterType::Triangle);
        self.derive(image)
    }

    pub fn is_placeholder(&self) -> bool {
        self.seq == 0
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: single-frame hand-off buffer
// ----------------------------------------------------------------------------

/// Single-capacity frame slot.
///
/// A push always succeeds: any unread frame is replaced and dropped, so the
/// slot holds at most one frame and it is always the most recent push.
/// Producers never block. Consumers either poll (`try_pop`) or wait with a
/// bounded timeout (`pop_timeout`).
pub struct FrameSlot {
    name: &'static str,
    inner: Mutex<Option<SharedFrame>>,
    ready: Condvar,
}

impl FrameSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store `frame`, returning the unread frame it displaced, if any.
    pub fn push(&self, frame: SharedFrame) -> Option<SharedFrame> {
        let displaced = self.lock().replace(frame);
        self.ready.notify_one();
        displaced
    }

    /// Take the pending frame without waiting.
    pub fn try_pop(&self) -> Option<SharedFrame> {
        self.lock().take()
    }

    /// Take the pending frame, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SharedFrame> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(frame) = guard.take() {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            guard = match self.ready.wait_timeout(guard, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    /// Number of unread frames (0 or 1).
    pub fn len(&self) -> usize {
        usize::from(!self.is_empty())
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<SharedFrame>> {
        // A panic while holding the slot lock cannot leave the Option in a
        // torn state, so recovering the guard is sound.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The three stage boundaries of the pipeline.
pub struct PipelineSlots {
    /// Capture -> inference.
    pub raw: Arc<FrameSlot>,
    /// Inference -> AI feed publishers.
    pub ai: Arc<FrameSlot>,
    /// Capture -> clean feed publishers.
    pub clean: Arc<FrameSlot>,
}

impl PipelineSlots {
    pub fn new() -> Self {
        Self {
            raw: Arc::new(FrameSlot::new("raw")),
            ai: Arc::new(FrameSlot::new("ai")),
            clean: Arc::new(FrameSlot::new("clean")),
        }
    }
}

impl Default for PipelineSlots {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
