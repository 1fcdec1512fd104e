use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::{DetectorBackend, InferMode, InferParams};
use crate::detect::result::Detection;
use crate::detect::tracker::IouTracker;

/// Stub backend for `stub://` sources and tests.
///
/// Emits a fixed set of detections on every call, filtered by the call's
/// thresholds and class allow-list. In `Track` mode ids come from an
/// `IouTracker`, so a static scene keeps the same ids across frames.
pub struct StubBackend {
    scene: Vec<Detection>,
    tracker: IouTracker,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            scene: Vec::new(),
            tracker: IouTracker::new(),
        }
    }

    pub fn with_scene(scene: Vec<Detection>) -> Self {
        Self {
            scene,
            tracker: IouTracker::new(),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(
        &mut self,
        image: &RgbImage,
        params: &InferParams,
        mode: InferMode,
    ) -> Result<Vec<Detection>> {
        let (width, height) = image.dimensions();
        let mut detections: Vec<Detection> = self
            .scene
            .iter()
            .filter(|d| d.confidence >= params.confidence_threshold && params.allows(d.class_id))
            .filter(|d| d.bbox.x1 < width as f32 && d.bbox.y1 < height as f32)
            .cloned()
            .map(|mut d| {
                d.track_id = None;
                d
            })
            .collect();

        if mode == InferMode::Track {
            self.tracker.update(&mut detections);
        }
        Ok(detections)
    }
}
