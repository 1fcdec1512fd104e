use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Which detector call to make.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferMode {
    /// Detection plus persistent tracking; detections carry track ids.
    Track,
    /// Plain detection; no tracker state is read or written.
    DetectOnly,
}

/// Thresholds and class filter applied by every call.
#[derive(Clone, Debug, PartialEq)]
pub struct InferParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Allowed class ids. Empty means every class is allowed.
    pub allowed_classes: Vec<u32>,
}

impl InferParams {
    pub fn allows(&self, class_id: u32) -> bool {
        self.allowed_classes.is_empty() || self.allowed_classes.contains(&class_id)
    }
}

impl Default for InferParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            allowed_classes: Vec::new(),
        }
    }
}

/// Detector backend trait.
///
/// Backends are called from the inference thread only. With
/// `InferMode::Track` the backend keeps tracker state across calls so track
/// ids stay stable for the same physical object.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run one detector call on an output-resolution frame.
    fn infer(
        &mut self,
        image: &RgbImage,
        params: &InferParams,
        mode: InferMode,
    ) -> Result<Vec<Detection>>;

    /// Human-readable name for a class id.
    fn class_name(&self, class_id: u32) -> String {
        crate::detect::labels::coco_label(class_id)
    }

    /// Release per-call scratch memory (accelerator buffers and the like).
    fn release_scratch(&mut self) {}

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Tagged result of the track-then-detect strategy.
#[derive(Debug)]
pub enum InferOutcome {
    Detections {
        detections: Vec<Detection>,
        mode: InferMode,
    },
    Failed {
        track_error: anyhow::Error,
        detect_error: anyhow::Error,
    },
}

/// Run the tracking call and fall back to detection-only on failure.
pub fn infer_with_fallback<B: DetectorBackend + ?Sized>(
    backend: &mut B,
    image: &RgbImage,
    params: &InferParams,
) -> InferOutcome {
    let track_error = match backend.infer(image, params, InferMode::Track) {
        Ok(detections) => {
            return InferOutcome::Detections {
                detections,
                mode: InferMode::Track,
            }
        }
        Err(err) => err,
    };
    log::warn!("tracking failed, using detection only: {:#}", track_error);
    match backend.infer(image, params, InferMode::DetectOnly) {
        Ok(detections) => InferOutcome::Detections {
            detections,
            mode: InferMode::DetectOnly,
        },
        Err(detect_error) => InferOutcome::Failed {
            track_error,
            detect_error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BBox;
    use anyhow::anyhow;

    struct Flaky {
        fail_track: bool,
        fail_detect: bool,
        calls: Vec<InferMode>,
    }

    impl DetectorBackend for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn infer(
            &mut self,
            _image: &RgbImage,
            _params: &InferParams,
            mode: InferMode,
        ) -> Result<Vec<Detection>> {
            self.calls.push(mode);
            let fail = match mode {
                InferMode::Track => self.fail_track,
                InferMode::DetectOnly => self.fail_detect,
            };
            if fail {
                return Err(anyhow!("{:?} failed", mode));
            }
            Ok(vec![Detection {
                class_id: 2,
                label: "car".into(),
                confidence: 0.9,
                bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
                track_id: (mode == InferMode::Track).then_some(1),
            }])
        }
    }

    fn image() -> RgbImage {
        RgbImage::new(8, 8)
    }

    #[test]
    fn tracking_success_skips_fallback() {
        let mut backend = Flaky {
            fail_track: false,
            fail_detect: false,
            calls: vec![],
        };
        let outcome = infer_with_fallback(&mut backend, &image(), &InferParams::default());
        assert!(matches!(
            outcome,
            InferOutcome::Detections {
                mode: InferMode::Track,
                ..
            }
        ));
        assert_eq!(backend.calls, vec![InferMode::Track]);
    }

    #[test]
    fn tracking_failure_falls_back_to_detection() {
        let mut backend = Flaky {
            fail_track: true,
            fail_detect: false,
            calls: vec![],
        };
        match infer_with_fallback(&mut backend, &image(), &InferParams::default()) {
            InferOutcome::Detections { detections, mode } => {
                assert_eq!(mode, InferMode::DetectOnly);
                assert_eq!(detections[0].track_id, None);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(backend.calls, vec![InferMode::Track, InferMode::DetectOnly]);
    }

    #[test]
    fn total_failure_is_reported() {
        let mut backend = Flaky {
            fail_track: true,
            fail_detect: true,
            calls: vec![],
        };
        let outcome = infer_with_fallback(&mut backend, &image(), &InferParams::default());
        assert!(matches!(outcome, InferOutcome::Failed { .. }));
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        let mut params = InferParams::default();
        assert!(params.allows(79));
        params.allowed_classes = vec![0, 2];
        assert!(params.allows(2));
        assert!(!params.allows(1));
    }
}
