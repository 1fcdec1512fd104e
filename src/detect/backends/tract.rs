#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorBackend, InferMode, InferParams};
use crate::detect::labels::coco_label;
use crate::detect::result::{BBox, Detection};
use crate::detect::tracker::IouTracker;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// The model takes a `1x3xHxW` RGB tensor in `[0, 1]` and returns
/// `1x(4+C)xN` rows of `cx, cy, w, h, class scores...` in input pixels.
/// Frames are stretched to the model input and boxes scaled back.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    tracker: IouTracker,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "tract backend loaded {} ({}x{} input)",
            model_path.display(),
            width,
            height
        );

        Ok(Self {
            model,
            width,
            height,
            tracker: IouTracker::new(),
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        params: &InferParams,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let rows = shape[1];
        let anchors = shape[2];
        let scale_x = frame_width as f32 / self.width as f32;
        let scale_y = frame_height as f32 / self.height as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let (class_id, score) = (4..rows)
                .map(|r| (r - 4, view[[0, r, a]]))
                .max_by(|x, y| x.1.total_cmp(&y.1))
                .unwrap_or((0, 0.0));
            let class_id = class_id as u32;
            if score < params.confidence_threshold || !params.allows(class_id) {
                continue;
            }
            let (cx, cy, w, h) = (
                view[[0, 0, a]],
                view[[0, 1, a]],
                view[[0, 2, a]],
                view[[0, 3, a]],
            );
            candidates.push(Detection {
                class_id,
                label: coco_label(class_id),
                confidence: score,
                bbox: BBox::new(
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ),
                track_id: None,
            });
        }

        Ok(non_max_suppression(candidates, params.iou_threshold))
    }
}

/// Per-class greedy NMS.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(
        &mut self,
        image: &RgbImage,
        params: &InferParams,
        mode: InferMode,
    ) -> Result<Vec<Detection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let mut detections = self.decode(outputs, params, image.width(), image.height())?;
        if mode == InferMode::Track {
            self.tracker.update(&mut detections);
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, confidence: f32, x: f32) -> Detection {
        Detection {
            class_id,
            label: coco_label(class_id),
            confidence,
            bbox: BBox::new(x, 0.0, x + 100.0, 100.0),
            track_id: None,
        }
    }

    #[test]
    fn nms_keeps_best_box_per_overlap_group() {
        let kept = non_max_suppression(
            vec![det(0, 0.6, 5.0), det(0, 0.9, 0.0), det(2, 0.7, 0.0)],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 2);
    }
}
