use serde::Serialize;

/// Axis-aligned box in output-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Integer pixel coordinates clamped to a `width`x`height` frame.
    pub fn clamped(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clamp = |v: f32, max: u32| (v.round().max(0.0) as u32).min(max);
        (
            clamp(self.x1, width),
            clamp(self.y1, height),
            clamp(self.x2, width),
            clamp(self.y2, height),
        )
    }
}

/// One detected object.
///
/// `track_id` is only present when the detector ran with tracking enabled and
/// the tracker associated the box with a track.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub track_id: Option<u64>,
}

impl Detection {
    /// Overlay label, e.g. `person#12 87.5%`.
    pub fn caption(&self) -> String {
        match self.track_id {
            Some(id) => format!("{}#{} {:.1}%", self.label, id, self.confidence * 100.0),
            None => format!("{} {:.1}%", self.label, self.confidence * 100.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox::new(10.0, 10.0, 20.0, 20.0);
        assert!((b.iou(&b) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn clamped_stays_inside_frame() {
        let b = BBox::new(-5.0, 3.4, 700.0, 500.0);
        assert_eq!(b.clamped(640, 480), (0, 3, 640, 480));
    }

    #[test]
    fn caption_includes_track_id_when_present() {
        let mut d = Detection {
            class_id: 0,
            label: "person".into(),
            confidence: 0.875,
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            track_id: Some(12),
        };
        assert_eq!(d.caption(), "person#12 87.5%");
        d.track_id = None;
        assert_eq!(d.caption(), "person 87.5%");
    }
}
