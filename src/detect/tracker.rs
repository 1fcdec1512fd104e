//! Greedy IoU tracker.
//!
//! Assigns stable track ids to detections across consecutive frames by
//! matching each new box to the live track of the same class with the highest
//! overlap. Tracks that go unmatched for `max_missed` frames are dropped, so
//! an object re-appearing after a long occlusion gets a fresh id.

use crate::detect::result::{BBox, Detection};

const DEFAULT_MATCH_IOU: f32 = 0.3;
const DEFAULT_MAX_MISSED: u32 = 30;

#[derive(Clone, Debug)]
struct Track {
    id: u64,
    class_id: u32,
    bbox: BBox,
    missed: u32,
}

#[derive(Debug)]
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u64,
    match_iou: f32,
    max_missed: u32,
}

impl IouTracker {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            match_iou: DEFAULT_MATCH_IOU,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }

    pub fn with_limits(mut self, match_iou: f32, max_missed: u32) -> Self {
        self.match_iou = match_iou;
        self.max_missed = max_missed;
        self
    }

    /// Assign track ids in place.
    pub fn update(&mut self, detections: &mut [Detection]) {
        let mut matched = vec![false; self.tracks.len()];

        // Highest-confidence detections claim tracks first.
        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .total_cmp(&detections[a].confidence)
        });

        for idx in order {
            let det = &mut detections[idx];
            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(i, t)| !matched[*i] && t.class_id == det.class_id)
                .map(|(i, t)| (i, t.bbox.iou(&det.bbox)))
                .filter(|(_, iou)| *iou >= self.match_iou)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match best {
                Some((i, _)) => {
                    matched[i] = true;
                    let track = &mut self.tracks[i];
                    track.bbox = det.bbox;
                    track.missed = 0;
                    det.track_id = Some(track.id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        class_id: det.class_id,
                        bbox: det.bbox,
                        missed: 0,
                    });
                    matched.push(true);
                    det.track_id = Some(id);
                }
            }
        }

        for (track, was_matched) in self.tracks.iter_mut().zip(&matched) {
            if !was_matched {
                track.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.tracks.retain(|t| t.missed <= max_missed);
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, x: f32) -> Detection {
        Detection {
            class_id,
            label: crate::detect::labels::coco_label(class_id),
            confidence: 0.9,
            bbox: BBox::new(x, 100.0, x + 50.0, 200.0),
            track_id: None,
        }
    }

    #[test]
    fn same_object_keeps_its_id() {
        let mut tracker = IouTracker::new();
        let mut first = vec![det(0, 100.0)];
        tracker.update(&mut first);
        let mut second = vec![det(0, 105.0)];
        tracker.update(&mut second);
        assert_eq!(first[0].track_id, second[0].track_id);
    }

    #[test]
    fn different_classes_do_not_share_tracks() {
        let mut tracker = IouTracker::new();
        let mut first = vec![det(0, 100.0)];
        tracker.update(&mut first);
        let mut second = vec![det(2, 100.0)];
        tracker.update(&mut second);
        assert_ne!(first[0].track_id, second[0].track_id);
    }

    #[test]
    fn lost_tracks_expire() {
        let mut tracker = IouTracker::new().with_limits(0.3, 2);
        let mut first = vec![det(0, 100.0)];
        tracker.update(&mut first);
        for _ in 0..3 {
            tracker.update(&mut []);
        }
        assert_eq!(tracker.live_tracks(), 0);
        let mut again = vec![det(0, 100.0)];
        tracker.update(&mut again);
        assert_ne!(first[0].track_id, again[0].track_id);
    }
}
