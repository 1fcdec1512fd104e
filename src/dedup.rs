//! Duplicate suppression for detection notifications.
//!
//! Combines a per-track cooldown with spatial matching across track ids, so a
//! tracker hand-off (same object, new id after occlusion) does not produce a
//! second notification.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::detect::BBox;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_SPATIAL_THRESHOLD_PX: f32 = 150.0;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RECORD_RETENTION: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
struct TrackedObjectRecord {
    last_notified: Instant,
    center: (f32, f32),
    label: String,
}

/// Why a sighting was accepted or rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    NewTrack,
    CooldownExpired,
    Untracked,
    InCooldown,
    SpatialDuplicate { near_track: u64 },
}

impl Verdict {
    pub fn notify(self) -> bool {
        matches!(self, Verdict::NewTrack | Verdict::CooldownExpired)
    }
}

pub struct DuplicateSuppressor {
    cooldown: Duration,
    spatial_threshold_px: f32,
    records: HashMap<u64, TrackedObjectRecord>,
    last_sweep: Instant,
}

impl DuplicateSuppressor {
    pub fn new(cooldown: Duration, spatial_threshold_px: f32) -> Self {
        Self::starting_at(cooldown, spatial_threshold_px, Instant::now())
    }

    /// Construct with an explicit sweep epoch, for clock-driven tests.
    pub fn starting_at(cooldown: Duration, spatial_threshold_px: f32, epoch: Instant) -> Self {
        Self {
            cooldown,
            spatial_threshold_px,
            records: HashMap::new(),
            last_sweep: epoch,
        }
    }

    pub fn is_new_detection(&mut self, track_id: Option<u64>, label: &str, bbox: &BBox) -> bool {
        self.is_new_detection_at(Instant::now(), track_id, label, bbox)
    }

    pub fn is_new_detection_at(
        &mut self,
        now: Instant,
        track_id: Option<u64>,
        label: &str,
        bbox: &BBox,
    ) -> bool {
        self.evaluate(now, track_id, label, bbox).notify()
    }

    /// Full decision, including the reason.
    pub fn evaluate(
        &mut self,
        now: Instant,
        track_id: Option<u64>,
        label: &str,
        bbox: &BBox,
    ) -> Verdict {
        let Some(track_id) = track_id else {
            return Verdict::Untracked;
        };

        self.sweep(now);
        let center = bbox.center();

        if let Some(record) = self.records.get_mut(&track_id) {
            let since = now.saturating_duration_since(record.last_notified);
            if since < self.cooldown {
                return Verdict::InCooldown;
            }
            log::info!(
                "re-notifying for {}#{} (cooldown expired after {:.1}s)",
                label,
                track_id,
                since.as_secs_f32()
            );
            record.last_notified = record.last_notified.max(now);
            record.center = center;
            record.label = label.to_string();
            return Verdict::CooldownExpired;
        }

        let verdict = match self.nearby_recent(now, label, center) {
            Some((near_track, distance, since)) => {
                log::debug!(
                    "suppressing {}#{}: {:.1}px from #{} notified {:.1}s ago",
                    label,
                    track_id,
                    distance,
                    near_track,
                    since.as_secs_f32()
                );
                Verdict::SpatialDuplicate { near_track }
            }
            None => Verdict::NewTrack,
        };
        self.records.insert(
            track_id,
            TrackedObjectRecord {
                last_notified: now,
                center,
                label: label.to_string(),
            },
        );
        verdict
    }

    /// First record of the same class within the spatial threshold whose last
    /// notification is still inside the cooldown. Iteration follows map order,
    /// so when several records qualify the one reported is unspecified.
    fn nearby_recent(
        &self,
        now: Instant,
        label: &str,
        center: (f32, f32),
    ) -> Option<(u64, f32, Duration)> {
        self.records.iter().find_map(|(id, record)| {
            if record.label != label {
                return None;
            }
            let distance = distance(center, record.center);
            if distance >= self.spatial_threshold_px {
                return None;
            }
            let since = now.saturating_duration_since(record.last_notified);
            (since < self.cooldown).then_some((*id, distance, since))
        })
    }

    /// Evict records idle past the retention window, at most once per sweep interval.
    fn sweep(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) <= SWEEP_INTERVAL {
            return;
        }
        let before = self.records.len();
        self.records
            .retain(|_, record| now.saturating_duration_since(record.last_notified) <= RECORD_RETENTION);
        let evicted = before - self.records.len();
        if evicted > 0 {
            log::info!("evicted {} idle track records", evicted);
        }
        self.last_sweep = now;
    }

    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for DuplicateSuppressor {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN, DEFAULT_SPATIAL_THRESHOLD_PX)
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn box_at(cx: f32, cy: f32) -> BBox {
        BBox::new(cx - 20.0, cy - 40.0, cx + 20.0, cy + 40.0)
    }

    fn engine(t0: Instant) -> DuplicateSuppressor {
        DuplicateSuppressor::starting_at(DEFAULT_COOLDOWN, DEFAULT_SPATIAL_THRESHOLD_PX, t0)
    }

    #[test]
    fn untracked_never_notifies() {
        let t0 = Instant::now();
        let mut dedup = engine(t0);
        assert!(!dedup.is_new_detection_at(t0, None, "person", &box_at(100.0, 100.0)));
        assert_eq!(dedup.tracked_count(), 0);
    }

    #[test]
    fn cooldown_gates_repeat_notifications() {
        let t0 = Instant::now();
        let mut dedup = engine(t0);
        let b = box_at(100.0, 100.0);
        assert!(dedup.is_new_detection_at(t0, Some(7), "person", &b));
        assert!(!dedup.is_new_detection_at(t0 + secs(10), Some(7), "person", &b));
        assert!(!dedup.is_new_detection_at(t0 + secs(29), Some(7), "person", &b));
        assert!(dedup.is_new_detection_at(t0 + secs(31), Some(7), "person", &b));
        // The cooldown restarts from the re-notification.
        assert!(!dedup.is_new_detection_at(t0 + secs(45), Some(7), "person", &b));
    }

    #[test]
    fn hand_off_to_new_id_nearby_is_suppressed() {
        let t0 = Instant::now();
        let mut dedup = engine(t0);
        assert!(dedup.is_new_detection_at(t0, Some(1), "person", &box_at(100.0, 100.0)));
        assert_eq!(
            dedup.evaluate(t0 + secs(5), Some(2), "person", &box_at(200.0, 100.0)),
            Verdict::SpatialDuplicate { near_track: 1 }
        );
        // The duplicate id is now tracked and suppressed on later sightings too.
        assert!(!dedup.is_new_detection_at(t0 + secs(6), Some(2), "person", &box_at(400.0, 400.0)));
    }

    #[test]
    fn distant_or_other_class_is_new() {
        let t0 = Instant::now();
        let mut dedup = engine(t0);
        assert!(dedup.is_new_detection_at(t0, Some(1), "person", &box_at(100.0, 100.0)));
        assert!(dedup.is_new_detection_at(t0 + secs(1), Some(2), "person", &box_at(300.0, 100.0)));
        assert!(dedup.is_new_detection_at(t0 + secs(1), Some(3), "car", &box_at(100.0, 100.0)));
    }

    #[test]
    fn nearby_record_outside_cooldown_does_not_suppress() {
        let t0 = Instant::now();
        let mut dedup = engine(t0);
        assert!(dedup.is_new_detection_at(t0, Some(1), "person", &box_at(100.0, 100.0)));
        assert!(dedup.is_new_detection_at(t0 + secs(40), Some(2), "person", &box_at(110.0, 100.0)));
    }

    #[test]
    fn sweep_evicts_idle_records_once_per_interval() {
        let t0 = Instant::now();
        let mut dedup = engine(t0);
        assert!(dedup.is_new_detection_at(t0, Some(1), "person", &box_at(100.0, 100.0)));
        assert!(dedup.is_new_detection_at(t0 + secs(250), Some(2), "car", &box_at(500.0, 100.0)));
        assert_eq!(dedup.tracked_count(), 2);

        // Next sweep is due after t0+310; #1 is past retention by then.
        let t1 = t0 + secs(311);
        dedup.is_new_detection_at(t1, Some(3), "dog", &box_at(10.0, 10.0));
        assert_eq!(dedup.tracked_count(), 2);

        // A second call inside the sweep interval changes nothing.
        dedup.is_new_detection_at(t1 + secs(1), Some(3), "dog", &box_at(10.0, 10.0));
        assert_eq!(dedup.tracked_count(), 2);

        // An evicted id is treated as a first sighting again.
        assert!(dedup.is_new_detection_at(t1 + secs(2), Some(1), "person", &box_at(100.0, 100.0)));
    }
}
