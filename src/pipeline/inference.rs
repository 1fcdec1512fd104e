use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use image::RgbImage;

use crate::dedup::DuplicateSuppressor;
use crate::detect::{
    infer_with_fallback, Detection, DetectorBackend, InferMode, InferOutcome, InferParams,
};
use crate::frame::{FrameSlot, SharedFrame};
use crate::notify::{NotificationJob, NotificationQueue, StreamIdentity};
use crate::overlay::OverlayPainter;

use super::state::{FpsCounter, Liveness, PipelineState};

const RAW_POP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct InferenceSettings {
    pub output_width: u32,
    pub output_height: u32,
    /// Run the detector on every Nth frame; others republish the last result.
    pub process_every_n: u32,
    pub params: InferParams,
    pub identity: StreamIdentity,
}

/// What one iteration of the inference loop did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferenceStep {
    Idle,
    Republished,
    Skipped,
    Processed {
        detections: usize,
        notified: usize,
        mode: InferMode,
    },
    Failed,
    Stopped,
}

/// Marks the stage alive when dropped, whatever happened in between.
struct LivenessGuard<'a>(&'a Liveness);

impl Drop for LivenessGuard<'_> {
    fn drop(&mut self) {
        self.0.touch();
    }
}

/// Raw slot -> detector -> overlays -> AI slot, with notifications on the side.
pub struct InferenceStage {
    backend: Box<dyn DetectorBackend>,
    raw: Arc<FrameSlot>,
    ai: Arc<FrameSlot>,
    state: Arc<PipelineState>,
    painter: OverlayPainter,
    dedup: DuplicateSuppressor,
    queue: NotificationQueue,
    settings: InferenceSettings,
    frame_index: u64,
    last_processed: Option<SharedFrame>,
    fps: FpsCounter,
}

impl InferenceStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Box<dyn DetectorBackend>,
        raw: Arc<FrameSlot>,
        ai: Arc<FrameSlot>,
        state: Arc<PipelineState>,
        painter: OverlayPainter,
        dedup: DuplicateSuppressor,
        queue: NotificationQueue,
        settings: InferenceSettings,
    ) -> Self {
        Self {
            backend,
            raw,
            ai,
            state,
            painter,
            dedup,
            queue,
            settings,
            frame_index: 0,
            last_processed: None,
            fps: FpsCounter::new(),
        }
    }

    pub fn step(&mut self) -> InferenceStep {
        if self.state.should_stop() {
            return InferenceStep::Stopped;
        }
        match self.raw.pop_timeout(RAW_POP_TIMEOUT) {
            Some(frame) => self.handle(frame),
            None => InferenceStep::Idle,
        }
    }

    /// Process one raw frame.
    pub fn handle(&mut self, frame: SharedFrame) -> InferenceStep {
        self.frame_index += 1;
        let every = u64::from(self.settings.process_every_n.max(1));
        if every > 1 && self.frame_index % every != 0 {
            return match &self.last_processed {
                Some(previous) => {
                    self.ai.push(previous.clone());
                    InferenceStep::Republished
                }
                None => InferenceStep::Skipped,
            };
        }

        let state = self.state.clone();
        let _alive = LivenessGuard(state.processing());

        let resized = frame.resized(self.settings.output_width, self.settings.output_height);
        let outcome = infer_with_fallback(
            self.backend.as_mut(),
            resized.image(),
            &self.settings.params,
        );
        self.backend.release_scratch();

        let clean_image = resized.image();
        let mut annotated = clean_image.clone();
        let step = match outcome {
            InferOutcome::Detections { detections, mode } => {
                self.state.set_healthy(true);
                let notified = self.notify_new(&detections, clean_image);
                self.painter.draw_detections(&mut annotated, &detections);
                InferenceStep::Processed {
                    detections: detections.len(),
                    notified,
                    mode,
                }
            }
            InferOutcome::Failed {
                track_error,
                detect_error,
            } => {
                log::error!(
                    "inference failed: track: {:#}; detect: {:#}",
                    track_error,
                    detect_error
                );
                self.state.set_healthy(false);
                self.painter.draw_error(&mut annotated);
                InferenceStep::Failed
            }
        };

        if let Some(fps) = self.fps.tick_at(Instant::now()) {
            self.state.set_fps(fps);
        }
        self.painter
            .draw_banner(&mut annotated, &self.settings.identity.name, self.fps.current());

        let published = Arc::new(resized.derive(annotated));
        self.last_processed = Some(published.clone());
        self.ai.push(published);
        step
    }

    fn notify_new(&mut self, detections: &[Detection], frame: &RgbImage) -> usize {
        let mut notified = 0;
        for detection in detections {
            if detection.track_id.is_none() {
                continue;
            }
            if !self
                .dedup
                .is_new_detection(detection.track_id, &detection.label, &detection.bbox)
            {
                continue;
            }
            log::info!("new detection: {}", detection.caption());
            if let Some(job) =
                NotificationJob::build(detection, frame, &self.settings.identity, Local::now())
            {
                if self.queue.try_enqueue(job) {
                    notified += 1;
                }
            }
        }
        notified
    }

    /// Loop until stop, then hand the backend back for release.
    pub fn run(mut self) -> Box<dyn DetectorBackend> {
        log::info!("inference: loop started ({} backend)", self.backend.name());
        while self.step() != InferenceStep::Stopped {}
        log::info!("inference: loop stopped after {} frames", self.frame_index);
        self.backend
    }
}
