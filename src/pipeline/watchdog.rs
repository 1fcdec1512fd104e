use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::FrameSlot;

use super::state::PipelineState;

/// Conditions that make the watchdog request a reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    ProcessingStale(Duration),
    CaptureStale(Duration),
    PipelineStalled,
}

pub struct Watchdog {
    state: Arc<PipelineState>,
    raw: Arc<FrameSlot>,
    ai: Arc<FrameSlot>,
    interval: Duration,
    timeout: Duration,
    stall_grace: Duration,
}

impl Watchdog {
    pub fn new(
        state: Arc<PipelineState>,
        raw: Arc<FrameSlot>,
        ai: Arc<FrameSlot>,
        interval: Duration,
        timeout: Duration,
        stall_grace: Duration,
    ) -> Self {
        Self {
            state,
            raw,
            ai,
            interval,
            timeout,
            stall_grace,
        }
    }

    /// Evaluate liveness at `now`, flag a restart if anything is stale, and
    /// report which conditions fired.
    pub fn check(&self, now: Instant) -> Vec<Trigger> {
        let mut fired = Vec::new();

        let processing_age = self.state.processing().age_at(now);
        if processing_age > self.timeout {
            log::warn!(
                "watchdog: no processed frames for {}s",
                processing_age.as_secs()
            );
            fired.push(Trigger::ProcessingStale(processing_age));
            self.state.set_healthy(false);
        }

        let capture_age = self.state.capture().age_at(now);
        if capture_age > self.timeout {
            log::warn!("watchdog: no captured frames for {}s", capture_age.as_secs());
            fired.push(Trigger::CaptureStale(capture_age));
            self.state.set_healthy(false);
        }

        if self.raw.is_empty()
            && self.ai.is_empty()
            && self.state.is_streaming()
            && capture_age > self.stall_grace
        {
            log::warn!("watchdog: slots empty while streaming, possible pipeline stall");
            fired.push(Trigger::PipelineStalled);
        }

        if !fired.is_empty() {
            self.state.request_restart();
        }
        fired
    }

    pub fn run(self) {
        log::info!(
            "watchdog: started (interval {:?}, timeout {:?})",
            self.interval,
            self.timeout
        );
        while self.state.sleep_unless_stopped(self.interval) {
            self.check(Instant::now());
        }
        log::info!("watchdog: stopped");
    }
}
