use std::sync::Arc;
use std::time::Duration;

use crate::frame::{Frame, FrameSlot};

use super::connector::StreamConnector;
use super::state::PipelineState;

pub const DEFAULT_READ_FAILURE_PAUSE: Duration = Duration::from_secs(1);

/// What one iteration of the capture loop did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStep {
    Connected,
    ConnectFailed { attempts: u64 },
    Frame { seq: u64 },
    ReadFailed,
    Restarted,
    Stopped,
}

/// DISCONNECTED <-> STREAMING state machine feeding the raw and clean slots.
pub struct CaptureLoop {
    connector: Arc<StreamConnector>,
    raw: Arc<FrameSlot>,
    clean: Arc<FrameSlot>,
    state: Arc<PipelineState>,
    reconnect_delay: Duration,
    read_failure_pause: Duration,
    streaming: bool,
    seq: u64,
}

impl CaptureLoop {
    pub fn new(
        connector: Arc<StreamConnector>,
        raw: Arc<FrameSlot>,
        clean: Arc<FrameSlot>,
        state: Arc<PipelineState>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            connector,
            raw,
            clean,
            state,
            reconnect_delay,
            read_failure_pause: DEFAULT_READ_FAILURE_PAUSE,
            streaming: false,
            seq: 0,
        }
    }

    pub fn with_read_failure_pause(mut self, pause: Duration) -> Self {
        self.read_failure_pause = pause;
        self
    }

    pub fn step(&mut self) -> CaptureStep {
        if self.state.should_stop() {
            return CaptureStep::Stopped;
        }

        if self.state.take_restart() {
            log::warn!("capture: restart requested, releasing stream");
            self.disconnect();
            return CaptureStep::Restarted;
        }

        if !self.streaming {
            if self.connector.connect() {
                self.streaming = true;
                self.state.set_streaming(true);
                self.state.capture().touch();
                return CaptureStep::Connected;
            }
            let attempts = self.state.record_reconnect();
            log::warn!(
                "capture: connect failed (attempt {}), retrying in {:?}",
                attempts,
                self.reconnect_delay
            );
            self.state.sleep_unless_stopped(self.reconnect_delay);
            return CaptureStep::ConnectFailed { attempts };
        }

        match self.connector.read() {
            Ok(image) => {
                self.seq += 1;
                let frame = Arc::new(Frame::new(image, self.seq));
                self.state.capture().touch_at(frame.captured_at);
                self.raw.push(frame.clone());
                self.clean.push(frame);
                CaptureStep::Frame { seq: self.seq }
            }
            Err(err) => {
                log::warn!("capture: read failed: {:#}", err);
                self.disconnect();
                self.state.sleep_unless_stopped(self.read_failure_pause);
                CaptureStep::ReadFailed
            }
        }
    }

    pub fn run(mut self) {
        log::info!("capture: loop started");
        while self.step() != CaptureStep::Stopped {}
        self.state.set_streaming(false);
        log::info!("capture: loop stopped after {} frames", self.seq);
    }

    fn disconnect(&mut self) {
        self.connector.release();
        self.streaming = false;
        self.state.set_streaming(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{SourceTimeouts, VideoSource};
    use anyhow::{anyhow, Result};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Refuses the first `refusals` opens, then streams frames.
    struct FlakySource {
        attempt: usize,
        refusals: usize,
        open: bool,
    }

    impl VideoSource for FlakySource {
        fn open(&mut self, _timeouts: &SourceTimeouts) -> Result<()> {
            if self.attempt < self.refusals {
                return Err(anyhow!("connection refused"));
            }
            self.open = true;
            Ok(())
        }

        fn read(&mut self) -> Result<RgbImage> {
            if self.open {
                Ok(RgbImage::new(8, 8))
            } else {
                Err(anyhow!("closed"))
            }
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn describe(&self) -> String {
            "flaky://".into()
        }
    }

    fn capture_loop(refusals: usize) -> (CaptureLoop, Arc<PipelineState>, Arc<FrameSlot>) {
        capture_loop_with_delay(refusals, Duration::from_millis(1))
    }

    fn capture_loop_with_delay(
        refusals: usize,
        reconnect_delay: Duration,
    ) -> (CaptureLoop, Arc<PipelineState>, Arc<FrameSlot>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(StreamConnector::new(
            Box::new(move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FlakySource {
                    attempt,
                    refusals,
                    open: false,
                }) as Box<dyn VideoSource>)
            }),
            SourceTimeouts::default(),
        ));
        let state = Arc::new(PipelineState::new());
        let raw = Arc::new(FrameSlot::new("raw"));
        let clean = Arc::new(FrameSlot::new("clean"));
        let capture = CaptureLoop::new(
            connector,
            raw.clone(),
            clean,
            state.clone(),
            reconnect_delay,
        );
        (capture, state, raw)
    }

    #[test]
    fn reconnect_count_matches_failures_then_streams() {
        let (mut capture, state, raw) = capture_loop(3);
        for attempt in 1..=3 {
            assert_eq!(capture.step(), CaptureStep::ConnectFailed { attempts: attempt });
        }
        assert_eq!(capture.step(), CaptureStep::Connected);
        assert!(state.is_streaming());
        assert_eq!(capture.step(), CaptureStep::Frame { seq: 1 });
        assert_eq!(capture.step(), CaptureStep::Frame { seq: 2 });
        assert_eq!(state.reconnect_count(), 3);
        assert_eq!(raw.try_pop().map(|f| f.seq), Some(2));
    }

    #[test]
    fn failed_connects_are_spaced_by_reconnect_delay() {
        let delay = Duration::from_millis(30);
        let (mut capture, state, _raw) = capture_loop_with_delay(3, delay);
        let started = Instant::now();
        for attempt in 1..=3 {
            assert_eq!(capture.step(), CaptureStep::ConnectFailed { attempts: attempt });
        }
        assert!(started.elapsed() >= delay * 3);
        assert_eq!(capture.step(), CaptureStep::Connected);
        assert_eq!(state.reconnect_count(), 3);
    }

    #[test]
    fn restart_flag_forces_disconnect() {
        let (mut capture, state, _raw) = capture_loop(0);
        assert_eq!(capture.step(), CaptureStep::Connected);
        state.request_restart();
        assert_eq!(capture.step(), CaptureStep::Restarted);
        assert!(!state.is_streaming());
        assert_eq!(capture.step(), CaptureStep::Connected);
        assert_eq!(state.reconnect_count(), 0);
    }

    #[test]
    fn stop_ends_run() {
        let (capture, state, _raw) = capture_loop(usize::MAX);
        state.request_stop();
        capture.run();
        assert!(!state.is_streaming());
    }
}
