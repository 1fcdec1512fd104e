use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Flags, counters, and liveness stamps shared between the worker threads
/// and the event loop. Everything is lock-free.
pub struct PipelineState {
    stop: AtomicBool,
    restart: AtomicBool,
    healthy: AtomicBool,
    streaming: AtomicBool,
    reconnects: AtomicU64,
    fps_bits: AtomicU32,
    capture: Liveness,
    processing: Liveness,
}

impl PipelineState {
    pub fn new() -> Self {
        let base = Instant::now();
        Self {
            stop: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            streaming: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            fps_bits: AtomicU32::new(0f32.to_bits()),
            capture: Liveness::new(base),
            processing: Liveness::new(base),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    /// Consume a pending restart request.
    pub fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }

    pub fn restart_pending(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn record_reconnect(&self) -> u64 {
        self.reconnects.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    pub fn capture(&self) -> &Liveness {
        &self.capture
    }

    pub fn processing(&self) -> &Liveness {
        &self.processing
    }

    /// Sleep for `duration` in short slices. Returns `false` if stop was
    /// requested before the full duration elapsed.
    pub fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_stop() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-activity timestamp stored as milliseconds since a base instant.
/// Starts at the base instant, so a stage that never reports ages from startup.
pub struct Liveness {
    base: Instant,
    offset_ms: AtomicU64,
}

impl Liveness {
    fn new(base: Instant) -> Self {
        Self {
            base,
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at `now`. Stamps never move backwards.
    pub fn touch_at(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.base).as_millis() as u64;
        self.offset_ms.fetch_max(offset, Ordering::SeqCst);
    }

    pub fn last(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last())
    }

    pub fn age(&self) -> Duration {
        self.age_at(Instant::now())
    }
}

/// Frames-per-second over rolling one-second windows.
pub struct FpsCounter {
    window_start: Instant,
    frames: u32,
    current: f32,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
            current: 0.0,
        }
    }

    /// Count one frame. Returns the new rate when a window closes.
    pub fn tick_at(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        self.current = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(self.current)
    }

    pub fn current(&self) -> f32 {
        self.current
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}
