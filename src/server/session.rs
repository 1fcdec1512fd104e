use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::frame::{Frame, FrameSlot, SharedFrame};

/// Which publish slot a session reads from. Fixed for the session's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Ai,
    Clean,
}

impl FeedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Ai => "ai",
            FeedKind::Clean => "clean",
        }
    }
}

/// Per-session frame source for the transport clock.
pub struct Publisher {
    feed: FeedKind,
    slot: Arc<FrameSlot>,
    width: u32,
    height: u32,
    cached: Option<SharedFrame>,
}

impl Publisher {
    pub fn new(feed: FeedKind, slot: Arc<FrameSlot>, width: u32, height: u32) -> Self {
        Self {
            feed,
            slot,
            width,
            height,
            cached: None,
        }
    }

    pub fn feed(&self) -> FeedKind {
        self.feed
    }

    /// Freshest pending frame, else the last one sent, else a blank frame.
    /// Never blocks.
    pub fn tick(&mut self) -> SharedFrame {
        let mut fresh = None;
        while let Some(frame) = self.slot.try_pop() {
            fresh = Some(frame);
        }

        let frame = match fresh {
            Some(frame) => match self.feed {
                FeedKind::Clean if (frame.width(), frame.height()) != (self.width, self.height) => {
                    Arc::new(frame.resized(self.width, self.height))
                }
                _ => frame,
            },
            None => match &self.cached {
                Some(cached) => cached.clone(),
                None => Arc::new(Frame::blank(self.width, self.height)),
            },
        };
        self.cached = Some(frame.clone());
        frame
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    image
        .write_with_encoder(encoder)
        .context("encode frame as JPEG")?;
    Ok(jpeg.into_inner())
}

/// Sessions bound to one feed, keyed by session id.
pub struct SessionSet<H> {
    feed: FeedKind,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, H>>,
}

impl<H: Clone> SessionSet<H> {
    pub fn new(feed: FeedKind) -> Self {
        Self {
            feed,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn feed(&self) -> FeedKind {
        self.feed
    }

    pub fn insert(&self, handle: H) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, handle);
        id
    }

    pub fn remove(&self, id: u64) -> Option<H> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<H> {
        self.lock().drain().map(|(_, handle)| handle).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, H>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Publishing cadence shared by every session.
#[derive(Clone, Copy, Debug)]
pub struct PacingSettings {
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl PacingSettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineState;
    use image::Rgb;

    fn frame(seq: u64, w: u32, h: u32) -> SharedFrame {
        Arc::new(Frame::new(RgbImage::from_pixel(w, h, Rgb([10, 20, 30])), seq))
    }

    #[test]
    fn tick_prefers_fresh_then_cache_then_blank() {
        let slot = Arc::new(FrameSlot::new("ai"));
        let mut publisher = Publisher::new(FeedKind::Ai, slot.clone(), 64, 48);

        let blank = publisher.tick();
        assert!(blank.is_placeholder());
        assert_eq!((blank.width(), blank.height()), (64, 48));

        slot.push(frame(4, 64, 48));
        slot.push(frame(5, 64, 48));
        assert_eq!(publisher.tick().seq, 5);
        assert_eq!(publisher.tick().seq, 5);
        assert!(slot.is_empty());
    }

    #[test]
    fn clean_feed_is_resized_to_output() {
        let slot = Arc::new(FrameSlot::new("clean"));
        let mut publisher = Publisher::new(FeedKind::Clean, slot.clone(), 32, 24);
        slot.push(frame(1, 320, 240));
        let out = publisher.tick();
        assert_eq!((out.width(), out.height(), out.seq), (32, 24, 1));
    }

    #[test]
    fn sessions_stay_in_their_feed() {
        let ai: SessionSet<&'static str> = SessionSet::new(FeedKind::Ai);
        let clean: SessionSet<&'static str> = SessionSet::new(FeedKind::Clean);
        let a = ai.insert("viewer-a");
        let b = clean.insert("viewer-b");
        assert_eq!((ai.len(), clean.len()), (1, 1));

        assert_eq!(ai.remove(a), Some("viewer-a"));
        assert!(ai.is_empty());
        assert!(clean.contains(b));
        assert_eq!(clean.drain(), vec!["viewer-b"]);
        assert!(clean.is_empty());
    }

    #[test]
    fn closing_one_session_leaves_its_sibling_untouched() {
        let slot = Arc::new(FrameSlot::new("ai"));
        let state = PipelineState::new();
        let capture_seen = state.capture().last();
        let processing_seen = state.processing().last();

        let mut first = Publisher::new(FeedKind::Ai, slot.clone(), 64, 48);
        let mut second = Publisher::new(FeedKind::Ai, slot.clone(), 64, 48);
        slot.push(frame(1, 64, 48));
        assert_eq!(first.tick().seq, 1);
        slot.push(frame(2, 64, 48));
        assert_eq!(second.tick().seq, 2);

        let sessions: SessionSet<&'static str> = SessionSet::new(FeedKind::Ai);
        let first_id = sessions.insert("first");
        let second_id = sessions.insert("second");
        assert_eq!(sessions.remove(first_id), Some("first"));
        drop(first);

        assert!(sessions.contains(second_id));
        assert!(slot.is_empty());
        let survivor = second.tick();
        assert_eq!(survivor.seq, 2);
        assert!(!survivor.is_placeholder());
        assert!(slot.is_empty());
        assert!(state.is_healthy());
        assert_eq!(state.capture().last(), capture_seen);
        assert_eq!(state.processing().last(), processing_seen);

        slot.push(frame(3, 64, 48));
        assert_eq!(second.tick().seq, 3);
    }

    #[test]
    fn pacing_period_matches_fps() {
        let pacing = PacingSettings {
            fps: 30,
            jpeg_quality: 80,
        };
        assert_eq!(pacing.period(), Duration::from_nanos(33_333_333));
    }

    #[test]
    fn jpeg_encoding_round_trips_dimensions() -> Result<()> {
        let bytes = encode_jpeg(&RgbImage::new(16, 8), 80)?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
        Ok(())
    }
}
