//! Upstream video sources.
//!
//! - `stub://<name>`: synthetic moving test pattern (always available)
//! - `rtsp://`, `rtmp://`, `http(s)://`: GStreamer decode (feature: rtsp-gstreamer)
//!
//! Sources are opaque handles behind `VideoSource`. Only the stream connector
//! owns one; nothing else sees the handle.

pub mod rtsp;

use anyhow::Result;
use image::RgbImage;
use std::time::Duration;

pub use rtsp::{RtspConfig, RtspSource};

/// Timeouts applied when opening and reading a source.
#[derive(Clone, Copy, Debug)]
pub struct SourceTimeouts {
    pub open: Duration,
    pub read: Duration,
}

impl Default for SourceTimeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(10),
            read: Duration::from_secs(5),
        }
    }
}

/// A live frame source.
pub trait VideoSource: Send {
    /// Open the stream. A failed open leaves the source closed.
    fn open(&mut self, timeouts: &SourceTimeouts) -> Result<()>;

    /// Block for the next decoded frame, up to the read timeout.
    fn read(&mut self) -> Result<RgbImage>;

    /// Release the underlying stream. Safe to call repeatedly.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Stream address with credentials stripped, for logs.
    fn describe(&self) -> String;
}

/// Creates a fresh source for each connection attempt.
pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn VideoSource>> + Send + Sync>;

/// Factory for the configured stream URL.
pub fn url_factory(url: String, width: u32, height: u32) -> SourceFactory {
    Box::new(move || {
        let source = RtspSource::new(RtspConfig {
            url: url.clone(),
            width,
            height,
            ..RtspConfig::default()
        })?;
        Ok(Box::new(source) as Box<dyn VideoSource>)
    })
}

/// Strip userinfo from a stream URL before it reaches a log line.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            // Both setters only fail for cannot-be-a-base URLs, which carry no userinfo.
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}
