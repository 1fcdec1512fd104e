//! Network stream source.
//!
//! `RtspSource` decodes camera streams through GStreamer, with a synthetic
//! fallback for `stub://` URLs used by tests and demos.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use super::{redact_url, SourceTimeouts, VideoSource};

/// Configuration for a stream source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Stream URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Frame width for synthetic frames.
    pub width: u32,
    /// Frame height for synthetic frames.
    pub height: u32,
    /// Frame rate the synthetic source paces itself to. 0 means unpaced.
    pub synthetic_fps: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            width: 640,
            height: 480,
            synthetic_fps: 25,
        }
    }
}

/// Stream source.
///
/// Uses GStreamer for real decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticSource::new(config)),
            })
        } else {
            let uri = source_uri(&config.url)?;
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerSource::new(config, uri)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                drop(uri);
                anyhow::bail!(
                    "{} requires the rtsp-gstreamer feature",
                    redact_url(&config.url)
                )
            }
        }
    }
}

impl VideoSource for RtspSource {
    fn open(&mut self, timeouts: &SourceTimeouts) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.open(timeouts),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open(timeouts),
        }
    }

    fn read(&mut self) -> Result<RgbImage> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.read(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.open,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open,
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.config.url.clone(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => redact_url(&source.config.url),
        }
    }
}

/// Parse a stream URL into the form handed to the decoder. Characters outside
/// the URL grammar come back percent-encoded, so the result is a single token.
fn source_uri(raw: &str) -> Result<String> {
    // The raw text may hold credentials, so it stays out of the error.
    let parsed = url::Url::parse(raw).map_err(|err| anyhow!("invalid stream url: {}", err))?;
    if parsed.cannot_be_a_base() {
        return Err(anyhow!("stream url {} has no host", redact_url(raw)));
    }
    Ok(parsed.into())
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticSource {
    config: RtspConfig,
    open: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            open: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn open(&mut self, _timeouts: &SourceTimeouts) -> Result<()> {
        self.open = true;
        log::info!("connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn read(&mut self) -> Result<RgbImage> {
        if !self.open {
            return Err(anyhow!("synthetic source {} is closed", self.config.url));
        }
        self.pace();
        self.frame_count += 1;
        Ok(self.render())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn pace(&mut self) {
        if self.config.synthetic_fps > 0 {
            let interval = Duration::from_secs(1) / self.config.synthetic_fps;
            if let Some(last) = self.last_frame_at {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    /// Diagonal gradient with a bright bar sweeping left to right.
    fn render(&self) -> RgbImage {
        let (width, height) = (self.config.width.max(1), self.config.height.max(1));
        let bar_x = (self.frame_count * 4 % width as u64) as u32;
        let shift = (self.frame_count % 256) as u32;
        RgbImage::from_fn(width, height, |x, y| {
            if x.abs_diff(bar_x) < 8 {
                Rgb([240, 240, 240])
            } else {
                Rgb([
                    ((x + shift) % 256) as u8,
                    ((y + shift) % 256) as u8,
                    ((x + y) / 2 % 256) as u8,
                ])
            }
        })
    }
}

// ----------------------------------------------------------------------------
// GStreamer source
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
    open: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    fn new(config: RtspConfig, uri: String) -> Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        let decode = gstreamer::ElementFactory::make("uridecodebin")
            .property("uri", uri.as_str())
            .build()
            .context("create uridecodebin")?;
        let convert = gstreamer::ElementFactory::make("videoconvert")
            .build()
            .context("create videoconvert")?;
        let filter = gstreamer::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .context("create capsfilter")?;
        let appsink = gstreamer_app::AppSink::builder().caps(&caps).build();
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let sink = appsink.upcast_ref::<gstreamer::Element>();
        let pipeline = gstreamer::Pipeline::with_name("relay-source");
        pipeline
            .add_many([&decode, &convert, &filter, sink])
            .context("assemble stream pipeline")?;
        gstreamer::Element::link_many([&convert, &filter, sink]).context("link stream pipeline")?;

        // uridecodebin exposes its pads once the stream is probed.
        let convert_weak = convert.downgrade();
        decode.connect_pad_added(move |_, pad| {
            let Some(convert) = convert_weak.upgrade() else {
                return;
            };
            let Some(sink) = convert.static_pad("sink") else {
                return;
            };
            let is_video = pad
                .current_caps()
                .and_then(|caps| {
                    caps.structure(0)
                        .map(|s| s.name().starts_with("video/"))
                })
                .unwrap_or(false);
            if !is_video || sink.is_linked() {
                return;
            }
            if let Err(err) = pad.link(&sink) {
                log::warn!("failed to link decoded video pad: {:?}", err);
            }
        });

        Ok(Self {
            config,
            pipeline,
            appsink,
            read_timeout: SourceTimeouts::default().read,
            open: false,
        })
    }

    fn open(&mut self, timeouts: &SourceTimeouts) -> Result<()> {
        use gstreamer::prelude::*;

        self.read_timeout = timeouts.read;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;

        let wait = gstreamer::ClockTime::from_mseconds(timeouts.open.as_millis() as u64);
        let (result, current, _pending) = self.pipeline.state(wait);
        if result.is_err() || current != gstreamer::State::Playing {
            self.close();
            return Err(anyhow!(
                "{} did not reach Playing within {:?} (state {:?})",
                redact_url(&self.config.url),
                timeouts.open,
                current
            ));
        }
        self.open = true;
        log::info!("connected to {}", redact_url(&self.config.url));
        Ok(())
    }

    fn read(&mut self) -> Result<RgbImage> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("no frame within {:?}", self.read_timeout))?;

        sample_to_image(&sample)
    }

    fn close(&mut self) {
        use gstreamer::prelude::*;

        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop stream pipeline: {}", err);
        }
        self.open = false;
    }

    fn poll_bus(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("stream reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if self.open {
            self.close();
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("sample row is out of bounds")?,
        );
    }

    RgbImage::from_raw(width, height, pixels).context("sample size does not match caps")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            width: 64,
            height: 48,
            synthetic_fps: 0,
        }
    }

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.open(&SourceTimeouts::default())?;
        assert!(source.is_open());

        let first = source.read()?;
        let second = source.read()?;
        assert_eq!(first.dimensions(), (64, 48));
        assert_ne!(first.as_raw(), second.as_raw(), "frames should move");
        Ok(())
    }

    #[test]
    fn synthetic_source_fails_reads_when_closed() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        assert!(source.read().is_err());
        source.open(&SourceTimeouts::default())?;
        source.close();
        source.close();
        assert!(!source.is_open());
        assert!(source.read().is_err());
        Ok(())
    }

    #[test]
    fn source_uri_keeps_shell_and_pipeline_syntax_inside_the_uri() -> Result<()> {
        let uri = source_uri("rtsp://user:pw@cam:554/live\" ! filesink location=/tmp/x")?;
        assert!(uri.starts_with("rtsp://user:pw@cam:554/live"));
        assert!(!uri.contains(' '));
        assert!(!uri.contains('"'));
        assert_eq!(source_uri("rtsp://cam/live")?, "rtsp://cam/live");
        Ok(())
    }

    #[test]
    fn source_uri_rejects_malformed_urls() {
        assert!(source_uri("10.0.0.7/live").is_err());
        assert!(source_uri("rtsp://bad host/live").is_err());
        assert!(source_uri("mailto:ops@example.com").is_err());
    }

    #[test]
    fn malformed_network_url_is_rejected_before_decode() {
        let err = RtspSource::new(RtspConfig {
            url: "rtsp://user:pw@bad host/live".to_string(),
            ..stub_config()
        })
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
        assert!(err.contains("invalid stream url"));
        assert!(!err.contains("pw"));
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn network_url_requires_gstreamer() {
        let err = RtspSource::new(RtspConfig {
            url: "rtsp://user:pw@camera/live".to_string(),
            ..stub_config()
        })
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
        assert!(err.contains("rtsp-gstreamer"));
        assert!(!err.contains("pw"));
    }
}
