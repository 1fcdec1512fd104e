//! Stream relay
//!
//! Ingests one live camera stream, runs object detection on it, and serves
//! two WebRTC feeds: an annotated "AI" feed and a clean passthrough feed.
//! New tracked detections are posted to an HTTP notification sink.
//!
//! # Architecture
//!
//! Three worker threads (capture, inference, watchdog) hand frames to each
//! other and to the event loop only through single-frame, replace-on-push
//! slots:
//!
//! ```text
//! capture ──► raw ──► inference ──► ai ────► AI sessions
//!        └──► clean ─────────────────────────► clean sessions
//! ```
//!
//! A single-threaded tokio runtime hosts WebSocket signaling, per-session
//! frame pumps, the notification worker, and health endpoints.
//!
//! # Module Structure
//!
//! - `frame`: frames and the slots between stages
//! - `ingest`: upstream video sources
//! - `detect`: detector backends, tracking, and labels
//! - `dedup`: duplicate-suppression for notifications
//! - `overlay`: boxes, banner, and error strip drawing
//! - `notify`: notification payloads and the delivery worker
//! - `pipeline`: capture loop, inference stage, watchdog, shared state
//! - `server`: signaling, publishing, health, and metrics
//! - `fleet`: device lookup against the fleet management API
//! - `config`: file and environment configuration

pub mod config;
pub mod dedup;
pub mod detect;
pub mod fleet;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod overlay;
pub mod pipeline;
pub mod server;

pub use config::RelayConfig;
pub use dedup::{DuplicateSuppressor, Verdict};
pub use detect::{BBox, Detection, DetectorBackend, InferMode, InferParams};
pub use fleet::{DeviceProfile, FleetClient};
pub use frame::{Frame, FrameSlot, PipelineSlots, SharedFrame};
pub use ingest::{rtsp::RtspConfig, RtspSource, VideoSource};
pub use overlay::OverlayPainter;
pub use pipeline::{CaptureLoop, InferenceStage, PipelineState, StreamConnector, Watchdog};
pub use server::{AppState, FeedKind, HealthSnapshot, SessionManager};
