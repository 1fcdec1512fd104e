//! Worker-thread side of the relay.
//!
//! - `StreamConnector`: mutex-guarded upstream handle
//! - `CaptureLoop`: connect/read state machine feeding the raw and clean slots
//! - `InferenceStage`: detection, overlays, and notification hand-off
//! - `Watchdog`: liveness checks that request reconnects
//!
//! The stages share a `PipelineState` of atomics with the event loop.

mod capture;
mod connector;
mod inference;
mod state;
mod watchdog;

pub use capture::{CaptureLoop, CaptureStep};
pub use connector::StreamConnector;
pub use inference::{InferenceSettings, InferenceStage, InferenceStep};
pub use state::{FpsCounter, Liveness, PipelineState};
pub use watchdog::{Trigger, Watchdog};
