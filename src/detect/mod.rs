//! Detection collaborator boundary.
//!
//! The detector is an opaque function from an output-resolution frame to
//! labelled boxes (optionally with track ids). Backends implement
//! `DetectorBackend`; the inference stage calls them through
//! `infer_with_fallback`.

mod backend;
pub mod backends;
pub mod labels;
mod result;
pub mod tracker;

pub use backend::{infer_with_fallback, DetectorBackend, InferMode, InferOutcome, InferParams};
pub use backends::{build_backend, StubBackend};
pub use result::{BBox, Detection};
pub use tracker::IouTracker;
