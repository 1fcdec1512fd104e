pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;
use crate::detect::backend::DetectorBackend;

/// Build the backend named in the configuration.
pub fn build_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend.as_str() {
        "stub" => Ok(Box::new(StubBackend::new())),
        #[cfg(feature = "backend-tract")]
        "tract" => Ok(Box::new(TractBackend::new(
            &settings.model_path,
            settings.model_input,
            settings.model_input,
        )?)),
        #[cfg(not(feature = "backend-tract"))]
        "tract" => Err(anyhow!("tract backend requires the backend-tract feature")),
        other => Err(anyhow!("unknown detector backend '{}'", other)),
    }
}
