//! Error types for opening probes

use thiserror::Error;

/// Errors from the probe registry
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Malformed probe specification or parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// No probe registered under this name
    #[error("Unknown probe: {0}")]
    UnknownProbe(String),

    /// The probe driver could not open the device
    #[error("Failed to open probe: {0}")]
    Open(String),

    /// Attaching to the target failed
    #[error(transparent)]
    Session(#[from] mcuflash_core::Error),
}
