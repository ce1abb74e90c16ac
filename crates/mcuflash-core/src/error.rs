//! Error types for mcuflash-core
//!
//! Every failure carries the hardware state needed to diagnose it (raw
//! status registers, unverified sector masks, pulse counts) so callers never
//! have to re-read registers after an error.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    // Transport errors
    /// A probe transfer failed
    #[error("probe transfer failed at 0x{addr:08X}: {reason}")]
    Transfer {
        /// Target address of the failed access
        addr: u32,
        /// Probe-specific reason
        reason: String,
    },
    /// The debug link to the target is down
    #[error("debug link to the target is down")]
    Disconnected,
    /// The link did not come back after a reset
    #[error("target did not come back after {attempts} reconnect attempts")]
    ReconnectFailed {
        /// Number of reprobe attempts made
        attempts: u32,
    },

    // Target errors
    /// No family in the database matches the connected target
    #[error("unknown target (CPUID 0x{cpuid:08X})")]
    UnknownTarget {
        /// Raw CPUID register value
        cpuid: u32,
    },
    /// Requested feature is not available on this controller
    #[error("{0} is not supported by this flash controller")]
    Unsupported(&'static str),

    // Lock errors
    /// Lock bit still set after writing the unlock keys
    #[error("{register} still locked after writing keys (register 0x{status:08X})")]
    UnlockFailed {
        /// Which lock failed ("flash" or "option bytes")
        register: &'static str,
        /// Register value read back after the key sequence
        status: u32,
    },
    /// Option bytes unlocked before the main array on a nesting controller
    #[error("option bytes cannot be unlocked while the main array is locked")]
    LockOrder,

    // Controller errors
    /// Controller stayed busy past the poll timeout
    #[error("flash controller still busy after {timeout_ms} ms (status 0x{status:08X})")]
    ControllerTimeout {
        /// Last status register value
        status: u32,
        /// Poll timeout that expired
        timeout_ms: u64,
    },
    /// Controller reported error flags after an operation
    #[error("flash controller reported an error (status 0x{status:08X})")]
    Controller {
        /// Raw status register value
        status: u32,
    },
    /// Some sectors did not verify erased within the pulse budget
    #[error("erase failed: sectors 0x{mask:016X} not erased after {pulses} pulses")]
    Erase {
        /// Sectors that never verified erased
        mask: u64,
        /// Number of erase pulses issued
        pulses: u32,
    },
    /// Programming did not converge within the pulse budget
    #[error("write failed at 0x{addr:08X} after {pulses} pulses (status 0x{status:08X})")]
    Write {
        /// Address of the failing program line
        addr: u32,
        /// Number of program pulses issued
        pulses: u32,
        /// Raw status of the last pulse
        status: u32,
    },
    /// Read-back did not match the expected data
    #[error("verify failed at 0x{addr:08X}")]
    Verify {
        /// First mismatching address
        addr: u32,
    },

    // Request errors
    /// Address or length is not a multiple of the program line
    #[error("0x{addr:08X}+{len} is not aligned to the {line}-byte program line")]
    Alignment {
        /// Requested address
        addr: u32,
        /// Requested length
        len: usize,
        /// Program line size of the family
        line: u32,
    },
    /// Request extends outside flash
    #[error("0x{addr:08X}+{len} is outside flash memory")]
    OutOfBounds {
        /// Requested address
        addr: u32,
        /// Requested length
        len: usize,
    },
    /// Sector index or mask names a sector that does not exist
    #[error("sector {0} does not exist")]
    InvalidSector(u32),
    /// OTP line already holds data
    #[error("OTP line at 0x{addr:08X} is already programmed")]
    OtpProgrammed {
        /// Address of the programmed OTP line
        addr: u32,
    },

    // Option byte errors
    /// Unknown option names
    #[error("Invalid options: {0:?}")]
    InvalidOptions(Vec<String>),
    /// Value does not fit the option field
    #[error("value 0x{value:X} does not fit option '{name}' ({width} bits)")]
    OptionValue {
        /// Option name
        name: String,
        /// Rejected value
        value: u32,
        /// Field width in bits
        width: u8,
    },

    /// Family descriptor is inconsistent
    #[error("family database: {0}")]
    Database(String),
}

impl Error {
    /// Whether this error comes from the debug link rather than the target
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transfer { .. } | Error::Disconnected)
    }
}

/// Result type alias using the core Error type
pub type Result<T> = std::result::Result<T, Error>;
