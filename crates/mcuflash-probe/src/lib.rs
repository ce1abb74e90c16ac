//! mcuflash-probe - Debug probe registry
//!
//! This crate maps probe specification strings such as
//! `sim:family=stm32h7,link=silent` to opened [`DebugProbe`] instances and
//! attached sessions. Probe drivers are compiled in through cargo features.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  mcuflash CLI                        │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ "name:key=value,..."
//!                            ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                  ProbeRegistry                       │
//! │  parse_probe_params() -> driver open fn -> BoxedProbe│
//! └──────────────────────────┬───────────────────────────┘
//!                            │ Session::attach()
//!                            ▼
//! ┌──────────────────────────────────────────────────────┐
//! │          mcuflash-core Session<BoxedProbe>           │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - `sim` (default): the simulated target from `mcuflash-sim`
//!
//! [`DebugProbe`]: mcuflash_core::probe::DebugProbe

mod error;
mod registry;
#[cfg(feature = "sim")]
mod sim;

pub use error::ProbeError;
pub use registry::{
    parse_number, parse_probe_params, BoxedProbe, OpenFn, ProbeInfo, ProbeParams, ProbeRegistry,
};
