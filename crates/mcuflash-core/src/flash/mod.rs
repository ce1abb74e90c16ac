//! Flash programming engine
//!
//! This module contains:
//! - [`unlock`] - Scoped unlock guards for key-protected register groups
//! - [`FlashDevice`] - Per-target variant dispatch (single/dual bank,
//!   secure split, pulse-verify)
//! - [`FlashHandle`] - Range erase, write with fallback, read and verify
//! - Option byte read/stage/commit
//!
//! The controller-specific engines live in private modules and are only
//! reached through [`FlashDevice`].

mod device;
mod geometry;
mod handle;
mod msp432;
mod options;
mod poll;
mod progress;
mod stm32;
pub mod unlock;

#[cfg(test)]
pub(crate) mod testing;

pub use device::{FlashDevice, FlashVariant};
pub use geometry::{FlashGeometry, OtpRegion};
pub use handle::{need_erase, FlashHandle};
pub use msp432::{PulseBudget, BURST_LEN};
pub use options::{OptionValues, StagedOptions};
pub use poll::Timing;
pub use progress::{FlashObserver, NoProgress, WriteStats};
