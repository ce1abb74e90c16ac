//! CLI command implementations
//!
//! Every command that touches a target works on an attached
//! [`Session`](mcuflash_core::session::Session). Commands that reset the
//! target consume the session and hand back the reconnected one.

mod erase;
mod info;
mod list;
mod options;
mod progress;
mod read;
mod write;

pub use erase::{run_erase, EraseSelection};
pub use info::run_info;
pub use list::{format_size, list_families, list_probes};
pub use options::{run_options_get, run_options_set, run_swap_banks};
pub use progress::IndicatifProgress;
pub use read::run_read;
pub use write::{run_verify, run_write};

/// Result type for command implementations
pub type CommandResult<T = ()> = Result<T, Box<dyn std::error::Error>>;
