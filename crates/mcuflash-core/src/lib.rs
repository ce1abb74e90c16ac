//! mcuflash-core - Flash programming engine for Cortex-M microcontrollers
//!
//! This crate drives the on-chip flash controller of a target through a
//! debug probe. Everything is expressed as register reads and writes issued
//! through the [`probe::DebugProbe`] trait, so the same engine works with any
//! probe that can access target memory.
//!
//! # Overview
//!
//! - [`family`] - Per-family register layouts, geometry and option maps
//! - [`flash`] - Unlock guards, erase/program engines and option bytes
//! - [`session`] - Target discovery and reconnection after a reset
//!
//! # Example
//!
//! ```ignore
//! use mcuflash_core::{config::EngineConfig, family::FamilyDatabase, session::Session};
//! use std::sync::Arc;
//!
//! let db = Arc::new(FamilyDatabase::builtin()?);
//! let mut session = Session::attach(probe, db, EngineConfig::default())?;
//! session.flash().erase_sector(3)?;
//!
//! // Option changes reset the target, the old session is consumed
//! let mut options = mcuflash_core::flash::OptionValues::new();
//! options.insert("rdp".into(), 0xAA);
//! let session = session.set_options(&options)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod family;
pub mod flash;
pub mod probe;
pub mod register;
pub mod session;

pub use error::{Error, Result};
