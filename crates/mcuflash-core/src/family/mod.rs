//! MCU family descriptors
//!
//! Each supported family is a data table rather than a type: the engine is
//! written once against [`FamilyDescriptor`] and picks its behaviour from the
//! controller kind and layout stored there.

mod database;
mod types;

pub use database::{FamilyDatabase, FamilyDbError};
pub use types::*;
