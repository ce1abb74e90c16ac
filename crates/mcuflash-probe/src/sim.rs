//! Simulated probe driver
//!
//! Parameters:
//! - `family=<name>`: family to simulate (default `stm32g4`)
//! - `link=error|silent|survives`: link behaviour on reset
//! - `reprobe_failures=<n>`: reprobes that fail before the link comes back
//! - any option field name: its value at power-up (decimal or `0x` hex)

use mcuflash_core::family::FamilyDatabase;
use mcuflash_core::register::Field;
use mcuflash_sim::{Faults, ResetLink, SimProbe, SimTarget};

use crate::error::ProbeError;
use crate::registry::{parse_number, BoxedProbe, ProbeInfo, ProbeParams};

pub(crate) const INFO: ProbeInfo = ProbeInfo {
    name: "sim",
    aliases: &["simulator", "dummy"],
    description: "Simulated target (family=, link=error|silent|survives, reprobe_failures=, <option>=)",
};

const DEFAULT_FAMILY: &str = "stm32g4";

fn parse_link(value: &str) -> Result<ResetLink, ProbeError> {
    match value {
        "error" => Ok(ResetLink::DropsWithError),
        "silent" => Ok(ResetLink::DropsSilently),
        "survives" => Ok(ResetLink::Survives),
        other => Err(ProbeError::InvalidParameter(format!(
            "link '{}' (expected error, silent or survives)",
            other
        ))),
    }
}

pub(crate) fn open(params: &ProbeParams, db: &FamilyDatabase) -> Result<BoxedProbe, ProbeError> {
    let family_name = params.get("family").unwrap_or(DEFAULT_FAMILY);
    let family = db
        .find(family_name)
        .ok_or_else(|| ProbeError::Open(format!("no family named '{}'", family_name)))?;

    let mut faults = Faults::default();
    let mut options = Vec::new();

    // Sorted so option forcing does not depend on hash order
    let mut keys: Vec<&String> = params.params.keys().collect();
    keys.sort();

    for key in keys {
        let value = &params.params[key];
        match key.as_str() {
            "family" => {}
            "link" => faults.reset_link = parse_link(value)?,
            "reprobe_failures" => faults.reprobe_failures = parse_number(value)?,
            name => {
                let field = family.option_field(name).ok_or_else(|| {
                    ProbeError::InvalidParameter(format!(
                        "unknown parameter '{}' for {}",
                        name, family.name
                    ))
                })?;
                let value = parse_number(value)?;
                if value > Field::new(0, field.shift, field.width).max_value() {
                    return Err(ProbeError::InvalidParameter(format!(
                        "{}={:#x} does not fit in {} bits",
                        name, value, field.width
                    )));
                }
                options.push((name.to_string(), value));
            }
        }
    }

    log::debug!(
        "Simulating {} ({:?} on reset, {} option overrides)",
        family.name,
        faults.reset_link,
        options.len()
    );

    let target = options
        .iter()
        .fold(SimTarget::new(family), |target, (name, value)| {
            target.with_option(name, *value)
        })
        .with_faults(faults);

    Ok(Box::new(SimProbe::new(target)))
}
