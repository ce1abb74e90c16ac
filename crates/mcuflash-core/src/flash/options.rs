//! Option bytes
//!
//! Options are exposed only as a flat `name -> value` map. Reading decodes
//! the active ("current") registers. Writing is split in two: staging
//! validates the request and computes the new program-register values
//! without touching the hardware, committing programs them and triggers the
//! option load, which resets the target.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::family::{FamilyDescriptor, OptionFieldDef, ResetMethod, Stm32Layout};
use crate::probe::{DebugProbe, AIRCR, AIRCR_SYSRESETREQ};
use crate::register::{Field, Registers};

use super::poll;
use super::stm32::Stm32Engine;
use super::unlock::UnlockGuard;

/// Option values keyed by lower-case field name
pub type OptionValues = BTreeMap<String, u32>;

/// Program-register values ready to commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedOptions {
    registers: Vec<u32>,
    changes: OptionValues,
}

impl StagedOptions {
    /// New program-register values, in register order
    pub fn registers(&self) -> &[u32] {
        &self.registers
    }

    /// The options that were requested
    pub fn changes(&self) -> &OptionValues {
        &self.changes
    }
}

fn current_field(registers: &[u32], def: &OptionFieldDef) -> Field {
    Field::new(registers[def.register], def.shift, def.width)
}

/// Decode every named option from the current registers
pub(crate) fn read_options<P: DebugProbe + ?Sized>(
    probe: &mut P,
    family: &FamilyDescriptor,
    engine: &Stm32Engine<'_>,
) -> Result<OptionValues> {
    let current = &engine.layout.options.current;
    let mut regs = Registers::new(probe, engine.layout.base);

    let mut raw = Vec::with_capacity(current.len());
    for offset in current {
        raw.push(regs.read(*offset)?);
    }

    Ok(family
        .option_fields
        .iter()
        .map(|def| {
            let field = current_field(current, def);
            (def.name.clone(), field.extract(raw[def.register]))
        })
        .collect())
}

/// Read one option from the current registers
pub(crate) fn read_option<P: DebugProbe + ?Sized>(
    probe: &mut P,
    family: &FamilyDescriptor,
    layout: &Stm32Layout,
    name: &str,
) -> Result<u32> {
    let def = family
        .option_field(name)
        .ok_or_else(|| Error::Database(format!("{}: no option field '{}'", family.name, name)))?;
    let field = current_field(&layout.options.current, def);
    Registers::new(probe, layout.base).get(field)
}

/// Validate a request and merge it into the program registers
///
/// Unknown names and out-of-range values are rejected before any register
/// access; on success the registers have only been read.
pub(crate) fn stage<P: DebugProbe + ?Sized>(
    probe: &mut P,
    family: &FamilyDescriptor,
    engine: &Stm32Engine<'_>,
    requested: &OptionValues,
) -> Result<StagedOptions> {
    let mut matched = Vec::new();
    let mut unknown = Vec::new();
    for (name, value) in requested {
        let key = name.to_lowercase();
        match family.option_field(&key) {
            Some(def) => {
                let max = Field::new(0, def.shift, def.width).max_value();
                if *value > max {
                    return Err(Error::OptionValue {
                        name: key,
                        value: *value,
                        width: def.width,
                    });
                }
                matched.push((def, key, *value));
            }
            None => unknown.push(name.clone()),
        }
    }
    if !unknown.is_empty() {
        return Err(Error::InvalidOptions(unknown));
    }

    let program = &engine.layout.options.program;
    let mut regs = Registers::new(probe, engine.layout.base);
    let mut registers = Vec::with_capacity(program.len());
    for offset in program {
        registers.push(regs.read(*offset)?);
    }

    let mut changes = OptionValues::new();
    for (def, key, value) in matched {
        let field = Field::new(program[def.register], def.shift, def.width);
        registers[def.register] = field.insert(registers[def.register], value);
        log::debug!("Staging option {} = 0x{:X}", key, value);
        changes.insert(key, value);
    }

    Ok(StagedOptions { registers, changes })
}

/// Program staged options and launch the option load
///
/// Returns once the reset has been triggered. The debug link may be down
/// afterwards; the caller must reconnect before touching the target again.
pub(crate) fn commit<P: DebugProbe + ?Sized>(
    probe: &mut P,
    engine: &Stm32Engine<'_>,
    staged: &StagedOptions,
) -> Result<()> {
    let layout = engine.layout;
    let options = &layout.options;
    let base = layout.base;
    let regs = layout
        .option_parent()
        .ok_or_else(|| Error::Database("no register set for option bytes".into()))?;

    let mut main = UnlockGuard::enter(probe, engine.main_lock(&regs))?;
    poll::wait_clear(
        main.probe(),
        base + regs.sr,
        layout.status.busy,
        engine.timing,
    )?;
    engine.clear_errors(main.probe(), &regs)?;

    let mut opt = main.options(engine.option_lock(), options.nested)?;
    {
        let mut r = Registers::new(opt.probe(), base);
        for (offset, value) in options.program.iter().zip(&staged.registers) {
            r.write(*offset, *value)?;
        }
        r.set(options.start, 1)?;
    }

    poll::wait_clear(
        opt.probe(),
        base + options.busy.offset,
        options.busy.mask(),
        engine.timing,
    )?;

    let errors = Registers::new(opt.probe(), base).read(options.errors.offset)?;
    if errors & options.errors.mask != 0 {
        log::error!("Option programming failed, status 0x{:08X}", errors);
        return Err(Error::Controller { status: errors });
    }
    log::info!("Option bytes programmed, launching option load");

    // Both locks stay open for the load; the reset relocks them
    let launched = match options.reset {
        ResetMethod::ObLaunch(field) => {
            let mut r = Registers::new(opt.probe(), base);
            let cr = r.read(field.offset)?;
            r.write(field.offset, field.insert(cr, 1))
        }
        ResetMethod::SystemReset => opt.probe().write32(AIRCR, AIRCR_SYSRESETREQ),
    };
    match launched {
        Ok(()) => {}
        Err(e) if e.is_transport() => {
            log::debug!("Link dropped by option load reset: {}", e);
        }
        Err(e) => return Err(e),
    }

    opt.disarm();
    main.disarm();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FamilyDatabase;
    use crate::family::{ControllerDef, FamilyDescriptor};
    use crate::flash::geometry::FlashGeometry;
    use crate::flash::poll::Timing;
    use crate::flash::testing::MockProbe;

    const BASE: u32 = 0x4002_2000;

    fn g4() -> FamilyDescriptor {
        FamilyDatabase::builtin()
            .unwrap()
            .find("stm32g4")
            .unwrap()
            .clone()
    }

    fn with_engine<R>(family: &FamilyDescriptor, f: impl FnOnce(&Stm32Engine<'_>) -> R) -> R {
        let layout = match &family.controller {
            ControllerDef::Stm32(layout) => layout,
            ControllerDef::Msp432(_) => unreachable!(),
        };
        let geometry = FlashGeometry::resolve(&family.geometry, false);
        let engine = Stm32Engine {
            layout,
            geometry: &geometry,
            line_size: family.line_size,
            swapped: false,
            secure: false,
            timing: Timing::default(),
        };
        f(&engine)
    }

    #[test]
    fn test_read_options_decodes_fields() {
        let family = g4();
        let mut probe = MockProbe::stm32(BASE);
        probe.poke(BASE + 0x20, 0xFFEF_F8AA);

        let options = with_engine(&family, |e| read_options(&mut probe, &family, e)).unwrap();
        assert_eq!(options["rdp"], 0xAA);
        assert_eq!(options["bor_lev"], 0);
        assert_eq!(options["bfb2"], 0);
        assert_eq!(options["dbank"], 1);
        assert_eq!(options.len(), family.option_fields.len());
    }

    #[test]
    fn test_stage_merges_without_writing() {
        let family = g4();
        let mut probe = MockProbe::stm32(BASE);
        probe.poke(BASE + 0x20, 0xFFEF_F8AA);

        let mut request = OptionValues::new();
        request.insert("RDP".into(), 0xBB);
        request.insert("bfb2".into(), 1);
        let staged = with_engine(&family, |e| stage(&mut probe, &family, e, &request)).unwrap();

        assert_eq!(staged.registers(), &[0xFFFF_F8BB]);
        assert_eq!(staged.changes()["rdp"], 0xBB);
        assert!(probe.writes().is_empty());
    }

    #[test]
    fn test_stage_rejects_unknown_names() {
        let family = g4();
        let mut probe = MockProbe::stm32(BASE);

        let mut request = OptionValues::new();
        request.insert("rdp".into(), 0xAA);
        request.insert("not_a_real_field".into(), 1);
        let err = with_engine(&family, |e| stage(&mut probe, &family, e, &request))
            .err()
            .unwrap();

        match err {
            Error::InvalidOptions(names) => assert_eq!(names, vec!["not_a_real_field"]),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(probe.writes().is_empty());
    }

    #[test]
    fn test_stage_rejects_wide_values() {
        let family = g4();
        let mut probe = MockProbe::stm32(BASE);

        let mut request = OptionValues::new();
        request.insert("bor_lev".into(), 8);
        let err = with_engine(&family, |e| stage(&mut probe, &family, e, &request))
            .err()
            .unwrap();
        assert!(matches!(err, Error::OptionValue { width: 3, .. }));
    }
}
