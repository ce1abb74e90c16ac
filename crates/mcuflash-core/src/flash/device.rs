//! Flash device variants
//!
//! A [`FlashDevice`] is built once per attach from the family descriptor
//! and the option bits read from the target (bank mode, bank swap, secure
//! register set, pulse budget). It then dispatches every operation to the
//! engine matching its [`FlashVariant`].

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::family::{BankMode, ControllerDef, FamilyDescriptor, OptionFieldDef, Stm32Layout};
use crate::probe::DebugProbe;

use super::geometry::FlashGeometry;
use super::msp432::{Msp432Engine, PulseBudget};
use super::options::{self, OptionValues, StagedOptions};
use super::poll::Timing;
use super::stm32::Stm32Engine;

/// How a family's controller is driven on this particular target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashVariant {
    /// One bank, one register set
    SingleBank,
    /// Two banks, optionally presented in swapped order
    DualBank {
        /// Bank-swap option was set at attach
        swapped: bool,
    },
    /// Non-secure and secure register sets, chosen by an option bit
    SecureSplit {
        /// Secure register set in use
        secure: bool,
        /// Bank-swap option was set at attach
        swapped: bool,
    },
    /// Mask erase and burst program with pulse-and-verify
    PulseVerify {
        /// Pulse limits read from the device
        budget: PulseBudget,
    },
}

/// The flash of one attached target
#[derive(Debug, Clone)]
pub struct FlashDevice {
    family: FamilyDescriptor,
    geometry: FlashGeometry,
    variant: FlashVariant,
    timing: Timing,
}

impl FlashDevice {
    /// Read the runtime configuration of `family` from the target
    pub fn probe<P: DebugProbe + ?Sized>(
        probe: &mut P,
        family: &FamilyDescriptor,
        config: &EngineConfig,
    ) -> Result<Self> {
        let timing = Timing::from_config(config);

        let (geometry, variant) = match &family.controller {
            ControllerDef::Stm32(layout) => {
                let dual = match &family.geometry.banks {
                    BankMode::Single => false,
                    BankMode::Dual => true,
                    BankMode::Selectable(option) => {
                        options::read_option(probe, family, layout, option)? != 0
                    }
                };
                let geometry = FlashGeometry::resolve(&family.geometry, dual);

                let swapped = match (&family.swap_option, dual) {
                    (Some(option), true) => options::read_option(probe, family, layout, option)? != 0,
                    _ => false,
                };

                let variant = match &layout.secure_option {
                    Some(option) => FlashVariant::SecureSplit {
                        secure: options::read_option(probe, family, layout, option)? != 0,
                        swapped,
                    },
                    None if dual => FlashVariant::DualBank { swapped },
                    None => FlashVariant::SingleBank,
                };
                (geometry, variant)
            }
            ControllerDef::Msp432(layout) => {
                let budget = PulseBudget::read(probe, layout.tlv_base)?;
                let dual = family.geometry.banks != BankMode::Single;
                (
                    FlashGeometry::resolve(&family.geometry, dual),
                    FlashVariant::PulseVerify { budget },
                )
            }
        };

        log::debug!(
            "{}: {} x {} byte sectors, {} bank(s), {:?}",
            family.name,
            geometry.sector_count,
            geometry.sector_size,
            geometry.banks,
            variant
        );

        Ok(Self {
            family: family.clone(),
            geometry,
            variant,
            timing,
        })
    }

    /// Family descriptor
    pub fn family(&self) -> &FamilyDescriptor {
        &self.family
    }

    /// Resolved geometry
    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    /// Variant chosen at attach
    pub fn variant(&self) -> FlashVariant {
        self.variant
    }

    /// Program line size in bytes
    pub fn line_size(&self) -> u32 {
        self.family.line_size
    }

    /// Bank-swap option of this target, if swapping is possible
    pub fn swap_option(&self) -> Option<&OptionFieldDef> {
        if self.geometry.banks < 2 {
            return None;
        }
        self.family
            .swap_option
            .as_deref()
            .and_then(|name| self.family.option_field(name))
    }

    fn engine(&self) -> Engine<'_> {
        match &self.family.controller {
            ControllerDef::Stm32(layout) => {
                let (swapped, secure) = match self.variant {
                    FlashVariant::DualBank { swapped } => (swapped, false),
                    FlashVariant::SecureSplit { secure, swapped } => (swapped, secure),
                    FlashVariant::SingleBank | FlashVariant::PulseVerify { .. } => (false, false),
                };
                Engine::Stm32(Stm32Engine {
                    layout,
                    geometry: &self.geometry,
                    line_size: self.family.line_size,
                    swapped,
                    secure,
                    timing: self.timing,
                })
            }
            ControllerDef::Msp432(layout) => {
                let budget = match self.variant {
                    FlashVariant::PulseVerify { budget } => budget,
                    _ => PulseBudget::default(),
                };
                Engine::Msp432(Msp432Engine {
                    layout,
                    geometry: &self.geometry,
                    budget,
                    timing: self.timing,
                })
            }
        }
    }

    /// Erase sector `n`
    pub fn erase_sector<P: DebugProbe + ?Sized>(&self, probe: &mut P, n: u32) -> Result<()> {
        self.geometry.locate(n)?;
        match self.engine() {
            Engine::Stm32(engine) => engine.erase_sector(probe, n),
            Engine::Msp432(engine) => engine.erase_sectors(probe, 1 << n),
        }
    }

    /// Erase every sector in `mask` (bit i = sector i)
    pub fn erase_sectors<P: DebugProbe + ?Sized>(&self, probe: &mut P, mask: u64) -> Result<()> {
        self.erase_sectors_with(probe, mask, |_| {})
    }

    /// Erase every sector in `mask`, reporting the number of sectors done
    ///
    /// Pulse-verify controllers erase the whole mask in one batch and report
    /// once, the others walk it one sector at a time.
    pub fn erase_sectors_with<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        mask: u64,
        mut progress: impl FnMut(usize),
    ) -> Result<()> {
        self.geometry.check_mask(mask)?;
        match self.engine() {
            Engine::Stm32(_) => {
                let sectors = (0..64).filter(|s| mask & (1u64 << s) != 0);
                self.erase_each(probe, sectors, progress)
            }
            Engine::Msp432(engine) => {
                engine.erase_sectors(probe, mask)?;
                progress(mask.count_ones() as usize);
                Ok(())
            }
        }
    }

    /// Erase `sectors` one at a time, in order
    pub(crate) fn erase_each<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        sectors: impl IntoIterator<Item = u32>,
        mut progress: impl FnMut(usize),
    ) -> Result<()> {
        for (i, sector) in sectors.into_iter().enumerate() {
            self.erase_sector(probe, sector)?;
            progress(i + 1);
        }
        Ok(())
    }

    /// Check that `addr..addr+len` can be programmed
    pub fn check_program(&self, addr: u32, len: usize) -> Result<()> {
        let line = self.family.line_size;
        if addr % line != 0 || len % line as usize != 0 {
            return Err(Error::Alignment { addr, len, line });
        }
        let otp_ok = self.stm32_layout().is_some() && self.geometry.in_otp(addr, len);
        if !self.geometry.contains(addr, len) && !otp_ok {
            return Err(Error::OutOfBounds { addr, len });
        }
        Ok(())
    }

    /// Program `data` at `addr`
    ///
    /// The range must be line aligned and already erased; OTP lines must
    /// still be blank.
    pub fn program<P: DebugProbe + ?Sized>(&self, probe: &mut P, addr: u32, data: &[u8]) -> Result<()> {
        self.check_program(addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        match self.engine() {
            Engine::Stm32(engine) => engine.program(probe, addr, data),
            Engine::Msp432(engine) => engine.program(probe, addr, data),
        }
    }

    /// Decode the active option values
    pub fn read_options<P: DebugProbe + ?Sized>(&self, probe: &mut P) -> Result<OptionValues> {
        match self.engine() {
            Engine::Stm32(engine) => options::read_options(probe, &self.family, &engine),
            Engine::Msp432(_) => Err(Error::Unsupported("option bytes")),
        }
    }

    /// Validate and stage option changes without writing anything
    pub fn stage_options<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        values: &OptionValues,
    ) -> Result<StagedOptions> {
        match self.engine() {
            Engine::Stm32(engine) => options::stage(probe, &self.family, &engine, values),
            Engine::Msp432(_) => Err(Error::Unsupported("option bytes")),
        }
    }

    /// Program staged options and trigger the option load reset
    pub fn commit_options<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        staged: &StagedOptions,
    ) -> Result<()> {
        match self.engine() {
            Engine::Stm32(engine) => options::commit(probe, &engine, staged),
            Engine::Msp432(_) => Err(Error::Unsupported("option bytes")),
        }
    }

    fn stm32_layout(&self) -> Option<&Stm32Layout> {
        match &self.family.controller {
            ControllerDef::Stm32(layout) => Some(layout),
            ControllerDef::Msp432(_) => None,
        }
    }
}

enum Engine<'d> {
    Stm32(Stm32Engine<'d>),
    Msp432(Msp432Engine<'d>),
}
