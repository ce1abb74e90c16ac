//! Simulated target
//!
//! A [`SimTarget`] holds the flash array, OTP, the ID/TLV words the engine
//! reads at attach and one controller model. It is driven through
//! [`SimProbe`](crate::SimProbe) and can be inspected directly by tests.

use std::collections::{BTreeMap, HashMap};

use mcuflash_core::error::{Error, Result};
use mcuflash_core::family::{BankMode, ControllerDef, FamilyDescriptor};
use mcuflash_core::flash::{FlashGeometry, PulseBudget};
use mcuflash_core::probe::{AIRCR, AIRCR_SYSRESETREQ, CPUID};

use crate::msp432::Msp432Model;
use crate::stm32::Stm32Model;

/// What the debug link does when the target resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetLink {
    /// The access that caused the reset fails and the link stays down
    #[default]
    DropsWithError,
    /// The access succeeds but the link is down afterwards
    DropsSilently,
    /// The probe keeps the link across the reset
    Survives,
}

/// Bits of one byte that need extra program pulses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakBits {
    /// Byte address
    pub addr: u32,
    /// Bits that stay at one
    pub mask: u8,
    /// Number of pulses they resist
    pub pulses: u32,
}

/// Injected faults
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Unlock keys are never accepted
    pub wrong_keys: bool,
    /// Busy flags never clear
    pub wedged_busy: bool,
    /// Sectors that survive this many erase pulses (`u32::MAX` for ever)
    pub resistant_sectors: BTreeMap<u32, u32>,
    /// Bits that need more than one program pulse
    pub weak_bits: Vec<WeakBits>,
    /// Every burst program reports a post-verify error
    pub program_always_fails: bool,
    /// Burst pulses that program and then report both verify errors
    pub double_verify_errors: u32,
    /// Link behaviour on reset
    pub reset_link: ResetLink,
    /// Reprobe attempts that fail before the link comes back
    pub reprobe_failures: u32,
}

/// Counters for test assertions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Register and bulk writes issued by the probe
    pub writes: usize,
    /// Sector erases as (physical bank, index in bank)
    pub sector_erases: Vec<(u32, u32)>,
    /// Unprotected mask of every mass-erase pulse
    pub erase_pulses: Vec<u64>,
    /// Burst program pulses
    pub program_pulses: u32,
    /// Option commits
    pub option_commits: u32,
    /// Target resets
    pub resets: u32,
    /// Reprobe calls
    pub reprobes: u32,
    /// Milliseconds requested through delays
    pub delay_ms: u64,
}

/// Flash storage in physical bank order
#[derive(Debug, Clone)]
pub(crate) struct Memory {
    pub(crate) flash_base: u32,
    pub(crate) flash: Vec<u8>,
    pub(crate) geometry: FlashGeometry,
    pub(crate) swapped: bool,
    pub(crate) otp_base: u32,
    pub(crate) otp: Vec<u8>,
}

impl Memory {
    /// Physical offset of a CPU-visible flash address
    pub(crate) fn flash_offset(&self, addr: u32) -> Option<usize> {
        if addr < self.flash_base {
            return None;
        }
        let offset = (addr - self.flash_base) as usize;
        if offset >= self.flash.len() {
            return None;
        }
        if self.swapped && self.geometry.banks > 1 {
            let bank_size = self.geometry.bank_size() as usize;
            Some(offset ^ bank_size)
        } else {
            Some(offset)
        }
    }

    /// Physical bank of a CPU-visible flash address
    pub(crate) fn physical_bank(&self, addr: u32) -> u32 {
        match self.flash_offset(addr) {
            Some(offset) if self.geometry.banks > 1 => {
                (offset / self.geometry.bank_size() as usize) as u32
            }
            _ => 0,
        }
    }

    pub(crate) fn otp_offset(&self, addr: u32) -> Option<usize> {
        if addr < self.otp_base {
            return None;
        }
        let offset = (addr - self.otp_base) as usize;
        (offset < self.otp.len()).then_some(offset)
    }

    /// Storage byte behind a CPU address (flash or OTP)
    pub(crate) fn byte_mut(&mut self, addr: u32) -> Option<&mut u8> {
        if let Some(offset) = self.flash_offset(addr) {
            return self.flash.get_mut(offset);
        }
        let offset = self.otp_offset(addr)?;
        self.otp.get_mut(offset)
    }

    pub(crate) fn byte(&self, addr: u32) -> Option<u8> {
        if let Some(offset) = self.flash_offset(addr) {
            return self.flash.get(offset).copied();
        }
        let offset = self.otp_offset(addr)?;
        self.otp.get(offset).copied()
    }

    /// Erase sector `index` of physical bank `bank`
    pub(crate) fn erase_physical(&mut self, bank: u32, index: u32) {
        let start = (bank * self.geometry.bank_size() + index * self.geometry.sector_size) as usize;
        let end = (start + self.geometry.sector_size as usize).min(self.flash.len());
        self.flash[start..end].fill(0xFF);
    }
}

/// Result of a register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    None,
    Reset,
}

#[derive(Debug, Clone)]
pub(crate) enum Model {
    Stm32(Stm32Model),
    Msp432(Msp432Model),
}

impl Model {
    fn owns(&self, addr: u32) -> bool {
        match self {
            Model::Stm32(model) => model.owns(addr),
            Model::Msp432(model) => model.owns(addr),
        }
    }
}

/// A simulated microcontroller
#[derive(Debug, Clone)]
pub struct SimTarget {
    family: FamilyDescriptor,
    cpuid: u32,
    id_value: u32,
    pub(crate) memory: Memory,
    pub(crate) model: Model,
    tlv: Vec<u32>,
    regs: HashMap<u32, u32>,
    halted: bool,
    link_up: bool,
    /// Injected faults
    pub faults: Faults,
    /// Counters
    pub stats: SimStats,
}

// TLV layout of the simulated MSP432
const TLV_TAG_DEVICE_INFO: u32 = 0x0B;
const TLV_TAG_FLASHCTL: u32 = 4;
const TLV_TAG_END: u32 = 0x0BD0_E11D;

impl SimTarget {
    /// Fresh target of `family` with erased flash and default options
    pub fn new(family: &FamilyDescriptor) -> Self {
        let cpuid = 0x410F_0001 | ((family.cpu_part as u32) << 4);
        let id_value = 0x1000_0000 | family.id.values.first().copied().unwrap_or(0);
        let size = family.geometry.flash_size.to_bytes() as usize;
        let (otp_base, otp_len) = family
            .geometry
            .otp
            .map(|otp| (otp.base, otp.size.to_bytes() as usize))
            .unwrap_or((0xFFFF_FFFF, 0));

        let dual = family.geometry.banks != BankMode::Single;
        let memory = Memory {
            flash_base: family.geometry.flash_base,
            flash: vec![0xFF; size],
            geometry: FlashGeometry::resolve(&family.geometry, dual),
            swapped: false,
            otp_base,
            otp: vec![0xFF; otp_len],
        };

        let model = match &family.controller {
            ControllerDef::Stm32(layout) => Model::Stm32(Stm32Model::new(
                layout.clone(),
                default_options(family),
                family.line_size,
            )),
            ControllerDef::Msp432(layout) => Model::Msp432(Msp432Model::new(*layout)),
        };

        let mut target = Self {
            family: family.clone(),
            cpuid,
            id_value,
            memory,
            model,
            tlv: Vec::new(),
            regs: HashMap::new(),
            halted: false,
            link_up: true,
            faults: Faults::default(),
            stats: SimStats::default(),
        };
        target.set_pulse_budget(Some(PulseBudget::default()));
        target.configure_memory();
        target
    }

    /// Family being simulated
    pub fn family(&self) -> &FamilyDescriptor {
        &self.family
    }

    /// Replace the injected faults
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Set an option in the stored (and active) option bytes
    ///
    /// Takes effect as if loaded at the last reset. Unknown names are
    /// ignored on controllers without option bytes.
    pub fn with_option(mut self, name: &str, value: u32) -> Self {
        if let (Model::Stm32(model), Some(def)) = (&mut self.model, self.family.option_field(name)) {
            model.force_option(def, value);
        }
        self.configure_memory();
        self
    }

    /// Pulse budget published in the TLV (`None` leaves the entry out)
    pub fn with_pulse_budget(mut self, budget: Option<PulseBudget>) -> Self {
        self.set_pulse_budget(budget);
        self
    }

    fn set_pulse_budget(&mut self, budget: Option<PulseBudget>) {
        let device_id = self.family.id.values.first().copied().unwrap_or(0);
        let mut tlv = vec![0x1234_5678, TLV_TAG_DEVICE_INFO, 4, 0x0000_0001, device_id, 0x43, 0x01];
        if let Some(budget) = budget {
            tlv.extend([
                TLV_TAG_FLASHCTL,
                4,
                0,
                0,
                budget.max_programming_pulses,
                budget.max_erase_pulses,
            ]);
        }
        tlv.push(TLV_TAG_END);
        self.tlv = tlv;
    }

    /// Active option value by name
    pub fn option(&self, name: &str) -> Option<u32> {
        match (&self.model, self.family.option_field(name)) {
            (Model::Stm32(model), Some(def)) => Some(model.current_option(def)),
            _ => None,
        }
    }

    /// Resolved geometry as the target currently presents it
    pub fn geometry(&self) -> &FlashGeometry {
        &self.memory.geometry
    }

    /// Copy `data` into flash at CPU address `addr`, bypassing the controller
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            if let Some(slot) = self.memory.byte_mut(addr + i as u32) {
                *slot = *byte;
            }
        }
    }

    /// Read flash at CPU address `addr`, bypassing the probe
    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.memory.byte(addr + i as u32).unwrap_or(0))
            .collect()
    }

    /// Raw physical contents of one bank
    pub fn physical_bank(&self, bank: u32) -> &[u8] {
        let size = self.memory.geometry.bank_size() as usize;
        let start = bank as usize * size;
        &self.memory.flash[start..start + size]
    }

    /// Whether the debug link is up
    pub fn link_up(&self) -> bool {
        self.link_up
    }

    /// Whether the core is halted
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Main-array lock state of every register set (STM32 controllers)
    pub fn locked(&self) -> bool {
        match &self.model {
            Model::Stm32(model) => model.all_locked(),
            Model::Msp432(model) => model.all_protected(),
        }
    }

    /// Recompute bank mode, swap and secure state from the active options
    fn configure_memory(&mut self) {
        let Model::Stm32(model) = &mut self.model else {
            return;
        };
        let family = &self.family;
        let read = |name: &str| {
            family
                .option_field(name)
                .map(|def| model.current_option(def) != 0)
                .unwrap_or(false)
        };

        let dual = match &family.geometry.banks {
            BankMode::Single => false,
            BankMode::Dual => true,
            BankMode::Selectable(option) => read(option),
        };
        let swapped = dual && family.swap_option.as_deref().is_some_and(read);
        let secure = match &model.layout().secure_option {
            Some(option) => read(option),
            None => false,
        };

        self.memory.geometry = FlashGeometry::resolve(&family.geometry, dual);
        self.memory.swapped = swapped;
        model.set_secure(secure);
    }

    fn reset(&mut self) {
        log::debug!("sim: target reset");
        match &mut self.model {
            Model::Stm32(model) => model.reset(),
            Model::Msp432(model) => model.reset(),
        }
        self.configure_memory();
        self.halted = false;
        self.stats.resets += 1;
        if self.faults.reset_link != ResetLink::Survives {
            self.link_up = false;
        }
    }

    fn check_link(&self) -> Result<()> {
        if self.link_up {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    fn unmapped(addr: u32) -> Error {
        Error::Transfer {
            addr,
            reason: "no memory at this address".into(),
        }
    }

    fn tlv_word(&self, addr: u32) -> Option<u32> {
        let base = match &self.model {
            Model::Msp432(model) => model.layout().tlv_base,
            Model::Stm32(_) => return None,
        };
        if addr < base || addr % 4 != 0 {
            return None;
        }
        let index = ((addr - base) / 4) as usize;
        self.tlv.get(index).copied()
    }

    pub(crate) fn read32(&mut self, addr: u32) -> Result<u32> {
        self.check_link()?;
        if addr == CPUID {
            return Ok(self.cpuid);
        }
        if addr == self.family.id.addr {
            return Ok(self.id_value);
        }
        if let Some(word) = self.tlv_word(addr) {
            return Ok(word);
        }
        if self.model.owns(addr) {
            return Ok(match &self.model {
                Model::Stm32(model) => model.read(addr, &self.faults),
                Model::Msp432(model) => model.read(addr, &self.faults),
            });
        }
        if self.memory.byte(addr).is_some() {
            let mut bytes = [0u8; 4];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = self.memory.byte(addr + i as u32).unwrap_or(0xFF);
            }
            return Ok(u32::from_le_bytes(bytes));
        }
        if let Some(value) = self.regs.get(&addr) {
            return Ok(*value);
        }
        if self.family.debug_enable.is_some_and(|d| d.addr == addr) {
            return Ok(0);
        }
        Err(Self::unmapped(addr))
    }

    pub(crate) fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.check_link()?;
        self.stats.writes += 1;

        let effect = if addr == AIRCR {
            if value == AIRCR_SYSRESETREQ {
                Effect::Reset
            } else {
                Effect::None
            }
        } else if self.model.owns(addr) {
            match &mut self.model {
                Model::Stm32(model) => {
                    model.write(addr, value, &mut self.memory, &self.faults, &mut self.stats)
                }
                Model::Msp432(model) => {
                    model.write(addr, value, &mut self.memory, &mut self.faults, &mut self.stats)
                }
            }
        } else if self.memory.byte(addr).is_some() {
            return self.write_bulk_unchecked(addr, &value.to_le_bytes());
        } else {
            let known = self.regs.contains_key(&addr)
                || self.family.debug_enable.is_some_and(|d| d.addr == addr);
            if !known {
                return Err(Self::unmapped(addr));
            }
            self.regs.insert(addr, value);
            Effect::None
        };

        if effect == Effect::Reset {
            self.reset();
            if self.faults.reset_link == ResetLink::DropsWithError {
                return Err(Error::Disconnected);
            }
        }
        Ok(())
    }

    pub(crate) fn read_bulk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check_link()?;
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr + i as u32;
            *b = match self.memory.byte(a) {
                Some(byte) => byte,
                None => {
                    let word = self.tlv_word(a & !3).ok_or_else(|| Self::unmapped(a))?;
                    word.to_le_bytes()[(a & 3) as usize]
                }
            };
        }
        Ok(())
    }

    pub(crate) fn write_bulk(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.check_link()?;
        self.stats.writes += 1;
        self.write_bulk_unchecked(addr, data)
    }

    fn write_bulk_unchecked(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let end = addr as u64 + data.len() as u64;
        let mapped = data.is_empty()
            || (self.memory.byte(addr).is_some()
                && self.memory.byte((end - 1) as u32).is_some());
        if !mapped {
            return Err(Self::unmapped(addr));
        }
        match &mut self.model {
            Model::Stm32(model) => model.program(addr, data, &mut self.memory),
            Model::Msp432(_) => Err(Error::Transfer {
                addr,
                reason: "flash is not bus-writable on this controller".into(),
            }),
        }
    }

    pub(crate) fn halt(&mut self) -> Result<()> {
        self.check_link()?;
        self.halted = true;
        Ok(())
    }

    pub(crate) fn resume(&mut self) -> Result<()> {
        self.check_link()?;
        self.halted = false;
        Ok(())
    }

    pub(crate) fn is_halted(&mut self) -> Result<bool> {
        self.check_link()?;
        Ok(self.halted)
    }

    pub(crate) fn reprobe(&mut self, _connect_under_reset: bool) -> Result<()> {
        self.stats.reprobes += 1;
        if self.faults.reprobe_failures > 0 {
            self.faults.reprobe_failures -= 1;
            return Err(Error::Disconnected);
        }
        self.link_up = true;
        Ok(())
    }

    pub(crate) fn delay(&mut self, ms: u32) {
        self.stats.delay_ms += ms as u64;
    }
}

/// Factory option bytes of the simulated parts
fn default_options(family: &FamilyDescriptor) -> Vec<u32> {
    match family.name.as_str() {
        "stm32g0" => vec![0xDFFF_E1AA],
        "stm32g4" | "stm32l4" => vec![0xFFEF_F8AA],
        "stm32wb55" => vec![0x3D7F_F1AA],
        "stm32h7" => vec![0x1C16_AAF0, 0x1FF0_0800],
        "stm32u5" => vec![0x1FEF_F8AA, 0x0800_007F, 0x0BF9_007F],
        _ => match &family.controller {
            ControllerDef::Stm32(layout) => vec![0xFFFF_FFAA; layout.options.current.len()],
            ControllerDef::Msp432(_) => Vec::new(),
        },
    }
}
