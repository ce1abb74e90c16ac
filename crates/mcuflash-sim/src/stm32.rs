//! STM32-style controller model
//!
//! Driven entirely by the family's [`Stm32Layout`]: key sequences, lock
//! bits, sector erase, PG-gated bus programming and option staging behave
//! the same way for every layout in the database.

use std::collections::HashMap;

use mcuflash_core::error::Result;
use mcuflash_core::family::{BankRegs, OptionFieldDef, ResetMethod, Stm32Layout};
use mcuflash_core::register::Field;

use crate::target::{Effect, Faults, Memory, SimStats};

/// Size of the register window claimed by the controller
const WINDOW: u32 = 0x200;

/// One register set and where it sits
#[derive(Debug, Clone, Copy)]
struct Set {
    regs: BankRegs,
    index: usize,
    secure: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Stm32Model {
    layout: Stm32Layout,
    line_size: u32,
    regs: HashMap<u32, u32>,
    key_stage: HashMap<u32, usize>,
    current: Vec<u32>,
    program: Vec<u32>,
    stored: Vec<u32>,
    secure: bool,
}

impl Stm32Model {
    pub(crate) fn new(layout: Stm32Layout, options: Vec<u32>, line_size: u32) -> Self {
        let mut model = Self {
            layout,
            line_size,
            regs: HashMap::new(),
            key_stage: HashMap::new(),
            current: Vec::new(),
            program: Vec::new(),
            stored: options,
            secure: false,
        };
        model.reset();
        model
    }

    pub(crate) fn layout(&self) -> &Stm32Layout {
        &self.layout
    }

    pub(crate) fn owns(&self, addr: u32) -> bool {
        addr >= self.layout.base && addr - self.layout.base < WINDOW
    }

    pub(crate) fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Load stored options and relock everything
    pub(crate) fn reset(&mut self) {
        self.current = self.stored.clone();
        self.program = self.stored.clone();
        self.key_stage.clear();
        self.regs.clear();

        let lock = 1u32 << self.layout.control.lock;
        let option_lock = self.layout.options.lock;
        for set in self.sets() {
            self.regs.insert(set.regs.cr, lock);
            self.regs.insert(set.regs.sr, 0);
        }
        let value = self.reg(option_lock.offset);
        self.regs
            .insert(option_lock.offset, option_lock.insert(value, 1));
    }

    pub(crate) fn force_option(&mut self, def: &OptionFieldDef, value: u32) {
        let field = Field::new(0, def.shift, def.width);
        for bank in [&mut self.stored, &mut self.current, &mut self.program] {
            if let Some(word) = bank.get_mut(def.register) {
                *word = field.insert(*word, value);
            }
        }
    }

    pub(crate) fn current_option(&self, def: &OptionFieldDef) -> u32 {
        let word = self.current.get(def.register).copied().unwrap_or(0);
        Field::new(0, def.shift, def.width).extract(word)
    }

    pub(crate) fn all_locked(&self) -> bool {
        self.sets().iter().all(|set| self.main_locked(&set.regs)) && !self.options_unlocked()
    }

    fn sets(&self) -> Vec<Set> {
        let normal = self.layout.banks.iter().enumerate().map(|(index, regs)| Set {
            regs: *regs,
            index,
            secure: false,
        });
        let secure = self
            .layout
            .secure_banks
            .iter()
            .flatten()
            .enumerate()
            .map(|(index, regs)| Set {
                regs: *regs,
                index,
                secure: true,
            });
        normal.chain(secure).collect()
    }

    fn active_group(&self) -> &[BankRegs] {
        match (&self.layout.secure_banks, self.secure) {
            (Some(secure), true) => secure,
            _ => &self.layout.banks,
        }
    }

    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn main_locked(&self, regs: &BankRegs) -> bool {
        self.reg(regs.cr) & (1 << self.layout.control.lock) != 0
    }

    fn options_unlocked(&self) -> bool {
        let lock = self.layout.options.lock;
        lock.extract(self.reg(lock.offset)) == 0
    }

    fn flag_error(&mut self, sr: u32) {
        let errors = self.layout.status.errors;
        let bit = errors & errors.wrapping_neg();
        let value = self.reg(sr) | bit;
        self.regs.insert(sr, value);
    }

    fn is_sr(&self, offset: u32) -> bool {
        self.sets().iter().any(|set| set.regs.sr == offset)
    }

    /// Advance a two-word key sequence; true once both keys arrived in order
    fn key(&mut self, keyr: u32, value: u32, keys: (u32, u32), faults: &Faults) -> bool {
        let stage = self.key_stage.get(&keyr).copied().unwrap_or(0);
        let accepted = !faults.wrong_keys;
        let next = match stage {
            0 if accepted && value == keys.0 => 1,
            1 if accepted && value == keys.1 => 2,
            _ => 0,
        };
        if next == 2 {
            self.key_stage.insert(keyr, 0);
            true
        } else {
            self.key_stage.insert(keyr, next);
            false
        }
    }

    pub(crate) fn read(&self, addr: u32, faults: &Faults) -> u32 {
        let offset = addr - self.layout.base;
        let options = &self.layout.options;

        if let Some(i) = options.program.iter().position(|&o| o == offset) {
            return self.program[i];
        }
        if let Some(i) = options.current.iter().position(|&o| o == offset) {
            let mut value = self.current[i];
            if options.busy.offset == offset {
                value &= !options.busy.mask();
            }
            if options.errors.offset == offset {
                value &= !options.errors.mask;
            }
            return value;
        }

        let mut value = self.reg(offset);
        if faults.wedged_busy && self.is_sr(offset) {
            value |= self.layout.status.busy;
        }
        value
    }

    pub(crate) fn write(
        &mut self,
        addr: u32,
        value: u32,
        memory: &mut Memory,
        faults: &Faults,
        stats: &mut SimStats,
    ) -> Effect {
        let offset = addr - self.layout.base;
        let sets = self.sets();
        let keys = (self.layout.keys.0, self.layout.keys.1);
        let options = self.layout.options.clone();

        if let Some(set) = sets.iter().find(|s| s.regs.keyr == offset) {
            if self.key(offset, value, keys, faults) {
                let cr = self.reg(set.regs.cr) & !(1 << self.layout.control.lock);
                self.regs.insert(set.regs.cr, cr);
            }
            return Effect::None;
        }

        if offset == options.keyr {
            let option_keys = (options.keys.0, options.keys.1);
            if self.key(offset, value, option_keys, faults) {
                let main_locked = self
                    .layout
                    .option_parent()
                    .is_some_and(|regs| self.main_locked(&regs));
                if !options.nested || !main_locked {
                    let v = options.lock.insert(self.reg(options.lock.offset), 0);
                    self.regs.insert(options.lock.offset, v);
                }
            }
            return Effect::None;
        }

        for set in &sets {
            let clears = offset == set.regs.sr || Some(offset) == set.regs.ccr;
            if clears {
                let sr = self.reg(set.regs.sr) & !(value & self.layout.status.errors);
                self.regs.insert(set.regs.sr, sr);
                return Effect::None;
            }
        }

        if let Some(i) = options.program.iter().position(|&o| o == offset) {
            if self.options_unlocked() {
                self.program[i] = value;
            }
            return Effect::None;
        }
        if options.current.contains(&offset) {
            return Effect::None;
        }

        let set = sets.iter().find(|s| s.regs.cr == offset).copied();
        let launch = match options.reset {
            ResetMethod::ObLaunch(field) => Some(field),
            ResetMethod::SystemReset => None,
        };
        let is_control = set.is_some()
            || offset == options.lock.offset
            || offset == options.start.offset
            || launch.is_some_and(|f| f.offset == offset);
        if !is_control {
            self.regs.insert(offset, value);
            return Effect::None;
        }

        self.write_control(offset, value, set, memory, stats)
    }

    fn write_control(
        &mut self,
        offset: u32,
        value: u32,
        set: Option<Set>,
        memory: &mut Memory,
        stats: &mut SimStats,
    ) -> Effect {
        let control = self.layout.control;
        let options = self.layout.options.clone();
        let launch = match options.reset {
            ResetMethod::ObLaunch(field) => Some(field),
            ResetMethod::SystemReset => None,
        };

        let mut lock_bits = 0;
        if set.is_some() {
            lock_bits |= 1 << control.lock;
        }
        if options.lock.offset == offset {
            lock_bits |= options.lock.mask();
        }

        let old = self.reg(offset);
        // A locked control register only accepts setting its lock bits
        let writable = match set {
            Some(set) if self.main_locked(&set.regs) => lock_bits,
            _ => u32::MAX,
        };
        let mut new = (old & !writable) | (value & writable) | (old & lock_bits);

        if let Some(set) = set {
            if new & (1 << control.start) != 0 {
                new &= !(1 << control.start);
                if new & (1 << control.erase) != 0 {
                    self.regs.insert(offset, new);
                    self.erase(set, new, memory, stats);
                }
            }
        }

        if options.start.offset == offset && options.start.extract(new) != 0 {
            new = options.start.insert(new, 0);
            if self.options_unlocked() {
                log::debug!("sim: option bytes programmed {:08X?}", self.program);
                self.stored = self.program.clone();
                stats.option_commits += 1;
            }
        }

        let mut effect = Effect::None;
        if let Some(field) = launch.filter(|f| f.offset == offset) {
            if field.extract(new) != 0 {
                new = field.insert(new, 0);
                if self.options_unlocked() {
                    effect = Effect::Reset;
                }
            }
        }

        self.regs.insert(offset, new);
        effect
    }

    fn erase(&mut self, set: Set, cr: u32, memory: &mut Memory, stats: &mut SimStats) {
        let control = self.layout.control;
        let group_len = self.active_group().len();
        let geometry = memory.geometry;

        let bank = if group_len > 1 {
            set.index as u32
        } else {
            match control.bank_select {
                Some(bit) if geometry.banks > 1 => (cr >> bit) & 1,
                _ => 0,
            }
        };
        let index = Field::new(0, control.sector.0, control.sector.1).extract(cr);

        if set.secure != self.secure || index >= geometry.sectors_per_bank {
            log::debug!("sim: rejected erase of bank {} sector {}", bank, index);
            self.flag_error(set.regs.sr);
            return;
        }
        memory.erase_physical(bank, index);
        stats.sector_erases.push((bank, index));
    }

    /// Bus write into flash or OTP
    pub(crate) fn program(&mut self, addr: u32, data: &[u8], memory: &mut Memory) -> Result<()> {
        let group = self.active_group();
        let regs = if memory.otp_offset(addr).is_some() || group.len() == 1 {
            group[0]
        } else {
            group[memory.physical_bank(addr) as usize % group.len()]
        };

        let cr = self.reg(regs.cr);
        let armed = cr & (1 << self.layout.control.lock) == 0 && cr & (1 << self.layout.control.pg) != 0;
        let line = self.line_size as usize;
        if !armed || addr as usize % line != 0 || data.len() % line != 0 {
            log::debug!("sim: rejected program of {} bytes at 0x{:08X}", data.len(), addr);
            self.flag_error(regs.sr);
            return Ok(());
        }

        for (i, chunk) in data.chunks(line).enumerate() {
            if chunk.iter().all(|&b| b == 0xFF) {
                continue;
            }
            let start = addr + (i * line) as u32;
            let erased = (0..line as u32).all(|j| memory.byte(start + j) == Some(0xFF));
            if !erased {
                self.flag_error(regs.sr);
                continue;
            }
            for (j, byte) in chunk.iter().enumerate() {
                if let Some(slot) = memory.byte_mut(start + j as u32) {
                    *slot &= *byte;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimProbe, SimTarget};
    use mcuflash_core::config::EngineConfig;
    use mcuflash_core::error::Error;
    use mcuflash_core::family::FamilyDatabase;
    use mcuflash_core::flash::{FlashDevice, FlashVariant, NoProgress};
    use mcuflash_core::flash::FlashHandle;

    fn attach(target: SimTarget) -> (SimProbe, FlashDevice) {
        let family = target.family().clone();
        let mut probe = SimProbe::new(target);
        let device = FlashDevice::probe(&mut probe, &family, &EngineConfig::default()).unwrap();
        (probe, device)
    }

    fn target(name: &str) -> SimTarget {
        let db = FamilyDatabase::builtin().unwrap();
        SimTarget::new(db.find(name).unwrap())
    }

    #[test]
    fn test_erase_is_idempotent() {
        let (mut probe, device) = attach(target("stm32g4"));
        probe.with_target(|t| t.load(0x0800_0800, &[0u8; 64]));

        device.erase_sector(&mut probe, 1).unwrap();
        let once = probe.with_target(|t| t.peek(0x0800_0000, 0x2000));
        device.erase_sector(&mut probe, 1).unwrap();
        let twice = probe.with_target(|t| t.peek(0x0800_0000, 0x2000));

        assert_eq!(once, twice);
        assert!(once.iter().all(|&b| b == 0xFF));
        assert!(probe.with_target(|t| t.locked()));
    }

    #[test]
    fn test_every_sector_reads_erased() {
        let (mut probe, device) = attach(target("stm32g0"));
        let size = device.geometry().size() as usize;
        probe.with_target(|t| t.load(0x0800_0000, &vec![0x5A; size]));

        for sector in 0..device.geometry().sector_count {
            device.erase_sector(&mut probe, sector).unwrap();
            let base = device.geometry().sector_base(sector).unwrap();
            let len = device.geometry().sector_size as usize;
            let data = probe.with_target(|t| t.peek(base, len));
            assert!(data.iter().all(|&b| b == 0xFF), "sector {}", sector);
        }
    }

    #[test]
    fn test_program_round_trip() {
        let (mut probe, device) = attach(target("stm32l4"));
        let data: Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();

        device.program(&mut probe, 0x0800_1000, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        let mut observer = NoProgress;
        FlashHandle::new(&mut probe, &device, &mut observer)
            .read(0x0800_1000, &mut back)
            .unwrap();
        assert_eq!(back, data);
        assert!(probe.with_target(|t| t.locked()));
    }

    #[test]
    fn test_program_over_data_reports_controller_error() {
        let (mut probe, device) = attach(target("stm32l4"));
        probe.with_target(|t| t.load(0x0800_0000, &[0u8; 8]));

        let err = device.program(&mut probe, 0x0800_0000, &[0x11; 8]).unwrap_err();
        assert!(matches!(err, Error::Controller { .. }));
        // Error path still relocks
        assert!(probe.with_target(|t| t.locked()));
    }

    #[test]
    fn test_unaligned_program_rejected() {
        let (mut probe, device) = attach(target("stm32g4"));
        let err = device.program(&mut probe, 0x0800_0004, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, Error::Alignment { line: 8, .. }));
        let err = device.program(&mut probe, 0x0800_0000, &[0u8; 12]).unwrap_err();
        assert!(matches!(err, Error::Alignment { .. }));
        assert_eq!(probe.with_target(|t| t.stats.writes), 0);
    }

    #[test]
    fn test_wrong_keys() {
        let mut sim = target("stm32g4");
        sim.faults.wrong_keys = true;
        let (mut probe, device) = attach(sim);

        let err = device.erase_sector(&mut probe, 0).unwrap_err();
        assert!(matches!(err, Error::UnlockFailed { register: "flash", .. }));
        assert!(probe.with_target(|t| t.stats.sector_erases.is_empty()));
    }

    #[test]
    fn test_controller_timeout() {
        let mut sim = target("stm32g4");
        sim.faults.wedged_busy = true;
        let family = sim.family().clone();
        let mut probe = SimProbe::new(sim);
        let config = EngineConfig {
            poll_timeout_ms: 20,
            ..EngineConfig::default()
        };
        let device = FlashDevice::probe(&mut probe, &family, &config).unwrap();

        let err = device.erase_sector(&mut probe, 0).unwrap_err();
        assert!(matches!(err, Error::ControllerTimeout { timeout_ms: 20, .. }));
        assert!(probe.with_target(|t| t.locked()));
    }

    #[test]
    fn test_g4_bank_mode_sector_size() {
        let (_, dual) = attach(target("stm32g4"));
        assert_eq!(dual.geometry().sector_size, 2048);
        assert_eq!(dual.geometry().banks, 2);
        assert_eq!(dual.variant(), FlashVariant::DualBank { swapped: false });

        let (_, single) = attach(target("stm32g4").with_option("dbank", 0));
        assert_eq!(single.geometry().sector_size, 4096);
        assert_eq!(single.geometry().banks, 1);
        assert_eq!(single.variant(), FlashVariant::SingleBank);
        assert!(single.swap_option().is_none());
    }

    #[test]
    fn test_dual_bank_erase_routing() {
        // Sector 128 is the first sector of logical bank 1
        let (mut probe, device) = attach(target("stm32g4"));
        device.erase_sector(&mut probe, 128).unwrap();
        assert_eq!(probe.with_target(|t| t.stats.sector_erases.clone()), vec![(1, 0)]);

        let (mut probe, device) = attach(target("stm32g4").with_option("bfb2", 1));
        assert_eq!(device.variant(), FlashVariant::DualBank { swapped: true });
        device.erase_sector(&mut probe, 128).unwrap();
        assert_eq!(probe.with_target(|t| t.stats.sector_erases.clone()), vec![(0, 0)]);
    }

    #[test]
    fn test_h7_per_bank_register_sets() {
        let (mut probe, device) = attach(target("stm32h7"));
        let bank_size = device.geometry().bank_size();

        // One write spanning the bank boundary uses both register sets
        let addr = 0x0800_0000 + bank_size - 32;
        let data = [0x42u8; 64];
        device.program(&mut probe, addr, &data).unwrap();
        let back = probe.with_target(|t| t.peek(addr, 64));
        assert_eq!(back, data);
        assert_eq!(probe.with_target(|t| t.physical_bank(1)[0]), 0x42);

        device.erase_sector(&mut probe, 8).unwrap();
        assert_eq!(probe.with_target(|t| t.stats.sector_erases.clone()), vec![(1, 0)]);
        assert!(probe.with_target(|t| t.locked()));
    }

    #[test]
    fn test_h7_swapped_program_lands_in_other_bank() {
        let (mut probe, device) = attach(target("stm32h7").with_option("swap_bank_opt", 1));
        device.program(&mut probe, 0x0800_0000, &[0x24; 32]).unwrap();
        assert_eq!(probe.with_target(|t| t.physical_bank(1)[0]), 0x24);
        assert_eq!(probe.with_target(|t| t.physical_bank(0)[0]), 0xFF);
    }

    #[test]
    fn test_u5_secure_register_set() {
        let (mut probe, device) = attach(target("stm32u5").with_option("tzen", 1));
        assert_eq!(
            device.variant(),
            FlashVariant::SecureSplit {
                secure: true,
                swapped: false
            }
        );
        device.erase_sector(&mut probe, 3).unwrap();
        device.program(&mut probe, 0x0800_6000, &[0x99; 16]).unwrap();
        assert_eq!(probe.with_target(|t| t.peek(0x0800_6000, 1)), vec![0x99]);
        assert!(probe.with_target(|t| t.locked()));

        // Non-secure set is refused while TZEN is set
        let (mut probe, device) = attach(target("stm32u5"));
        probe.with_target(|t| {
            *t = t.clone().with_option("tzen", 1);
        });
        let err = device.erase_sector(&mut probe, 3).unwrap_err();
        assert!(matches!(err, Error::Controller { .. }));
    }

    #[test]
    fn test_otp_program_once() {
        let (mut probe, device) = attach(target("stm32g4"));
        let mut observer = NoProgress;
        let mut flash = FlashHandle::new(&mut probe, &device, &mut observer);

        flash.program(0x1FFF_7000, &[0x12; 8]).unwrap();
        let err = flash.program(0x1FFF_7000, &[0x34; 8]).unwrap_err();
        assert!(matches!(err, Error::OtpProgrammed { addr: 0x1FFF_7000 }));
        let err = flash.erase_range(0x1FFF_7000, 8).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        // Other lines are still writable
        flash.program(0x1FFF_7008, &[0x56; 8]).unwrap();
        assert_eq!(probe.with_target(|t| t.peek(0x1FFF_7000, 16)), [[0x12; 8], [0x56; 8]].concat());
    }

    #[test]
    fn test_option_keys_need_nonsecure_unlock() {
        use mcuflash_core::family::{FLASH_KEYS, OPTION_KEYS};
        use mcuflash_core::probe::DebugProbe;

        let (mut probe, _) = attach(target("stm32u5").with_option("tzen", 1));
        let (nskeyr, seckeyr, optkeyr, nscr) = (0x4002_2008, 0x4002_200C, 0x4002_2010, 0x4002_2028);
        let opt_locked = |probe: &mut SimProbe| probe.read32(nscr).unwrap() & (1 << 30) != 0;

        // Only the secure set is unlocked: the option keys are ignored
        probe.write32(seckeyr, FLASH_KEYS.0).unwrap();
        probe.write32(seckeyr, FLASH_KEYS.1).unwrap();
        probe.write32(optkeyr, OPTION_KEYS.0).unwrap();
        probe.write32(optkeyr, OPTION_KEYS.1).unwrap();
        assert!(opt_locked(&mut probe));

        // Option start into the locked NSCR does nothing
        let cr = probe.read32(nscr).unwrap();
        probe.write32(nscr, cr | (1 << 17)).unwrap();
        assert_eq!(probe.with_target(|t| t.stats.option_commits), 0);

        probe.write32(nskeyr, FLASH_KEYS.0).unwrap();
        probe.write32(nskeyr, FLASH_KEYS.1).unwrap();
        probe.write32(optkeyr, OPTION_KEYS.0).unwrap();
        probe.write32(optkeyr, OPTION_KEYS.1).unwrap();
        assert!(!opt_locked(&mut probe));
    }
}
