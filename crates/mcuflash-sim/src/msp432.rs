//! MSP432 FLCTL model
//!
//! Mass-erase pulses hit every sector whose write-protect bit is clear,
//! burst reads compare against all ones, and burst programs honour the
//! AUTO_PRE/AUTO_PST verify flags. Resistant sectors and weak bits from
//! [`Faults`] make pulses fail in a controlled way.

use mcuflash_core::family::Msp432Layout;

use crate::target::{Effect, Faults, Memory, SimStats};

const WINDOW: u32 = 0x100;

const RDBRST_CTLSTAT: u32 = 0x020;
const RDBRST_STARTADDR: u32 = 0x024;
const RDBRST_LEN: u32 = 0x028;
const PRGBRST_CTLSTAT: u32 = 0x054;
const PRGBRST_STARTADDR: u32 = 0x058;
const PRGBRST_DATA0_0: u32 = 0x060;
const ERASE_CTLSTAT: u32 = 0x0A0;
const BANK0_MAIN_WEPROT: u32 = 0x0B4;
const BANK1_MAIN_WEPROT: u32 = 0x0C4;

const START: u32 = 1 << 0;
const ERASE_MASS: u32 = 1 << 1;
const ERASE_CLR_STAT: u32 = 1 << 19;
const READ_DATA_CMP: u32 = 1 << 4;
const READ_CMP_ERR: u32 = 1 << 18;
const READ_CLR_STAT: u32 = 1 << 23;
const PROGRAM_AUTO_PRE: u32 = 1 << 6;
const PROGRAM_AUTO_PST: u32 = 1 << 7;
const PROGRAM_PRE_ERR: u32 = 1 << 19;
const PROGRAM_PST_ERR: u32 = 1 << 20;
const PROGRAM_ADDR_ERR: u32 = 1 << 21;
const PROGRAM_CLR_STAT: u32 = 1 << 23;

const STATUS_SHIFT: u32 = 16;
const ERASE_DONE: u32 = 3 << STATUS_SHIFT;
const READ_DONE: u32 = 3 << STATUS_SHIFT;
const PROGRAM_DONE: u32 = 7 << STATUS_SHIFT;
const STATUS_BUSY: u32 = 1 << STATUS_SHIFT;

const LINE: usize = 64;

#[derive(Debug, Clone)]
pub(crate) struct Msp432Model {
    layout: Msp432Layout,
    weprot: [u32; 2],
    erase_status: u32,
    read_start: u32,
    read_len: u32,
    read_status: u32,
    program_start: u32,
    program_data: [u32; LINE / 4],
    program_status: u32,
}

impl Msp432Model {
    pub(crate) fn new(layout: Msp432Layout) -> Self {
        let mut model = Self {
            layout,
            weprot: [u32::MAX; 2],
            erase_status: 0,
            read_start: 0,
            read_len: 0,
            read_status: 0,
            program_start: 0,
            program_data: [u32::MAX; LINE / 4],
            program_status: 0,
        };
        model.reset();
        model
    }

    pub(crate) fn layout(&self) -> &Msp432Layout {
        &self.layout
    }

    pub(crate) fn owns(&self, addr: u32) -> bool {
        addr >= self.layout.base && addr - self.layout.base < WINDOW
    }

    pub(crate) fn reset(&mut self) {
        self.weprot = [u32::MAX; 2];
        self.erase_status = 0;
        self.read_status = 0;
        self.program_status = 0;
    }

    pub(crate) fn all_protected(&self) -> bool {
        self.weprot == [u32::MAX; 2]
    }

    /// Global sector index is write-protected
    fn protected(&self, memory: &Memory, sector: u32) -> bool {
        let per_bank = memory.geometry.sectors_per_bank;
        let (bank, index) = (sector / per_bank, sector % per_bank);
        self.weprot
            .get(bank as usize)
            .map_or(true, |bits| bits & (1 << index) != 0)
    }

    pub(crate) fn read(&self, addr: u32, faults: &Faults) -> u32 {
        let offset = addr - self.layout.base;
        let busy = |status: u32| {
            if faults.wedged_busy && status != 0 {
                STATUS_BUSY
            } else {
                status
            }
        };
        match offset {
            BANK0_MAIN_WEPROT => self.weprot[0],
            BANK1_MAIN_WEPROT => self.weprot[1],
            ERASE_CTLSTAT => busy(self.erase_status),
            RDBRST_CTLSTAT => busy(self.read_status),
            RDBRST_STARTADDR => self.read_start,
            RDBRST_LEN => self.read_len,
            PRGBRST_CTLSTAT => busy(self.program_status),
            PRGBRST_STARTADDR => self.program_start,
            o if (PRGBRST_DATA0_0..PRGBRST_DATA0_0 + LINE as u32).contains(&o) => {
                self.program_data[((o - PRGBRST_DATA0_0) / 4) as usize]
            }
            _ => 0,
        }
    }

    pub(crate) fn write(
        &mut self,
        addr: u32,
        value: u32,
        memory: &mut Memory,
        faults: &mut Faults,
        stats: &mut SimStats,
    ) -> Effect {
        let offset = addr - self.layout.base;
        match offset {
            BANK0_MAIN_WEPROT => self.weprot[0] = value,
            BANK1_MAIN_WEPROT => self.weprot[1] = value,
            ERASE_CTLSTAT => {
                if value & ERASE_CLR_STAT != 0 {
                    self.erase_status = 0;
                }
                if value & START != 0 && value & ERASE_MASS != 0 {
                    self.erase_pulse(memory, faults, stats);
                }
            }
            RDBRST_STARTADDR => self.read_start = value,
            RDBRST_LEN => self.read_len = value,
            RDBRST_CTLSTAT => {
                if value & READ_CLR_STAT != 0 {
                    self.read_status = 0;
                }
                if value & START != 0 {
                    self.burst_read(value, memory);
                }
            }
            PRGBRST_STARTADDR => self.program_start = value,
            o if (PRGBRST_DATA0_0..PRGBRST_DATA0_0 + LINE as u32).contains(&o) => {
                self.program_data[((o - PRGBRST_DATA0_0) / 4) as usize] = value;
            }
            PRGBRST_CTLSTAT => {
                if value & PROGRAM_CLR_STAT != 0 {
                    self.program_status = 0;
                }
                if value & START != 0 {
                    stats.program_pulses += 1;
                    self.program_status = PROGRAM_DONE | self.burst_program(value, memory, faults);
                }
            }
            _ => {}
        }
        Effect::None
    }

    fn erase_pulse(&mut self, memory: &mut Memory, faults: &mut Faults, stats: &mut SimStats) {
        let geometry = memory.geometry;
        let mut mask = 0u64;
        for sector in 0..geometry.sector_count.min(64) {
            if self.protected(memory, sector) {
                continue;
            }
            mask |= 1 << sector;

            let base = geometry.flash_base + sector * geometry.sector_size;
            let (bank, index) = (sector / geometry.sectors_per_bank, sector % geometry.sectors_per_bank);
            memory.erase_physical(bank, index);

            if let Some(left) = faults.resistant_sectors.get_mut(&sector) {
                if *left > 0 {
                    // Incomplete erase leaves the first word programmed
                    if *left != u32::MAX {
                        *left -= 1;
                    }
                    for i in 0..4 {
                        if let Some(byte) = memory.byte_mut(base + i) {
                            *byte = 0;
                        }
                    }
                }
            }
        }
        log::debug!("sim: erase pulse on 0x{:016X}", mask);
        stats.erase_pulses.push(mask);
        self.erase_status = ERASE_DONE;
    }

    fn burst_read(&mut self, ctl: u32, memory: &Memory) {
        let expected = if ctl & READ_DATA_CMP != 0 { 0xFF } else { 0x00 };
        let mismatch = (0..self.read_len).any(|i| memory.byte(self.read_start + i) != Some(expected));
        self.read_status = READ_DONE | if mismatch { READ_CMP_ERR } else { 0 };
    }

    /// Returns the error flags of one burst
    fn burst_program(&mut self, ctl: u32, memory: &mut Memory, faults: &mut Faults) -> u32 {
        let addr = self.program_start;
        let sector = memory.geometry.sector_at(addr);
        let writable = sector.is_some_and(|s| !self.protected(memory, s));
        if addr as usize % LINE != 0 || !writable {
            return PROGRAM_ADDR_ERR;
        }
        if faults.program_always_fails {
            return PROGRAM_PST_ERR;
        }

        let data: Vec<u8> = self.program_data.iter().flat_map(|w| w.to_le_bytes()).collect();
        if faults.double_verify_errors > 0 {
            faults.double_verify_errors -= 1;
            drive(addr, &data, memory, faults);
            return PROGRAM_PRE_ERR | PROGRAM_PST_ERR;
        }

        let existing: Vec<u8> = (0..LINE as u32)
            .map(|i| memory.byte(addr + i).unwrap_or(0xFF))
            .collect();

        // Pre-verify: a bit to program is already zero
        if ctl & PROGRAM_AUTO_PRE != 0 && existing.iter().zip(&data).any(|(e, d)| !e & !d != 0) {
            return PROGRAM_PRE_ERR;
        }

        drive(addr, &data, memory, faults);

        // Post-verify: a bit to program is still one
        let failed = (0..LINE as u32)
            .zip(&data)
            .any(|(i, d)| memory.byte(addr + i).unwrap_or(0xFF) & !d != 0);
        if ctl & PROGRAM_AUTO_PST != 0 && failed {
            return PROGRAM_PST_ERR;
        }
        0
    }
}

/// Clear the bits `data` drives to zero, except weak bits still holding out
fn drive(addr: u32, data: &[u8], memory: &mut Memory, faults: &mut Faults) {
    for (i, want) in data.iter().enumerate() {
        let a = addr + i as u32;
        let mut driven = *want;
        for weak in faults.weak_bits.iter_mut().filter(|w| w.addr == a && w.pulses > 0) {
            driven |= weak.mask;
            weak.pulses -= 1;
        }
        if let Some(byte) = memory.byte_mut(a) {
            *byte &= driven;
        }
    }
}
