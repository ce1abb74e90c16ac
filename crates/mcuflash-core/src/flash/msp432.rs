//! Pulse-and-verify controller (MSP432 FLCTL)
//!
//! Erase works on a 64-bit sector mask: unprotect exactly the masked
//! sectors, fire one mass-erase pulse, then burst-verify each masked sector
//! against all ones and drop the ones that passed. Programming is a 64-byte
//! burst with hardware pre- and post-verify; failing bits are patched out of
//! the data and the line is re-driven, up to the pulse budget read from the
//! device TLV.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::family::Msp432Layout;
use crate::probe::DebugProbe;
use crate::register::{Field, Registers};

use super::geometry::FlashGeometry;
use super::poll::{self, Timing};

// FLCTL register offsets
const RDBRST_CTLSTAT: u32 = 0x020;
const RDBRST_STARTADDR: u32 = 0x024;
const RDBRST_LEN: u32 = 0x028;
const PRGBRST_CTLSTAT: u32 = 0x054;
const PRGBRST_STARTADDR: u32 = 0x058;
const PRGBRST_DATA0_0: u32 = 0x060;
const ERASE_CTLSTAT: u32 = 0x0A0;
const BANK0_MAIN_WEPROT: u32 = 0x0B4;
const BANK1_MAIN_WEPROT: u32 = 0x0C4;

const ERASE_STATUS: Field = Field::new(ERASE_CTLSTAT, 16, 2);
const ERASE_DONE: u32 = 3;
const PROGRAM_STATUS: Field = Field::new(PRGBRST_CTLSTAT, 16, 3);
const PROGRAM_DONE: u32 = 7;
const PROGRAM_LEN: Field = Field::new(PRGBRST_CTLSTAT, 3, 3);
const READ_STATUS: Field = Field::new(RDBRST_CTLSTAT, 16, 2);
const READ_DONE: u32 = 3;

/// Burst program line in bytes (four 128-bit words)
pub const BURST_LEN: usize = 64;

// Device descriptor (TLV)
const TLV_TAG_FLASHCTL: u32 = 4;
const TLV_TAG_END: u32 = 0x0BD0_E11D;
const TLV_MAX_ENTRIES: usize = 32;

bitflags! {
    /// ERASE_CTLSTAT bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EraseCtl: u32 {
        /// Start the erase
        const START = 1 << 0;
        /// Mass erase (all unprotected sectors) instead of one sector
        const MODE_MASS = 1 << 1;
        /// Erase was issued to an invalid address
        const ADDR_ERR = 1 << 18;
        /// Clear status
        const CLR_STAT = 1 << 19;
    }
}

bitflags! {
    /// PRGBRST_CTLSTAT bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProgramCtl: u32 {
        /// Start the burst
        const START = 1 << 0;
        /// Verify the destination before programming
        const AUTO_PRE = 1 << 6;
        /// Verify the destination after programming
        const AUTO_PST = 1 << 7;
        /// Pre-program verify failed
        const PRE_ERR = 1 << 19;
        /// Post-program verify failed
        const PST_ERR = 1 << 20;
        /// Burst was issued to an invalid address
        const ADDR_ERR = 1 << 21;
        /// Clear status
        const CLR_STAT = 1 << 23;
    }
}

bitflags! {
    /// RDBRST_CTLSTAT bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadCtl: u32 {
        /// Start the burst read
        const START = 1 << 0;
        /// Stop at the first mismatch
        const STOP_FAIL = 1 << 3;
        /// Compare against all ones (all zeros when clear)
        const DATA_CMP = 1 << 4;
        /// Some word did not match
        const CMP_ERR = 1 << 18;
        /// Clear status
        const CLR_STAT = 1 << 23;
    }
}

/// Retry limits of a pulse-verify controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseBudget {
    /// Program pulses per burst line
    pub max_programming_pulses: u32,
    /// Erase pulses per erase request
    pub max_erase_pulses: u32,
}

impl Default for PulseBudget {
    fn default() -> Self {
        Self {
            max_programming_pulses: 5,
            max_erase_pulses: 50,
        }
    }
}

impl PulseBudget {
    /// Read the budget from the device descriptor
    ///
    /// Falls back to the defaults when the FLASHCTL entry is missing.
    pub fn read<P: DebugProbe + ?Sized>(probe: &mut P, tlv_base: u32) -> Result<Self> {
        // First word is the checksum
        let mut addr = tlv_base + 4;
        for _ in 0..TLV_MAX_ENTRIES {
            let tag = probe.read32(addr)?;
            if tag == TLV_TAG_END || tag == 0xFFFF_FFFF {
                break;
            }
            let len = probe.read32(addr + 4)?;
            if tag == TLV_TAG_FLASHCTL && len >= 4 {
                let budget = Self {
                    max_programming_pulses: probe.read32(addr + 8 + 2 * 4)?,
                    max_erase_pulses: probe.read32(addr + 8 + 3 * 4)?,
                };
                log::debug!(
                    "TLV pulse budget: {} program, {} erase",
                    budget.max_programming_pulses,
                    budget.max_erase_pulses
                );
                return Ok(budget);
            }
            // Room for the next header and the FLASHCTL words
            let next = len
                .checked_mul(4)
                .and_then(|n| n.checked_add(8))
                .and_then(|n| addr.checked_add(n))
                .filter(|&next| next <= u32::MAX - 0x20);
            match next {
                Some(next) => addr = next,
                None => {
                    log::warn!("Device descriptor entry at 0x{:08X} has bad length {}", addr, len);
                    break;
                }
            }
        }

        let budget = Self::default();
        log::warn!(
            "No FLASHCTL entry in device descriptor, using {} program / {} erase pulses",
            budget.max_programming_pulses,
            budget.max_erase_pulses
        );
        Ok(budget)
    }
}

/// Restores full write protection on every exit path
struct ProtectGuard<'a, P: DebugProbe + ?Sized> {
    regs: Registers<'a, P>,
    armed: bool,
}

impl<'a, P: DebugProbe + ?Sized> ProtectGuard<'a, P> {
    fn new(probe: &'a mut P, base: u32) -> Self {
        Self {
            regs: Registers::new(probe, base),
            armed: true,
        }
    }

    fn protect_all(&mut self) -> Result<()> {
        self.regs.write(BANK0_MAIN_WEPROT, u32::MAX)?;
        self.regs.write(BANK1_MAIN_WEPROT, u32::MAX)
    }

    /// Restore protection now and report failures
    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.protect_all()
    }
}

impl<P: DebugProbe + ?Sized> Drop for ProtectGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.protect_all() {
                log::warn!("Failed to restore flash write protection: {}", e);
            }
        }
    }
}

/// One FLCTL instance as configured at attach
pub(crate) struct Msp432Engine<'d> {
    pub(crate) layout: &'d Msp432Layout,
    pub(crate) geometry: &'d FlashGeometry,
    pub(crate) budget: PulseBudget,
    pub(crate) timing: Timing,
}

impl Msp432Engine<'_> {
    /// Erase every sector in `mask` (bit i = sector i)
    pub(crate) fn erase_sectors<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        mask: u64,
    ) -> Result<()> {
        self.geometry.check_mask(mask)?;
        let mut remaining = mask;
        let mut pulses = 0;

        let mut guard = ProtectGuard::new(probe, self.layout.base);
        while remaining != 0 {
            if pulses == self.budget.max_erase_pulses {
                log::error!(
                    "Sectors 0x{:016X} not erased after {} pulses",
                    remaining,
                    pulses
                );
                return Err(Error::Erase {
                    mask: remaining,
                    pulses,
                });
            }

            self.unprotect(&mut guard.regs, remaining)?;
            self.erase_pulse(&mut guard.regs)?;
            pulses += 1;

            for sector in 0..self.geometry.sector_count.min(64) {
                if remaining & (1 << sector) != 0 && self.verify_erased(&mut guard.regs, sector)? {
                    remaining &= !(1 << sector);
                }
            }
            log::debug!(
                "Erase pulse {}: 0x{:016X} still unverified",
                pulses,
                remaining
            );
        }
        guard.release()
    }

    /// Write-protect everything except the sectors in `mask`
    fn unprotect<P: DebugProbe + ?Sized>(&self, regs: &mut Registers<'_, P>, mask: u64) -> Result<()> {
        let per_bank = self.geometry.sectors_per_bank;
        let bank_mask = if per_bank >= 64 {
            u64::MAX
        } else {
            (1u64 << per_bank) - 1
        };
        let bank0 = (mask & bank_mask) as u32;
        let bank1 = if self.geometry.banks > 1 {
            ((mask >> per_bank) & bank_mask) as u32
        } else {
            0
        };
        regs.write(BANK0_MAIN_WEPROT, !bank0)?;
        regs.write(BANK1_MAIN_WEPROT, !bank1)
    }

    fn erase_pulse<P: DebugProbe + ?Sized>(&self, regs: &mut Registers<'_, P>) -> Result<()> {
        let base = regs.base();
        regs.write(ERASE_CTLSTAT, EraseCtl::CLR_STAT.bits())?;
        regs.write(ERASE_CTLSTAT, (EraseCtl::MODE_MASS | EraseCtl::START).bits())?;

        let status = poll::wait_for(regs.probe(), base + ERASE_CTLSTAT, self.timing, |v| {
            ERASE_STATUS.extract(v) == ERASE_DONE
        })?;
        regs.write(ERASE_CTLSTAT, EraseCtl::CLR_STAT.bits())?;

        if EraseCtl::from_bits_truncate(status).contains(EraseCtl::ADDR_ERR) {
            return Err(Error::Controller { status });
        }
        Ok(())
    }

    /// Hardware burst-read compare of one sector against all ones
    fn verify_erased<P: DebugProbe + ?Sized>(
        &self,
        regs: &mut Registers<'_, P>,
        sector: u32,
    ) -> Result<bool> {
        let base = regs.base();
        let start = self.geometry.sector_base(sector)?;

        regs.write(RDBRST_CTLSTAT, ReadCtl::CLR_STAT.bits())?;
        regs.write(RDBRST_STARTADDR, start)?;
        regs.write(RDBRST_LEN, self.geometry.sector_size)?;
        regs.write(
            RDBRST_CTLSTAT,
            (ReadCtl::START | ReadCtl::STOP_FAIL | ReadCtl::DATA_CMP).bits(),
        )?;

        let status = poll::wait_for(regs.probe(), base + RDBRST_CTLSTAT, self.timing.spin(), |v| {
            READ_STATUS.extract(v) == READ_DONE
        })?;
        regs.write(RDBRST_CTLSTAT, ReadCtl::CLR_STAT.bits())?;

        let erased = !ReadCtl::from_bits_truncate(status).contains(ReadCtl::CMP_ERR);
        log::trace!("Sector {} verify: {}", sector, if erased { "erased" } else { "dirty" });
        Ok(erased)
    }

    /// Program whole burst lines starting at `addr`
    pub(crate) fn program<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        let mask = self
            .geometry
            .sectors_touched(addr, data.len())?
            .fold(0u64, |m, s| m | (1 << s));
        let mut guard = ProtectGuard::new(probe, self.layout.base);
        self.unprotect(&mut guard.regs, mask)?;

        for (i, line) in data.chunks(BURST_LEN).enumerate() {
            if line.iter().all(|&b| b == 0xFF) {
                continue;
            }
            self.program_line(&mut guard.regs, addr + (i * BURST_LEN) as u32, line)?;
        }
        guard.release()
    }

    /// Burst-program one line, patching out failing bits between pulses
    fn program_line<P: DebugProbe + ?Sized>(
        &self,
        regs: &mut Registers<'_, P>,
        addr: u32,
        line: &[u8],
    ) -> Result<()> {
        let base = regs.base();
        let mut data = words(line);
        let mut pre_verify = true;
        let mut status = 0;

        for pulse in 1..=self.budget.max_programming_pulses {
            regs.write(PRGBRST_CTLSTAT, ProgramCtl::CLR_STAT.bits())?;
            regs.write(PRGBRST_STARTADDR, addr)?;
            for (i, word) in data.iter().enumerate() {
                regs.write(PRGBRST_DATA0_0 + 4 * i as u32, *word)?;
            }

            let mut ctl = ProgramCtl::START | ProgramCtl::AUTO_PST;
            if pre_verify {
                ctl |= ProgramCtl::AUTO_PRE;
            }
            regs.write(PRGBRST_CTLSTAT, PROGRAM_LEN.insert(ctl.bits(), 4))?;

            status = poll::wait_for(
                regs.probe(),
                base + PRGBRST_CTLSTAT,
                self.timing.spin(),
                |v| PROGRAM_STATUS.extract(v) == PROGRAM_DONE,
            )?;
            regs.write(PRGBRST_CTLSTAT, ProgramCtl::CLR_STAT.bits())?;

            let flags = ProgramCtl::from_bits_truncate(status);
            if flags.contains(ProgramCtl::ADDR_ERR) {
                return Err(Error::Write {
                    addr,
                    pulses: pulse,
                    status,
                });
            }
            if !flags.intersects(ProgramCtl::PRE_ERR | ProgramCtl::PST_ERR) {
                if pulse > 1 {
                    log::debug!("Line 0x{:08X} programmed after {} pulses", addr, pulse);
                }
                return Ok(());
            }

            if flags.contains(ProgramCtl::PRE_ERR) {
                // Bits already programmed: stop driving them
                let existing = read_line(regs.probe(), addr)?;
                for (d, e) in data.iter_mut().zip(existing) {
                    *d |= !(e | *d);
                }
                pre_verify = false;
                log::debug!("Pre-verify error at 0x{:08X}, pulse {}", addr, pulse);
            }
            if flags.contains(ProgramCtl::PST_ERR) {
                // Re-drive only the bits that are still one
                let actual = read_line(regs.probe(), addr)?;
                for (d, a) in data.iter_mut().zip(actual) {
                    *d = !(!*d & a);
                }
                pre_verify = true;
                log::debug!("Post-verify error at 0x{:08X}, pulse {}", addr, pulse);
            }
        }

        log::error!(
            "Line 0x{:08X} failed after {} pulses (status 0x{:08X})",
            addr,
            self.budget.max_programming_pulses,
            status
        );
        Err(Error::Write {
            addr,
            pulses: self.budget.max_programming_pulses,
            status,
        })
    }
}

fn words(line: &[u8]) -> [u32; BURST_LEN / 4] {
    let mut out = [u32::MAX; BURST_LEN / 4];
    for (word, bytes) in out.iter_mut().zip(line.chunks(4)) {
        let mut le = [0xFFu8; 4];
        le[..bytes.len()].copy_from_slice(bytes);
        *word = u32::from_le_bytes(le);
    }
    out
}

fn read_line<P: DebugProbe + ?Sized>(probe: &mut P, addr: u32) -> Result<[u32; BURST_LEN / 4]> {
    let mut buf = [0u8; BURST_LEN];
    probe.read_bulk(addr, &mut buf)?;
    Ok(words(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::flash::testing::MockProbe;

    const TLV_BASE: u32 = 0x0020_1000;

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            flash_base: 0,
            sector_size: 4096,
            sector_count: 64,
            banks: 2,
            sectors_per_bank: 32,
            otp: None,
        }
    }

    #[test]
    fn test_program_outside_main_array() {
        let layout = Msp432Layout {
            base: 0x4001_1000,
            tlv_base: TLV_BASE,
        };
        let geometry = geometry();
        let engine = Msp432Engine {
            layout: &layout,
            geometry: &geometry,
            budget: PulseBudget::default(),
            timing: Timing::from_config(&EngineConfig::default()),
        };
        let mut probe = MockProbe::stm32(layout.base);

        let err = engine.program(&mut probe, 0x0004_0000, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { addr: 0x0004_0000, len: 64 }));
        // Straddling the end of the array
        let err = engine.program(&mut probe, 0x0003_FFC0, &[0u8; 128]).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        // No sector was unprotected
        assert!(probe.writes().is_empty());
    }

    #[test]
    fn test_budget_from_tlv_entries() {
        let mut probe = MockProbe::stm32(0x4001_1000);
        // Device info entry, then FLASHCTL
        probe.poke(TLV_BASE + 4, 0x0B);
        probe.poke(TLV_BASE + 8, 1);
        probe.poke(TLV_BASE + 16, TLV_TAG_FLASHCTL);
        probe.poke(TLV_BASE + 20, 4);
        probe.poke(TLV_BASE + 32, 3);
        probe.poke(TLV_BASE + 36, 9);

        let budget = PulseBudget::read(&mut probe, TLV_BASE).unwrap();
        assert_eq!(
            budget,
            PulseBudget {
                max_programming_pulses: 3,
                max_erase_pulses: 9,
            }
        );
    }

    #[test]
    fn test_budget_with_corrupt_tlv_length() {
        for len in [0x4000_0000, 0x3FFF_FFFF, u32::MAX] {
            let mut probe = MockProbe::stm32(0x4001_1000);
            probe.poke(TLV_BASE + 4, 0x0B);
            probe.poke(TLV_BASE + 8, len);
            let budget = PulseBudget::read(&mut probe, TLV_BASE).unwrap();
            assert_eq!(budget, PulseBudget::default());
        }
    }

    #[test]
    fn test_words_little_endian() {
        let mut line = [0xFFu8; BURST_LEN];
        line[0..4].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        let w = words(&line);
        assert_eq!(w[0], 0x1234_5678);
        assert_eq!(w[1], u32::MAX);
    }

    #[test]
    fn test_patch_rules() {
        // Pre-verify: bits zero in both are no longer driven
        let existing = 0b1010u32 | 0xFFFF_FFF0;
        let mut data = 0b0110u32 | 0xFFFF_FFF0;
        data |= !(existing | data);
        assert_eq!(data & 0xF, 0b0111);

        // Post-verify: only bits still one where zero was wanted are driven
        let want = 0b0000u32 | 0xFFFF_FFF0;
        let actual = 0b0100u32 | 0xFFFF_FFF0;
        let next = !(!want & actual);
        assert_eq!(next & 0xF, 0b1011);
    }
}
