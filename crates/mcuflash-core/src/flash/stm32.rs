//! Key-locked commit-and-poll controllers (STM32 style)
//!
//! Erase is one sector per command: request, start, poll, check flags. A
//! program is a plain bulk write with PG set; the controller latches lines
//! as they arrive. Neither operation is retried.

use crate::error::{Error, Result};
use crate::family::{BankRegs, Stm32Layout};
use crate::probe::DebugProbe;
use crate::register::{Field, Registers};

use super::geometry::FlashGeometry;
use super::poll::{self, Timing};
use super::unlock::{Lock, UnlockGuard};

/// One STM32-style controller as configured at attach
pub(crate) struct Stm32Engine<'d> {
    pub(crate) layout: &'d Stm32Layout,
    pub(crate) geometry: &'d FlashGeometry,
    pub(crate) line_size: u32,
    pub(crate) swapped: bool,
    pub(crate) secure: bool,
    pub(crate) timing: Timing,
}

impl Stm32Engine<'_> {
    /// Register set and bank-select bit driving physical bank `bank`
    pub(crate) fn bank_regs(&self, bank: u32) -> (BankRegs, Option<u8>) {
        let sets = match (&self.layout.secure_banks, self.secure) {
            (Some(secure), true) => secure.as_slice(),
            _ => self.layout.banks.as_slice(),
        };
        if sets.len() > 1 {
            (sets[bank as usize % sets.len()], None)
        } else {
            (sets[0], self.layout.control.bank_select)
        }
    }

    /// Main-array lock of a register set
    pub(crate) fn main_lock(&self, regs: &BankRegs) -> Lock {
        Lock {
            name: "flash",
            base: self.layout.base,
            keyr: regs.keyr,
            lock: Field::bit(regs.cr, self.layout.control.lock),
            keys: self.layout.keys,
        }
    }

    /// Option-byte lock
    pub(crate) fn option_lock(&self) -> Lock {
        let options = &self.layout.options;
        Lock {
            name: "option bytes",
            base: self.layout.base,
            keyr: options.keyr,
            lock: options.lock,
            keys: options.keys,
        }
    }

    /// Physical bank behind a logical bank
    ///
    /// The swap option is XORed in as read at attach. On dual-bank parts
    /// where the swap bit and the runtime bank mapping can disagree after
    /// some reset sequences (H7 FB_MODE vs BFB2) this is not corrected for;
    /// re-attaching re-reads the option.
    fn physical_bank(&self, logical: u32) -> u32 {
        if self.geometry.banks > 1 && self.swapped {
            logical ^ 1
        } else {
            logical
        }
    }

    fn wait_idle<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        regs: &BankRegs,
        timing: Timing,
    ) -> Result<u32> {
        poll::wait_clear(
            probe,
            self.layout.base + regs.sr,
            self.layout.status.busy,
            timing,
        )
    }

    /// Clear stale error flags (write-1-to-clear, in CCR where there is one)
    pub(crate) fn clear_errors<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        regs: &BankRegs,
    ) -> Result<()> {
        let mut r = Registers::new(probe, self.layout.base);
        let errors = self.layout.status.errors;
        let sr = r.read(regs.sr)?;
        if sr & errors != 0 {
            log::debug!("Clearing stale flash errors 0x{:08X}", sr & errors);
        }
        r.write(regs.ccr.unwrap_or(regs.sr), errors)
    }

    fn check_errors(&self, status: u32) -> Result<()> {
        if status & self.layout.status.errors != 0 {
            log::error!("Flash controller error, status 0x{:08X}", status);
            return Err(Error::Controller { status });
        }
        Ok(())
    }

    /// Erase one sector
    pub(crate) fn erase_sector<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        sector: u32,
    ) -> Result<()> {
        let (logical, index) = self.geometry.locate(sector)?;
        let bank = self.physical_bank(logical);
        let (regs, bank_select) = self.bank_regs(bank);
        log::debug!(
            "Erasing sector {} (bank {}, index {})",
            sector,
            bank,
            index
        );

        let mut guard = UnlockGuard::enter(probe, self.main_lock(&regs))?;
        self.erase_unlocked(guard.probe(), &regs, bank_select, bank, index)?;
        guard.release()
    }

    fn erase_unlocked<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        regs: &BankRegs,
        bank_select: Option<u8>,
        bank: u32,
        index: u32,
    ) -> Result<()> {
        let control = &self.layout.control;
        let slow = self.timing;

        self.wait_idle(probe, regs, slow)?;
        self.clear_errors(probe, regs)?;

        let sector_field = Field::new(regs.cr, control.sector.0, control.sector.1);
        if index > sector_field.max_value() {
            return Err(Error::InvalidSector(index));
        }

        let mut r = Registers::new(&mut *probe, self.layout.base);
        let mut cr = r.read(regs.cr)?;
        cr |= 1 << control.erase;
        cr = sector_field.insert(cr, index);
        if let Some(bit) = bank_select {
            cr = Field::bit(regs.cr, bit).insert(cr, bank);
        }
        // Request and start are separate writes
        r.write(regs.cr, cr)?;
        r.write(regs.cr, cr | (1 << control.start))?;

        let status = self.wait_idle(probe, regs, slow)?;

        let mut r = Registers::new(&mut *probe, self.layout.base);
        r.modify(regs.cr, |v| sector_field.insert(v & !(1 << control.erase), 0))?;
        self.check_errors(status)
    }

    /// Program `data` at `addr`, which must be erased
    pub(crate) fn program<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        if self.geometry.in_otp(addr, data.len()) {
            self.check_otp_blank(probe, addr, data)?;
            return self.program_chunk(probe, 0, addr, data);
        }

        let mut offset = 0usize;
        while offset < data.len() {
            let chunk_addr = addr + offset as u32;
            let logical = self.geometry.bank_of(chunk_addr);
            let bank_end = self.geometry.flash_base + (logical + 1) * self.geometry.bank_size();
            let len = ((bank_end - chunk_addr) as usize).min(data.len() - offset);

            let bank = self.physical_bank(logical);
            self.program_chunk(probe, bank, chunk_addr, &data[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    fn check_otp_blank<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut current = vec![0u8; data.len()];
        probe.read_bulk(addr, &mut current)?;

        let line = self.line_size as usize;
        for (i, (have, want)) in current.chunks(line).zip(data.chunks(line)).enumerate() {
            let untouched = want.iter().all(|&b| b == 0xFF);
            if !untouched && have.iter().any(|&b| b != 0xFF) {
                return Err(Error::OtpProgrammed {
                    addr: addr + (i * line) as u32,
                });
            }
        }
        Ok(())
    }

    fn program_chunk<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        bank: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        let (regs, _) = self.bank_regs(bank);
        log::debug!(
            "Programming {} bytes at 0x{:08X} (bank {})",
            data.len(),
            addr,
            bank
        );

        let mut guard = UnlockGuard::enter(probe, self.main_lock(&regs))?;
        self.program_unlocked(guard.probe(), &regs, addr, data)?;
        guard.release()
    }

    fn program_unlocked<P: DebugProbe + ?Sized>(
        &self,
        probe: &mut P,
        regs: &BankRegs,
        addr: u32,
        data: &[u8],
    ) -> Result<()> {
        let control = &self.layout.control;
        let fast = self.timing.spin();

        self.wait_idle(probe, regs, fast)?;
        self.clear_errors(probe, regs)?;

        let mut r = Registers::new(&mut *probe, self.layout.base);
        if let Some(psize) = control.psize {
            r.set(Field::new(regs.cr, psize.shift, psize.width), psize.value)?;
        }
        r.set(Field::bit(regs.cr, control.pg), 1)?;

        let status = probe
            .write_bulk(addr, data)
            .and_then(|()| self.wait_idle(probe, regs, fast));
        // PG is cleared even when the transfer failed
        let cleared =
            Registers::new(&mut *probe, self.layout.base).set(Field::bit(regs.cr, control.pg), 0);

        let status = status?;
        cleared?;
        self.check_errors(status)
    }
}
