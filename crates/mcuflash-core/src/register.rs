//! Register field access
//!
//! Flash controllers are described as a base address plus fields at
//! base-relative offsets. A [`Field`] names a bit range inside one 32-bit
//! register; [`Registers`] performs the reads, writes and read-modify-writes
//! through the probe.
//!
//! Accesses are not idempotent in general: writing a START bit launches an
//! operation, writing 1 to a status flag clears it. Callers decide which
//! access to use, this module never issues extra writes.

use crate::error::Result;
use crate::probe::DebugProbe;
use serde::Deserialize;

/// A bit field inside a 32-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Field {
    /// Register offset from the block base
    pub offset: u32,
    /// Bit position of the least significant bit
    pub shift: u8,
    /// Width in bits
    pub width: u8,
}

impl Field {
    /// Create a multi-bit field
    pub const fn new(offset: u32, shift: u8, width: u8) -> Self {
        Self {
            offset,
            shift,
            width,
        }
    }

    /// Create a single-bit field
    pub const fn bit(offset: u32, shift: u8) -> Self {
        Self::new(offset, shift, 1)
    }

    /// Largest value the field can hold
    pub const fn max_value(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// Field mask in register position
    pub const fn mask(&self) -> u32 {
        self.max_value() << self.shift
    }

    /// Extract the field from a raw register value
    pub const fn extract(&self, raw: u32) -> u32 {
        (raw >> self.shift) & self.max_value()
    }

    /// Replace the field inside a raw register value
    pub const fn insert(&self, raw: u32, value: u32) -> u32 {
        (raw & !self.mask()) | ((value & self.max_value()) << self.shift)
    }
}

/// Register block of a peripheral, borrowed from the probe
pub struct Registers<'a, P: DebugProbe + ?Sized> {
    probe: &'a mut P,
    base: u32,
}

impl<'a, P: DebugProbe + ?Sized> Registers<'a, P> {
    /// Create a register block at `base`
    pub fn new(probe: &'a mut P, base: u32) -> Self {
        Self { probe, base }
    }

    /// Base address of the block
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Access the underlying probe
    pub fn probe(&mut self) -> &mut P {
        &mut *self.probe
    }

    /// Read the register at `offset`
    pub fn read(&mut self, offset: u32) -> Result<u32> {
        let value = self.probe.read32(self.base + offset)?;
        log::trace!("rd 0x{:08X} = 0x{:08X}", self.base + offset, value);
        Ok(value)
    }

    /// Write the register at `offset`
    pub fn write(&mut self, offset: u32, value: u32) -> Result<()> {
        log::trace!("wr 0x{:08X} = 0x{:08X}", self.base + offset, value);
        self.probe.write32(self.base + offset, value)
    }

    /// Read-modify-write the register at `offset`
    pub fn modify<F>(&mut self, offset: u32, f: F) -> Result<()>
    where
        F: FnOnce(u32) -> u32,
    {
        let value = self.read(offset)?;
        self.write(offset, f(value))
    }

    /// Read a field
    pub fn get(&mut self, field: Field) -> Result<u32> {
        Ok(field.extract(self.read(field.offset)?))
    }

    /// Read-modify-write a field, leaving the rest of the register intact
    pub fn set(&mut self, field: Field, value: u32) -> Result<()> {
        self.modify(field.offset, |raw| field.insert(raw, value))
    }

    /// Check whether a single-bit field is set
    pub fn is_set(&mut self, field: Field) -> Result<bool> {
        Ok(self.get(field)? != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_masks() {
        let pnb = Field::new(0x14, 3, 7);
        assert_eq!(pnb.max_value(), 0x7F);
        assert_eq!(pnb.mask(), 0x3F8);
        assert_eq!(Field::new(0, 0, 32).max_value(), u32::MAX);
        assert_eq!(Field::bit(0, 31).mask(), 0x8000_0000);
    }

    #[test]
    fn test_field_insert_extract() {
        let rdp = Field::new(0x20, 0, 8);
        let raw = 0xFFEF_F8AA;
        assert_eq!(rdp.extract(raw), 0xAA);
        assert_eq!(rdp.insert(raw, 0xBB), 0xFFEF_F8BB);

        let bfb2 = Field::bit(0x20, 20);
        assert_eq!(bfb2.extract(raw), 0);
        assert_eq!(bfb2.insert(raw, 1), 0xFFFF_F8AA);
        // Out-of-range values are truncated to the field width
        assert_eq!(bfb2.insert(0, 3), 1 << 20);
    }
}
