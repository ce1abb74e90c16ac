//! Resolved flash geometry
//!
//! [`FlashGeometry`] is the descriptor geometry with the runtime choices
//! (bank mode, sector size) already made. It is fixed for the lifetime of a
//! [`FlashDevice`](super::FlashDevice).

use crate::error::{Error, Result};
use crate::family::GeometryDef;

/// One-time-programmable area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpRegion {
    /// Absolute base address
    pub base: u32,
    /// Length in bytes
    pub len: u32,
}

/// Main-array layout of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Address of sector 0
    pub flash_base: u32,
    /// Uniform sector size in bytes
    pub sector_size: u32,
    /// Total number of sectors
    pub sector_count: u32,
    /// Number of banks (1 or 2)
    pub banks: u32,
    /// Sectors in each bank
    pub sectors_per_bank: u32,
    /// OTP area, if any
    pub otp: Option<OtpRegion>,
}

impl FlashGeometry {
    /// Resolve a descriptor geometry for the given bank mode
    pub fn resolve(def: &GeometryDef, dual_bank: bool) -> Self {
        let size = def.flash_size.to_bytes();
        let sector_size = if dual_bank {
            def.dual_sector_size.unwrap_or(def.sector_size).to_bytes()
        } else {
            def.sector_size.to_bytes()
        };
        let sector_count = size / sector_size;
        let banks = if dual_bank { 2 } else { 1 };

        Self {
            flash_base: def.flash_base,
            sector_size,
            sector_count,
            banks,
            sectors_per_bank: sector_count / banks,
            otp: def.otp.map(|otp| OtpRegion {
                base: otp.base,
                len: otp.size.to_bytes(),
            }),
        }
    }

    /// Main-array size in bytes
    pub fn size(&self) -> u32 {
        self.sector_size * self.sector_count
    }

    /// Size of one bank in bytes
    pub fn bank_size(&self) -> u32 {
        self.sector_size * self.sectors_per_bank
    }

    /// Base address of sector `n`
    pub fn sector_base(&self, n: u32) -> Result<u32> {
        if n >= self.sector_count {
            return Err(Error::InvalidSector(n));
        }
        Ok(self.flash_base + n * self.sector_size)
    }

    /// Sector holding `addr`, if it is in the main array
    pub fn sector_at(&self, addr: u32) -> Option<u32> {
        if addr < self.flash_base || addr - self.flash_base >= self.size() {
            return None;
        }
        Some((addr - self.flash_base) / self.sector_size)
    }

    /// Logical bank and index inside the bank of sector `n`
    pub fn locate(&self, n: u32) -> Result<(u32, u32)> {
        if n >= self.sector_count {
            return Err(Error::InvalidSector(n));
        }
        Ok((n / self.sectors_per_bank, n % self.sectors_per_bank))
    }

    /// Logical bank of a main-array address
    pub fn bank_of(&self, addr: u32) -> u32 {
        (addr - self.flash_base) / self.bank_size()
    }

    /// Whether `addr..addr+len` lies inside the main array
    pub fn contains(&self, addr: u32, len: usize) -> bool {
        let start = addr as u64;
        let base = self.flash_base as u64;
        start >= base && start + len as u64 <= base + self.size() as u64
    }

    /// Whether `addr..addr+len` lies inside the OTP area
    pub fn in_otp(&self, addr: u32, len: usize) -> bool {
        self.otp.is_some_and(|otp| {
            let start = addr as u64;
            start >= otp.base as u64 && start + len as u64 <= otp.base as u64 + otp.len as u64
        })
    }

    /// Range of sectors touched by `addr..addr+len`
    pub fn sectors_touched(&self, addr: u32, len: usize) -> Result<std::ops::Range<u32>> {
        if len == 0 {
            return Ok(0..0);
        }
        if !self.contains(addr, len) {
            return Err(Error::OutOfBounds { addr, len });
        }
        let first = (addr - self.flash_base) / self.sector_size;
        let last = (addr - self.flash_base + len as u32 - 1) / self.sector_size;
        Ok(first..last + 1)
    }

    /// Check an erase mask against the sector count
    pub fn check_mask(&self, mask: u64) -> Result<()> {
        if mask == 0 {
            return Ok(());
        }
        let highest = 63 - mask.leading_zeros();
        if highest >= self.sector_count {
            return Err(Error::InvalidSector(highest));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{BankMode, OtpDef, Size};

    fn g4() -> GeometryDef {
        GeometryDef {
            flash_base: 0x0800_0000,
            flash_size: Size::KiB(512),
            sector_size: Size::KiB(4),
            dual_sector_size: Some(Size::KiB(2)),
            banks: BankMode::Selectable("dbank".into()),
            otp: Some(OtpDef {
                base: 0x1FFF_7000,
                size: Size::KiB(1),
            }),
        }
    }

    #[test]
    fn test_bank_mode_selects_sector_size() {
        let single = FlashGeometry::resolve(&g4(), false);
        assert_eq!(single.sector_size, 4096);
        assert_eq!(single.sector_count, 128);
        assert_eq!(single.banks, 1);

        let dual = FlashGeometry::resolve(&g4(), true);
        assert_eq!(dual.sector_size, 2048);
        assert_eq!(dual.sector_count, 256);
        assert_eq!(dual.sectors_per_bank, 128);
        assert_eq!(dual.bank_size(), 256 * 1024);
    }

    #[test]
    fn test_locate_and_bounds() {
        let dual = FlashGeometry::resolve(&g4(), true);
        assert_eq!(dual.locate(0).unwrap(), (0, 0));
        assert_eq!(dual.locate(130).unwrap(), (1, 2));
        assert!(matches!(dual.locate(256), Err(Error::InvalidSector(256))));
        assert_eq!(dual.sector_base(1).unwrap(), 0x0800_0800);
        assert_eq!(dual.bank_of(0x0804_0000), 1);
        assert_eq!(dual.sector_at(0x0800_0FFF), Some(1));
        assert_eq!(dual.sector_at(0x0808_0000), None);
    }

    #[test]
    fn test_ranges() {
        let geo = FlashGeometry::resolve(&g4(), false);
        assert!(geo.contains(0x0807_FFF8, 8));
        assert!(!geo.contains(0x0807_FFF8, 16));
        assert!(geo.in_otp(0x1FFF_7000, 1024));
        assert!(!geo.in_otp(0x1FFF_7000, 1032));
        assert_eq!(geo.sectors_touched(0x0800_0FF8, 16).unwrap(), 0..2);
        assert!(geo.check_mask(u64::MAX).is_ok());

        let small = FlashGeometry {
            sector_count: 3,
            sectors_per_bank: 3,
            ..geo
        };
        assert!(small.check_mask(0b111).is_ok());
        assert!(matches!(
            small.check_mask(0b1000),
            Err(Error::InvalidSector(3))
        ));
    }
}
