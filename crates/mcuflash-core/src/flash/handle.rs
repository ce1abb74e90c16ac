//! Flash access handle
//!
//! [`FlashHandle`] borrows the probe and device of a session and adds the
//! operations callers actually want: range erase, padded writes with a
//! sector-by-sector fallback, read-back and verify. Progress goes to the
//! session's observer.

use crate::error::{Error, Result};
use crate::family::EraseAlgorithm;
use crate::probe::DebugProbe;

use super::device::FlashDevice;
use super::progress::{FlashObserver, WriteStats};

/// The erased value for flash memory (all bits set)
const ERASED_VALUE: u8 = 0xFF;

/// Chunk size used for reads and progress updates
const CHUNK_SIZE: usize = 4096;

/// Determine if an erase is required to transition from `have` to `want`
///
/// Programming can only clear bits. Any bit that must go from 0 to 1 needs
/// an erase first.
pub fn need_erase(have: &[u8], want: &[u8]) -> bool {
    have.iter().zip(want.iter()).any(|(h, w)| (h & w) != *w)
}

/// Extend `data` at `addr` to whole program lines, padding with 0xFF
fn pad_to_lines(addr: u32, data: &[u8], line: u32) -> (u32, Vec<u8>) {
    let start = addr - addr % line;
    let end = addr as u64 + data.len() as u64;
    let padded_end = end.div_ceil(line as u64) * line as u64;
    let len = (padded_end - start as u64) as usize;

    let mut padded = vec![ERASED_VALUE; len];
    let offset = (addr - start) as usize;
    padded[offset..offset + data.len()].copy_from_slice(data);
    (start, padded)
}

/// Flash operations on an attached target
pub struct FlashHandle<'a, P: DebugProbe + ?Sized> {
    probe: &'a mut P,
    device: &'a FlashDevice,
    observer: &'a mut dyn FlashObserver,
}

impl<'a, P: DebugProbe + ?Sized> FlashHandle<'a, P> {
    /// Create a handle
    pub fn new(probe: &'a mut P, device: &'a FlashDevice, observer: &'a mut dyn FlashObserver) -> Self {
        Self {
            probe,
            device,
            observer,
        }
    }

    /// The device behind this handle
    pub fn device(&self) -> &FlashDevice {
        self.device
    }

    /// Erase sector `n`
    pub fn erase_sector(&mut self, n: u32) -> Result<()> {
        self.device.erase_sector(&mut *self.probe, n)
    }

    /// Erase every sector in `mask` (bit i = sector i)
    pub fn erase_sectors(&mut self, mask: u64) -> Result<()> {
        self.observer.erasing(mask.count_ones() as usize);
        let observer = &mut *self.observer;
        self.device
            .erase_sectors_with(&mut *self.probe, mask, |done| observer.erase_progress(done))
    }

    /// Erase every sector touched by `addr..addr+len`
    pub fn erase_range(&mut self, addr: u32, len: usize) -> Result<usize> {
        if self.device.geometry().in_otp(addr, len) {
            return Err(Error::Unsupported("OTP erase"));
        }
        let sectors = self.device.geometry().sectors_touched(addr, len)?;
        self.erase_sector_range(sectors)
    }

    /// Erase the whole main array
    pub fn erase_all(&mut self) -> Result<usize> {
        let count = self.device.geometry().sector_count;
        log::info!("Erasing all {} sectors", count);
        self.erase_sector_range(0..count)
    }

    fn erase_sector_range(&mut self, sectors: std::ops::Range<u32>) -> Result<usize> {
        let count = sectors.len();
        if count == 0 {
            return Ok(0);
        }

        match self.device.family().erase_algorithm() {
            EraseAlgorithm::MaskPulseVerify => {
                let mask = sectors.fold(0u64, |m, s| m | (1 << s));
                self.erase_sectors(mask)?;
            }
            EraseAlgorithm::SectorCommit => {
                // Ranges can exceed the 64 sectors a mask covers
                self.observer.erasing(count);
                let observer = &mut *self.observer;
                self.device
                    .erase_each(&mut *self.probe, sectors, |done| observer.erase_progress(done))?;
            }
        }
        Ok(count)
    }

    /// Program erased flash; `addr` and `data` must be line aligned
    pub fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.device.check_program(addr, data.len())?;
        self.observer.writing(data.len());

        let mut written = 0;
        for chunk in data.chunks(CHUNK_SIZE) {
            self.device.program(&mut *self.probe, addr + written as u32, chunk)?;
            written += chunk.len();
            self.observer.write_progress(written);
        }
        Ok(())
    }

    /// Read flash (or any target memory) into `buf`
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.observer.reading(buf.len());
        let mut done = 0;
        for chunk in buf.chunks_mut(CHUNK_SIZE) {
            self.probe.read_bulk(addr + done as u32, chunk)?;
            done += chunk.len();
            self.observer.read_progress(done);
        }
        Ok(())
    }

    /// Compare flash contents against `data`
    pub fn verify(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut current = vec![0u8; data.len()];
        self.read(addr, &mut current)?;
        match current.iter().zip(data).position(|(a, b)| a != b) {
            Some(offset) => {
                let addr = addr + offset as u32;
                log::error!("Verify failed at 0x{:08X}", addr);
                Err(Error::Verify { addr })
            }
            None => Ok(()),
        }
    }

    /// Write arbitrary data, erasing as needed
    ///
    /// The data is padded with 0xFF to whole program lines and programmed
    /// in one pass, assuming the region is erased. If that fails or does not
    /// read back, the region is rewritten sector by sector: read, merge the
    /// unpadded data, erase when a bit has to go from 0 to 1, program the
    /// changed lines, verify.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<WriteStats> {
        let (start, padded) = pad_to_lines(addr, data, self.device.line_size());
        let mut stats = WriteStats::default();

        let fast = self
            .program(start, &padded)
            .and_then(|()| self.verify(start, &padded));
        match fast {
            Ok(()) => {
                stats.bytes_written = padded.len();
            }
            Err(e @ (Error::Write { .. } | Error::Controller { .. } | Error::Verify { .. })) => {
                if self.device.geometry().in_otp(start, padded.len()) {
                    return Err(e);
                }
                log::warn!("Fast write failed ({}), falling back to sector writes", e);
                stats = self.write_by_sector(addr, data)?;
                stats.used_fallback = true;
            }
            Err(e) => return Err(e),
        }

        self.observer.complete(&stats);
        Ok(stats)
    }

    fn write_by_sector(&mut self, addr: u32, data: &[u8]) -> Result<WriteStats> {
        let geometry = *self.device.geometry();
        let line = self.device.line_size() as usize;
        let mut stats = WriteStats::default();

        for sector in geometry.sectors_touched(addr, data.len())? {
            let base = geometry.sector_base(sector)?;
            let size = geometry.sector_size as usize;

            let mut current = vec![0u8; size];
            self.probe.read_bulk(base, &mut current)?;

            let mut wanted = current.clone();
            let lo = addr.max(base);
            let hi = (addr as u64 + data.len() as u64).min(base as u64 + size as u64) as u32;
            wanted[(lo - base) as usize..(hi - base) as usize]
                .copy_from_slice(&data[(lo - addr) as usize..(hi - addr) as usize]);

            if current == wanted {
                continue;
            }
            if need_erase(&current, &wanted) {
                log::debug!("Sector {} needs erase", sector);
                self.device.erase_sector(&mut *self.probe, sector)?;
                current.fill(ERASED_VALUE);
                stats.sectors_erased += 1;
            }

            // Program runs of changed lines
            let mut offset = 0;
            while offset < size {
                if current[offset..offset + line] == wanted[offset..offset + line] {
                    offset += line;
                    continue;
                }
                let run_start = offset;
                while offset < size && current[offset..offset + line] != wanted[offset..offset + line] {
                    offset += line;
                }
                let run_addr = base + run_start as u32;
                self.device
                    .program(&mut *self.probe, run_addr, &wanted[run_start..offset])?;
                stats.bytes_written += offset - run_start;
            }

            self.verify(base, &wanted)?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_to_lines() {
        let (start, padded) = pad_to_lines(0x0800_0003, &[1, 2, 3], 8);
        assert_eq!(start, 0x0800_0000);
        assert_eq!(padded, vec![0xFF, 0xFF, 0xFF, 1, 2, 3, 0xFF, 0xFF]);

        let (start, padded) = pad_to_lines(0x0800_0010, &[0u8; 16], 8);
        assert_eq!(start, 0x0800_0010);
        assert_eq!(padded.len(), 16);

        let (_, padded) = pad_to_lines(0x0800_0006, &[0u8; 4], 8);
        assert_eq!(padded.len(), 16);
    }

    #[test]
    fn test_need_erase() {
        assert!(!need_erase(&[0xFF, 0xFF], &[0x12, 0x34]));
        assert!(!need_erase(&[0xF0], &[0x00]));
        assert!(need_erase(&[0x00], &[0x01]));
        assert!(!need_erase(&[0x55], &[0x55]));
    }
}
