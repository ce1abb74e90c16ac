//! Debug probe trait
//!
//! The engine only needs word and bulk memory access plus a handful of
//! target-control primitives. Probe drivers implement [`DebugProbe`]; USB
//! framing, access-port selection and splitting bulk transfers on
//! auto-increment boundaries are the driver's business.

use crate::error::Result;

/// Cortex-M CPUID register, readable on every core and used as the
/// cheap "is the link alive" probe
pub const CPUID: u32 = 0xE000_ED00;

/// Cortex-M Application Interrupt and Reset Control Register
pub const AIRCR: u32 = 0xE000_ED0C;

/// AIRCR value requesting a system reset (VECTKEY | SYSRESETREQ)
pub const AIRCR_SYSRESETREQ: u32 = 0x05FA_0004;

/// Debug probe attached to a single target
///
/// All multi-byte values are little endian. Implementations must handle
/// unaligned and boundary-crossing bulk transfers transparently.
///
/// ## Resets
///
/// Some operations deliberately reset the target. Depending on the probe,
/// the write that triggers the reset may itself fail, and later accesses
/// keep failing with [`crate::Error::Disconnected`] until
/// [`reprobe`](DebugProbe::reprobe) re-establishes the link.
pub trait DebugProbe {
    /// Read a 32-bit word
    fn read32(&mut self, addr: u32) -> Result<u32>;

    /// Write a 32-bit word
    fn write32(&mut self, addr: u32, value: u32) -> Result<()>;

    /// Read a block of target memory
    fn read_bulk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Write a block of target memory
    fn write_bulk(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Check whether the core is halted
    fn is_halted(&mut self) -> Result<bool>;

    /// Halt the core
    fn halt(&mut self) -> Result<()>;

    /// Resume the core
    fn resume(&mut self) -> Result<()>;

    /// Re-establish the debug link after the target dropped it
    ///
    /// # Arguments
    /// * `connect_under_reset` - Hold the target in reset while connecting
    fn reprobe(&mut self, connect_under_reset: bool) -> Result<()>;

    /// Delay for the specified number of milliseconds
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}

// Boxed probes are what the registry hands out
impl DebugProbe for Box<dyn DebugProbe + Send> {
    fn read32(&mut self, addr: u32) -> Result<u32> {
        (**self).read32(addr)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        (**self).write32(addr, value)
    }

    fn read_bulk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_bulk(addr, buf)
    }

    fn write_bulk(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        (**self).write_bulk(addr, data)
    }

    fn is_halted(&mut self) -> Result<bool> {
        (**self).is_halted()
    }

    fn halt(&mut self) -> Result<()> {
        (**self).halt()
    }

    fn resume(&mut self) -> Result<()> {
        (**self).resume()
    }

    fn reprobe(&mut self, connect_under_reset: bool) -> Result<()> {
        (**self).reprobe(connect_under_reset)
    }

    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}
