//! Minimal register-level probe for unit tests
//!
//! Emulates just enough of an STM32 key-locked controller to exercise the
//! unlock and option staging logic: KEYR at +0x08, OPTKEYR at +0x0C, CR at
//! +0x14 with LOCK (31) and OPTLOCK (30). Everything else is plain memory.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::family::{FLASH_KEYS, OPTION_KEYS};
use crate::probe::DebugProbe;

const LOCK: u32 = 1 << 31;
const OPTLOCK: u32 = 1 << 30;

pub(crate) struct MockProbe {
    base: u32,
    memory: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    key_stage: u8,
    opt_key_stage: u8,
}

impl MockProbe {
    pub(crate) fn stm32(base: u32) -> Self {
        let mut memory = HashMap::new();
        memory.insert(base + 0x14, LOCK | OPTLOCK);
        Self {
            base,
            memory,
            writes: Vec::new(),
            key_stage: 0,
            opt_key_stage: 0,
        }
    }

    pub(crate) fn cr(&self) -> u32 {
        self.memory.get(&(self.base + 0x14)).copied().unwrap_or(0)
    }

    pub(crate) fn set_cr(&mut self, value: u32) {
        self.memory.insert(self.base + 0x14, value);
    }

    pub(crate) fn poke(&mut self, addr: u32, value: u32) {
        self.memory.insert(addr, value);
    }

    pub(crate) fn writes(&self) -> &[(u32, u32)] {
        &self.writes
    }

    pub(crate) fn key_writes(&self, addr: u32) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl DebugProbe for MockProbe {
    fn read32(&mut self, addr: u32) -> Result<u32> {
        Ok(self.memory.get(&addr).copied().unwrap_or(0))
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.writes.push((addr, value));
        let cr = self.cr();

        if addr == self.base + 0x08 {
            self.key_stage = match (self.key_stage, value) {
                (0, v) if v == FLASH_KEYS.0 => 1,
                (1, v) if v == FLASH_KEYS.1 => {
                    self.set_cr(cr & !LOCK);
                    0
                }
                _ => 0,
            };
        } else if addr == self.base + 0x0C {
            self.opt_key_stage = match (self.opt_key_stage, value) {
                (0, v) if v == OPTION_KEYS.0 => 1,
                (1, v) if v == OPTION_KEYS.1 && cr & LOCK == 0 => {
                    self.set_cr(cr & !OPTLOCK);
                    0
                }
                _ => 0,
            };
        } else if addr == self.base + 0x14 {
            // Lock bits can only be set by software
            let locks = (cr | value) & (LOCK | OPTLOCK);
            self.set_cr((value & !(LOCK | OPTLOCK)) | locks);
        } else {
            self.memory.insert(addr, value);
        }
        Ok(())
    }

    fn read_bulk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        Err(Error::Transfer {
            addr,
            reason: format!("mock probe has no bulk access ({} bytes)", buf.len()),
        })
    }

    fn write_bulk(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        Err(Error::Transfer {
            addr,
            reason: format!("mock probe has no bulk access ({} bytes)", data.len()),
        })
    }

    fn is_halted(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn halt(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn reprobe(&mut self, _connect_under_reset: bool) -> Result<()> {
        Ok(())
    }

    fn delay_ms(&mut self, _ms: u32) {}
}
