//! Bounded status polling

use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::probe::DebugProbe;

/// How long and how often a status register is polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Give up after this long
    pub timeout: Duration,
    /// Sleep between reads of slow operations (0 spins)
    pub interval_ms: u32,
}

impl Timing {
    /// Timing derived from the engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.poll_timeout(),
            interval_ms: config.poll_interval_ms,
        }
    }

    /// Same timeout without sleeping, for short operations like programming
    pub fn spin(self) -> Self {
        Self {
            interval_ms: 0,
            ..self
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Read `addr` until `done` accepts the value, returning that value
pub(crate) fn wait_for<P, F>(probe: &mut P, addr: u32, timing: Timing, mut done: F) -> Result<u32>
where
    P: DebugProbe + ?Sized,
    F: FnMut(u32) -> bool,
{
    let start = Instant::now();
    loop {
        let value = probe.read32(addr)?;
        if done(value) {
            return Ok(value);
        }
        if start.elapsed() >= timing.timeout {
            log::debug!("poll of 0x{:08X} timed out at 0x{:08X}", addr, value);
            return Err(Error::ControllerTimeout {
                status: value,
                timeout_ms: timing.timeout.as_millis() as u64,
            });
        }
        if timing.interval_ms > 0 {
            probe.delay_ms(timing.interval_ms);
        }
    }
}

/// Wait until every bit of `busy` reads back clear
pub(crate) fn wait_clear<P>(probe: &mut P, addr: u32, busy: u32, timing: Timing) -> Result<u32>
where
    P: DebugProbe + ?Sized,
{
    wait_for(probe, addr, timing, |value| value & busy == 0)
}
