//! Target sessions
//!
//! A [`Session`] owns the probe and everything derived from the attached
//! target: the identified family, the flash device and the progress
//! observer. Operations that reset the target (committing option bytes,
//! swapping banks) take the session by value and hand back a freshly
//! attached one, so a handle from before the reset cannot be used by
//! mistake.
//!
//! ```ignore
//! let session = match session.set_options(&options) {
//!     Ok(session) => session,
//!     // A rejected request leaves the session usable
//!     Err(ResetError { session: Some(session), error }) => { ... }
//!     Err(e) => return Err(e.into()),
//! };
//! ```

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::family::{FamilyDatabase, FamilyDescriptor};
use crate::flash::{
    FlashDevice, FlashHandle, FlashObserver, NoProgress, OptionValues, StagedOptions,
};
use crate::probe::{DebugProbe, CPUID};

/// What was found at attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// Raw CPUID register
    pub cpuid: u32,
    /// Cortex-M part number from CPUID
    pub cpu_part: u16,
    /// Device ID read from the family ID register (0 when the family was forced)
    pub device_id: u32,
    /// Family name
    pub family: String,
}

impl fmt::Display for TargetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (device 0x{:03X}, CPUID 0x{:08X})",
            self.family, self.device_id, self.cpuid
        )
    }
}

/// Live connection to one target
pub struct Session<P: DebugProbe> {
    probe: P,
    db: Arc<FamilyDatabase>,
    config: EngineConfig,
    info: TargetInfo,
    device: FlashDevice,
    observer: Box<dyn FlashObserver + Send>,
}

impl<P: DebugProbe> Session<P> {
    /// Halt and identify the target, and read its flash configuration
    pub fn attach(probe: P, db: Arc<FamilyDatabase>, config: EngineConfig) -> Result<Self> {
        Self::attach_with(probe, db, config, Box::new(NoProgress))
    }

    fn attach_with(
        mut probe: P,
        db: Arc<FamilyDatabase>,
        config: EngineConfig,
        observer: Box<dyn FlashObserver + Send>,
    ) -> Result<Self> {
        let (info, device) = discover(&mut probe, &db, &config)?;
        log::info!("Attached to {}", info);
        Ok(Self {
            probe,
            db,
            config,
            info,
            device,
            observer,
        })
    }

    /// Replace the progress observer
    pub fn with_observer(mut self, observer: Box<dyn FlashObserver + Send>) -> Self {
        self.observer = observer;
        self
    }

    /// Target identification
    pub fn info(&self) -> &TargetInfo {
        &self.info
    }

    /// Flash device of the target
    pub fn device(&self) -> &FlashDevice {
        &self.device
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Direct probe access
    pub fn probe(&mut self) -> &mut P {
        &mut self.probe
    }

    /// Flash operations
    pub fn flash(&mut self) -> FlashHandle<'_, P> {
        FlashHandle::new(&mut self.probe, &self.device, self.observer.as_mut())
    }

    /// Resume the core
    pub fn resume(&mut self) -> Result<()> {
        self.probe.resume()
    }

    /// Give the probe back
    pub fn into_probe(self) -> P {
        self.probe
    }

    /// Active option values
    pub fn get_options(&mut self) -> Result<OptionValues> {
        self.device.read_options(&mut self.probe)
    }

    /// Validate option changes without writing anything
    ///
    /// Use this before [`commit_options`](Self::commit_options) to keep the
    /// session when the request is rejected.
    pub fn stage_options(&mut self, values: &OptionValues) -> Result<StagedOptions> {
        self.device.stage_options(&mut self.probe, values)
    }

    /// Change option bytes; the target resets and the session is replaced
    ///
    /// A rejected request hands the untouched session back in the error.
    pub fn set_options(mut self, values: &OptionValues) -> ResetResult<P> {
        match self.stage_options(values) {
            Ok(staged) => self.commit_options(&staged),
            Err(error) => Err(ResetError::kept(self, error)),
        }
    }

    /// Commit staged options; the target resets and the session is replaced
    ///
    /// Failures before the reset hand the session back in the error.
    pub fn commit_options(mut self, staged: &StagedOptions) -> ResetResult<P> {
        log::info!("Committing options {:?}", staged.changes());
        if let Err(error) = self.device.commit_options(&mut self.probe, staged) {
            return Err(ResetError::kept(self, error));
        }
        self.reconnect().map_err(ResetError::lost)
    }

    /// Flip the bank-swap option; the target resets and the session is replaced
    pub fn swap_banks_and_reset_no_connect(mut self) -> ResetResult<P> {
        let Some(field) = self.device.swap_option().map(|f| f.name.clone()) else {
            return Err(ResetError::kept(self, Error::Unsupported("bank swap")));
        };

        let current = match self.get_options() {
            Ok(current) => current,
            Err(error) => return Err(ResetError::kept(self, error)),
        };
        let value = current.get(&field).copied().unwrap_or(0);
        log::info!("Swapping banks ({} {} -> {})", field, value, value ^ 1);

        let mut values = OptionValues::new();
        values.insert(field, value ^ 1);
        self.set_options(&values)
    }

    /// Wait for the link to come back after a reset and attach again
    fn reconnect(self) -> Result<Self> {
        let Session {
            probe,
            db,
            config,
            observer,
            ..
        } = self;

        let probe = reconnect_probe(probe, &config)?;
        Self::attach_with(probe, db, config, observer)
    }
}

/// Outcome of an operation that resets the target
pub type ResetResult<P> = std::result::Result<Session<P>, ResetError<P>>;

/// Failure of an operation that resets the target
///
/// `session` is the unchanged session when the failure happened before the
/// reset was requested, and `None` once the target went through reset.
pub struct ResetError<P: DebugProbe> {
    /// What went wrong
    pub error: Error,
    /// The session, if it is still usable
    pub session: Option<Session<P>>,
}

impl<P: DebugProbe> ResetError<P> {
    fn kept(session: Session<P>, error: Error) -> Self {
        Self {
            error,
            session: Some(session),
        }
    }

    fn lost(error: Error) -> Self {
        Self {
            error,
            session: None,
        }
    }

    /// Split into the error and the session, if any
    pub fn into_parts(self) -> (Error, Option<Session<P>>) {
        (self.error, self.session)
    }
}

impl<P: DebugProbe> fmt::Debug for ResetError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetError")
            .field("error", &self.error)
            .field("session_kept", &self.session.is_some())
            .finish()
    }
}

impl<P: DebugProbe> fmt::Display for ResetError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<P: DebugProbe> std::error::Error for ResetError<P> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<P: DebugProbe> From<ResetError<P>> for Error {
    fn from(e: ResetError<P>) -> Self {
        e.error
    }
}

/// Re-establish the debug link after a reset
///
/// A CPUID read is tried first since some probes keep the link across a
/// system reset. Otherwise the probe is re-opened every
/// `reconnect_interval_ms` until CPUID answers or `reconnect_attempts` is
/// exhausted (never, if unset).
pub fn reconnect_probe<P: DebugProbe>(mut probe: P, config: &EngineConfig) -> Result<P> {
    match probe.read32(CPUID) {
        Ok(_) => {
            log::debug!("Debug link survived the reset");
            return Ok(probe);
        }
        Err(e) if e.is_transport() => {
            log::debug!("Debug link lost: {}", e);
        }
        Err(e) => return Err(e),
    }

    let mut attempts = 0;
    loop {
        if config
            .reconnect_attempts
            .is_some_and(|max| attempts >= max)
        {
            log::error!("Target did not come back after {} attempts", attempts);
            return Err(Error::ReconnectFailed { attempts });
        }
        attempts += 1;

        let result = probe
            .reprobe(config.connect_under_reset)
            .and_then(|()| probe.read32(CPUID));
        match result {
            Ok(_) => {
                log::info!("Reconnected after {} attempt(s)", attempts);
                return Ok(probe);
            }
            Err(e) => {
                log::debug!("Reconnect attempt {} failed: {}", attempts, e);
                probe.delay_ms(config.reconnect_interval_ms);
            }
        }
    }
}

/// Halt, identify, enable debug clocks and build the flash device
fn discover<P: DebugProbe>(
    probe: &mut P,
    db: &FamilyDatabase,
    config: &EngineConfig,
) -> Result<(TargetInfo, FlashDevice)> {
    probe.halt()?;
    let cpuid = probe.read32(CPUID)?;
    let cpu_part = ((cpuid >> 4) & 0xFFF) as u16;
    log::debug!("CPUID 0x{:08X} (part 0x{:03X})", cpuid, cpu_part);

    let (family, device_id) = match &config.family {
        Some(name) => {
            let family = db
                .find(name)
                .ok_or_else(|| Error::Database(format!("unknown family '{}'", name)))?;
            (family, 0)
        }
        None => identify(probe, db, cpu_part, cpuid)?,
    };

    if let Some(debug) = family.debug_enable {
        let value = probe.read32(debug.addr)?;
        probe.write32(debug.addr, value | debug.value)?;
    }

    let device = FlashDevice::probe(probe, family, config)?;
    let info = TargetInfo {
        cpuid,
        cpu_part,
        device_id,
        family: family.name.clone(),
    };
    Ok((info, device))
}

/// Find the family whose ID register matches
///
/// Candidates are narrowed by CPUID part first. A transfer error on a
/// candidate's ID register (not mapped on this part) rules it out.
fn identify<'db, P: DebugProbe>(
    probe: &mut P,
    db: &'db FamilyDatabase,
    cpu_part: u16,
    cpuid: u32,
) -> Result<(&'db FamilyDescriptor, u32)> {
    for family in db.candidates(cpu_part) {
        match probe.read32(family.id.addr) {
            Ok(raw) if family.id.matches(raw) => {
                return Ok((family, raw & family.id.mask));
            }
            Ok(raw) => {
                log::trace!("{}: ID 0x{:08X} does not match", family.name, raw);
            }
            Err(Error::Transfer { addr, reason }) => {
                log::trace!("{}: ID read at 0x{:08X} failed: {}", family.name, addr, reason);
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::UnknownTarget { cpuid })
}
