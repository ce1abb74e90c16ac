//! mcuflash-sim - Simulated target for testing
//!
//! [`SimTarget`] emulates a microcontroller described by a family
//! descriptor: its flash array, identification registers and flash
//! controller, with fault injection for the failure paths the engine has to
//! handle (stuck sectors, weak bits, wedged controllers, links that drop on
//! reset). [`SimProbe`] gives the engine access to it through the ordinary
//! [`DebugProbe`] trait.
//!
//! The target lives behind an `Arc<Mutex<_>>` so tests can keep a handle
//! and inspect it after the probe has been moved into a session.

mod msp432;
mod stm32;
mod target;

use std::sync::{Arc, Mutex, MutexGuard};

use mcuflash_core::error::Result;
use mcuflash_core::probe::DebugProbe;

pub use target::{Faults, ResetLink, SimStats, SimTarget, WeakBits};

/// Shared handle to a simulated target
pub type SharedTarget = Arc<Mutex<SimTarget>>;

/// Debug probe connected to a [`SimTarget`]
#[derive(Debug, Clone)]
pub struct SimProbe {
    target: SharedTarget,
}

impl SimProbe {
    /// Connect to a new simulated target
    pub fn new(target: SimTarget) -> Self {
        Self::shared(Arc::new(Mutex::new(target)))
    }

    /// Connect to an existing shared target
    pub fn shared(target: SharedTarget) -> Self {
        Self { target }
    }

    /// Handle to the target for later inspection
    pub fn target(&self) -> SharedTarget {
        Arc::clone(&self.target)
    }

    /// Run `f` on the target
    pub fn with_target<R>(&self, f: impl FnOnce(&mut SimTarget) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, SimTarget> {
        // A test that panicked mid-access leaves the state as it was
        self.target.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DebugProbe for SimProbe {
    fn read32(&mut self, addr: u32) -> Result<u32> {
        let value = self.lock().read32(addr)?;
        log::trace!("sim: read32(0x{:08X}) = 0x{:08X}", addr, value);
        Ok(value)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        log::trace!("sim: write32(0x{:08X}, 0x{:08X})", addr, value);
        self.lock().write32(addr, value)
    }

    fn read_bulk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        log::trace!("sim: read {} bytes at 0x{:08X}", buf.len(), addr);
        self.lock().read_bulk(addr, buf)
    }

    fn write_bulk(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        log::trace!("sim: write {} bytes at 0x{:08X}", data.len(), addr);
        self.lock().write_bulk(addr, data)
    }

    fn is_halted(&mut self) -> Result<bool> {
        self.lock().is_halted()
    }

    fn halt(&mut self) -> Result<()> {
        self.lock().halt()
    }

    fn resume(&mut self) -> Result<()> {
        self.lock().resume()
    }

    fn reprobe(&mut self, connect_under_reset: bool) -> Result<()> {
        log::debug!("sim: reprobe");
        self.lock().reprobe(connect_under_reset)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.lock().delay(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcuflash_core::config::EngineConfig;
    use mcuflash_core::error::Error;
    use mcuflash_core::family::FamilyDatabase;
    use mcuflash_core::flash::{FlashObserver, FlashVariant, OptionValues, WriteStats};
    use mcuflash_core::session::{reconnect_probe, ResetError, Session};

    fn db() -> Arc<FamilyDatabase> {
        Arc::new(FamilyDatabase::builtin().unwrap())
    }

    fn sim(name: &str) -> SimTarget {
        SimTarget::new(db().find(name).unwrap())
    }

    fn options(pairs: &[(&str, u32)]) -> OptionValues {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_identify_every_family() {
        let db = db();
        for family in db.families() {
            let probe = SimProbe::new(SimTarget::new(family));
            let session = Session::attach(probe, db.clone(), EngineConfig::default()).unwrap();
            assert_eq!(session.info().family, family.name);
            assert_eq!(session.info().cpu_part, family.cpu_part);
        }
    }

    #[test]
    fn test_attach_halts_and_enables_debug() {
        let probe = SimProbe::new(sim("stm32g4"));
        let target = probe.target();
        let mut session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        assert!(target.lock().unwrap().halted());
        assert_eq!(session.probe().read32(0xE004_2004).unwrap() & 0x6, 0x6);
        assert_eq!(session.info().device_id, 0x468);

        session.resume().unwrap();
        assert!(!target.lock().unwrap().halted());
    }

    #[test]
    fn test_forced_family() {
        let config = EngineConfig {
            family: Some("stm32l4".into()),
            ..EngineConfig::default()
        };
        let probe = SimProbe::new(sim("stm32l4"));
        let session = Session::attach(probe, db(), config).unwrap();
        assert_eq!(session.info().family, "stm32l4");
        assert_eq!(session.info().device_id, 0);

        let config = EngineConfig {
            family: Some("nope".into()),
            ..EngineConfig::default()
        };
        let probe = SimProbe::new(sim("stm32l4"));
        assert!(matches!(
            Session::attach(probe, db(), config),
            Err(Error::Database(_))
        ));
    }

    #[test]
    fn test_unknown_target() {
        let probe = SimProbe::new(sim("stm32h7"));
        let empty = Arc::new(FamilyDatabase::new());
        let err = Session::attach(probe, empty, EngineConfig::default()).err();
        assert!(matches!(err, Some(Error::UnknownTarget { .. })));
    }

    #[test]
    fn test_option_round_trip_across_reset() {
        let probe = SimProbe::new(sim("stm32g4"));
        let target = probe.target();
        let session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        let mut session = session
            .set_options(&options(&[("rdp", 0xAA), ("bor_lev", 2)]))
            .unwrap();

        let values = session.get_options().unwrap();
        assert_eq!(values["rdp"], 0xAA);
        assert_eq!(values["bor_lev"], 2);

        let stats = target.lock().unwrap().stats.clone();
        assert_eq!(stats.option_commits, 1);
        assert_eq!(stats.resets, 1);
        assert_eq!(stats.reprobes, 1);
        assert!(target.lock().unwrap().locked());
    }

    #[test]
    fn test_option_commit_by_system_reset() {
        let mut target = sim("stm32h7");
        target.faults.reset_link = ResetLink::DropsSilently;
        let probe = SimProbe::new(target);
        let shared = probe.target();
        let session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        let mut session = session
            .set_options(&options(&[("boot_add0", 0x0810)]))
            .unwrap();
        assert_eq!(session.get_options().unwrap()["boot_add0"], 0x0810);
        assert_eq!(session.get_options().unwrap()["rdp"], 0xAA);
        assert_eq!(shared.lock().unwrap().stats.resets, 1);
    }

    #[test]
    fn test_invalid_option_writes_nothing() {
        let probe = SimProbe::new(sim("stm32g4"));
        let target = probe.target();
        let mut session = Session::attach(probe, db(), EngineConfig::default()).unwrap();
        let before = target.lock().unwrap().stats.writes;

        let err = session
            .stage_options(&options(&[("rdp", 0xAA), ("bogus", 1)]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(ref names) if names == &["bogus".to_string()]));

        let err = session.stage_options(&options(&[("bor_lev", 8)])).unwrap_err();
        assert!(matches!(err, Error::OptionValue { width: 3, .. }));

        let err = session.set_options(&options(&[("bogus", 1)])).err();
        assert!(matches!(err, Some(ResetError { error: Error::InvalidOptions(_), .. })));
        assert_eq!(target.lock().unwrap().stats.writes, before);
        assert_eq!(target.lock().unwrap().stats.resets, 0);
    }

    #[test]
    fn test_rejected_options_keep_session() {
        let probe = SimProbe::new(sim("stm32g4"));
        let target = probe.target();
        let session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        let (error, session) = match session.set_options(&options(&[("bor_levv", 1)])) {
            Ok(_) => panic!("typo accepted"),
            Err(e) => e.into_parts(),
        };
        assert!(matches!(error, Error::InvalidOptions(ref names) if names == &["bor_levv".to_string()]));

        // The same session is still attached and can retry
        let mut session = session.unwrap();
        assert_eq!(session.get_options().unwrap()["bor_lev"], 0);
        let mut session = session.set_options(&options(&[("bor_lev", 1)])).unwrap();
        assert_eq!(session.get_options().unwrap()["bor_lev"], 1);
        assert_eq!(target.lock().unwrap().stats.resets, 1);
    }

    #[test]
    fn test_option_round_trip_with_trustzone() {
        let probe = SimProbe::new(sim("stm32u5").with_option("tzen", 1));
        let target = probe.target();
        let session = Session::attach(probe, db(), EngineConfig::default()).unwrap();
        assert!(matches!(
            session.device().variant(),
            FlashVariant::SecureSplit { secure: true, .. }
        ));

        let mut session = session.set_options(&options(&[("bor_lev", 1)])).unwrap();
        let values = session.get_options().unwrap();
        assert_eq!(values["bor_lev"], 1);
        assert_eq!(values["tzen"], 1);

        let target = target.lock().unwrap();
        assert_eq!(target.stats.option_commits, 1);
        assert!(target.locked());
    }

    #[test]
    fn test_swap_banks() {
        let probe = SimProbe::new(sim("stm32g4"));
        let target = probe.target();
        let mut session = Session::attach(probe, db(), EngineConfig::default()).unwrap();
        assert_eq!(session.device().variant(), FlashVariant::DualBank { swapped: false });

        session.flash().program(0x0800_0000, &[0x5A; 8]).unwrap();

        let mut session = session.swap_banks_and_reset_no_connect().unwrap();
        assert_eq!(session.device().variant(), FlashVariant::DualBank { swapped: true });
        assert_eq!(session.get_options().unwrap()["bfb2"], 1);

        // Bank 1 of the old mapping is now at the top of flash
        let mut buf = [0u8; 8];
        session.flash().read(0x0804_0000, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 8]);
        session.flash().read(0x0800_0000, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);
        assert_eq!(target.lock().unwrap().option("bfb2"), Some(1));
    }

    #[test]
    fn test_swap_banks_needs_dual_bank() {
        let probe = SimProbe::new(sim("stm32g4").with_option("dbank", 0));
        let session = Session::attach(probe, db(), EngineConfig::default()).unwrap();
        let err = session.swap_banks_and_reset_no_connect().err();
        let (error, session) = err.map(ResetError::into_parts).unwrap();
        assert!(matches!(error, Error::Unsupported("bank swap")));
        assert_eq!(session.unwrap().get_options().unwrap()["dbank"], 0);
    }

    /// Erase calls as (`erasing` totals, `erase_progress` values)
    type EraseCalls = Arc<Mutex<(Vec<usize>, Vec<usize>)>>;

    struct EraseLog(EraseCalls);

    impl FlashObserver for EraseLog {
        fn reading(&mut self, _total_bytes: usize) {}
        fn read_progress(&mut self, _bytes_read: usize) {}
        fn erasing(&mut self, sectors_to_erase: usize) {
            self.0.lock().unwrap().0.push(sectors_to_erase);
        }
        fn erase_progress(&mut self, sectors_erased: usize) {
            self.0.lock().unwrap().1.push(sectors_erased);
        }
        fn writing(&mut self, _bytes_to_write: usize) {}
        fn write_progress(&mut self, _bytes_written: usize) {}
        fn complete(&mut self, _stats: &WriteStats) {}
    }

    fn logged_session(family: &str) -> (Session<SimProbe>, EraseCalls, SharedTarget) {
        let probe = SimProbe::new(sim(family));
        let target = probe.target();
        let calls = EraseCalls::default();
        let session = Session::attach(probe, db(), EngineConfig::default())
            .unwrap()
            .with_observer(Box::new(EraseLog(Arc::clone(&calls))));
        (session, calls, target)
    }

    #[test]
    fn test_erase_progress_reported_once_per_step() {
        let (mut session, calls, target) = logged_session("stm32g4");
        session.flash().erase_sectors(0b1011).unwrap();
        session.flash().erase_range(0x0800_0000, 0x1000).unwrap();

        let (started, progress) = calls.lock().unwrap().clone();
        assert_eq!(started, [3, 2]);
        assert_eq!(progress, [1, 2, 3, 1, 2]);
        assert_eq!(target.lock().unwrap().stats.sector_erases.len(), 5);

        // One batch on a pulse-verify controller
        let (mut session, calls, _) = logged_session("msp432p4");
        session.flash().erase_sectors(0b111).unwrap();

        let (started, progress) = calls.lock().unwrap().clone();
        assert_eq!(started, [3]);
        assert_eq!(progress, [3]);
    }

    #[test]
    fn test_reconnect_survives() {
        let mut target = sim("stm32g0");
        target.faults.reset_link = ResetLink::Survives;
        let probe = SimProbe::new(target);
        let shared = probe.target();
        let session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        let mut session = session.set_options(&options(&[("borf_lev", 1)])).unwrap();
        assert_eq!(session.get_options().unwrap()["borf_lev"], 1);
        assert_eq!(shared.lock().unwrap().stats.reprobes, 0);
    }

    #[test]
    fn test_reconnect_retries_reprobe() {
        let mut target = sim("stm32g4");
        target.faults.reprobe_failures = 3;
        let probe = SimProbe::new(target);
        let shared = probe.target();
        let config = EngineConfig {
            reconnect_interval_ms: 25,
            ..EngineConfig::default()
        };
        let session = Session::attach(probe, db(), config).unwrap();

        session.set_options(&options(&[("bor_lev", 1)])).unwrap();
        let stats = shared.lock().unwrap().stats.clone();
        assert_eq!(stats.reprobes, 4);
        assert_eq!(stats.delay_ms, 75);
    }

    #[test]
    fn test_reconnect_gives_up() {
        let mut target = sim("stm32g4");
        target.faults.reprobe_failures = 10;
        let probe = SimProbe::new(target);
        let config = EngineConfig {
            reconnect_attempts: Some(2),
            ..EngineConfig::default()
        };
        let session = Session::attach(probe, db(), config).unwrap();

        let err = session.set_options(&options(&[("bor_lev", 1)])).err();
        assert!(matches!(
            err,
            Some(ResetError { error: Error::ReconnectFailed { attempts: 2 }, session: None })
        ));
    }

    #[test]
    fn test_reconnect_probe_on_live_link() {
        let probe = SimProbe::new(sim("stm32g4"));
        let shared = probe.target();
        reconnect_probe(probe, &EngineConfig::default()).unwrap();
        assert_eq!(shared.lock().unwrap().stats.reprobes, 0);
    }

    #[test]
    fn test_write_with_fallback() {
        let mut target = sim("stm32g4");
        target.load(0x0800_1000, &[0x00; 16]);
        let probe = SimProbe::new(target);
        let shared = probe.target();
        let mut session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        // Unaligned write over programmed data
        let data = [0xA5u8; 13];
        let stats = session.flash().write(0x0800_1003, &data).unwrap();
        assert!(stats.used_fallback);
        assert_eq!(stats.sectors_erased, 1);

        let back = shared.lock().unwrap().peek(0x0800_1000, 24);
        assert_eq!(&back[..3], &[0x00; 3]);
        assert_eq!(&back[3..16], &data);
        assert_eq!(&back[16..], &[0xFF; 8]);
        assert!(shared.lock().unwrap().locked());
    }

    #[test]
    fn test_write_fast_path() {
        let probe = SimProbe::new(sim("stm32wb55"));
        let mut session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        let data: Vec<u8> = (0..100u8).collect();
        let stats = session.flash().write(0x0800_2000, &data).unwrap();
        assert!(!stats.used_fallback);
        assert_eq!(stats.bytes_written, 104);
        session.flash().verify(0x0800_2000, &data).unwrap();
    }

    #[test]
    fn test_erase_range_and_all() {
        let mut target = sim("stm32g0");
        target.load(0x0800_0000, &[0u8; 0x2000]);
        let probe = SimProbe::new(target);
        let shared = probe.target();
        let mut session = Session::attach(probe, db(), EngineConfig::default()).unwrap();

        assert_eq!(session.flash().erase_range(0x0800_07FF, 2).unwrap(), 2);
        let erased = shared.lock().unwrap().stats.sector_erases.clone();
        assert_eq!(erased, vec![(0, 0), (0, 1)]);

        let count = session.device().geometry().sector_count as usize;
        assert_eq!(session.flash().erase_all().unwrap(), count);
        assert!(shared.lock().unwrap().peek(0x0800_0000, 0x2000).iter().all(|&b| b == 0xFF));

        let err = session.flash().erase_range(0x0802_0000, 1).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
    }
}
