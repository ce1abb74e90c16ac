//! Scoped unlock of key-protected register groups
//!
//! An [`UnlockGuard`] writes the two-word key sequence when the group is
//! locked and sets the lock bit again when it goes out of scope, on every
//! exit path. The option-byte guard is created from the main-array guard and
//! borrows it, so the two always nest: main is entered first and released
//! last.

use crate::error::{Error, Result};
use crate::family::KeyPair;
use crate::probe::DebugProbe;
use crate::register::{Field, Registers};

/// A key-protected register group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    /// Name used in errors and logs ("flash", "option bytes")
    pub name: &'static str,
    /// Controller base address
    pub base: u32,
    /// Key register offset
    pub keyr: u32,
    /// Lock bit, set while the group is locked
    pub lock: Field,
    /// Unlock key sequence
    pub keys: KeyPair,
}

impl Lock {
    /// Check the lock bit
    pub fn is_locked<P: DebugProbe + ?Sized>(&self, probe: &mut P) -> Result<bool> {
        Registers::new(probe, self.base).is_set(self.lock)
    }

    fn unlock<P: DebugProbe + ?Sized>(&self, probe: &mut P) -> Result<()> {
        let mut regs = Registers::new(probe, self.base);
        if !regs.is_set(self.lock)? {
            log::trace!("{} already unlocked", self.name);
            return Ok(());
        }

        log::debug!("Unlocking {}", self.name);
        regs.write(self.keyr, self.keys.0)?;
        regs.write(self.keyr, self.keys.1)?;

        let raw = regs.read(self.lock.offset)?;
        if self.lock.extract(raw) != 0 {
            return Err(Error::UnlockFailed {
                register: self.name,
                status: raw,
            });
        }
        Ok(())
    }

    fn relock<P: DebugProbe + ?Sized>(&self, probe: &mut P) -> Result<()> {
        log::debug!("Locking {}", self.name);
        Registers::new(probe, self.base).set(self.lock, 1)
    }
}

/// Write permission on a register group, relocked on drop
pub struct UnlockGuard<'a, P: DebugProbe + ?Sized> {
    probe: &'a mut P,
    lock: Lock,
    armed: bool,
}

impl<'a, P: DebugProbe + ?Sized> UnlockGuard<'a, P> {
    /// Unlock `lock` (no-op if already unlocked)
    pub fn enter(probe: &'a mut P, lock: Lock) -> Result<Self> {
        lock.unlock(probe)?;
        Ok(Self {
            probe,
            lock,
            armed: true,
        })
    }

    /// Unlock `lock`, which on this controller requires `parent` to be
    /// unlocked first
    ///
    /// Fails with [`Error::LockOrder`] without writing any key when the
    /// parent is still locked.
    pub fn enter_nested(probe: &'a mut P, parent: &Lock, lock: Lock) -> Result<Self> {
        if parent.is_locked(probe)? {
            log::error!("{} unlock attempted with {} locked", lock.name, parent.name);
            return Err(Error::LockOrder);
        }
        Self::enter(probe, lock)
    }

    /// Unlock a dependent group while this one is held
    ///
    /// With `nested` set the hardware lock bit of this group is checked
    /// again first, in case something relocked it behind our back.
    pub fn options(&mut self, lock: Lock, nested: bool) -> Result<UnlockGuard<'_, P>> {
        if nested {
            UnlockGuard::enter_nested(&mut *self.probe, &self.lock, lock)
        } else {
            UnlockGuard::enter(&mut *self.probe, lock)
        }
    }

    /// Probe access while the group is unlocked
    pub fn probe(&mut self) -> &mut P {
        &mut *self.probe
    }

    /// Relock now and report failures
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.lock.relock(&mut *self.probe)
    }

    /// Forget the lock without writing it
    ///
    /// Only valid once the target has been reset, which relocks everything
    /// and may have taken the debug link down.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<P: DebugProbe + ?Sized> Drop for UnlockGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.lock.relock(&mut *self.probe) {
                log::warn!("Failed to relock {}: {}", self.lock.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{FLASH_KEYS, OPTION_KEYS};
    use crate::flash::testing::MockProbe;

    const BASE: u32 = 0x4002_2000;

    fn main_lock() -> Lock {
        Lock {
            name: "flash",
            base: BASE,
            keyr: 0x08,
            lock: Field::bit(0x14, 31),
            keys: FLASH_KEYS,
        }
    }

    fn option_lock() -> Lock {
        Lock {
            name: "option bytes",
            base: BASE,
            keyr: 0x0C,
            lock: Field::bit(0x14, 30),
            keys: OPTION_KEYS,
        }
    }

    #[test]
    fn test_unlock_and_relock() {
        let mut probe = MockProbe::stm32(BASE);
        {
            let guard = UnlockGuard::enter(&mut probe, main_lock()).unwrap();
            guard.release().unwrap();
        }
        assert_eq!(
            probe.key_writes(BASE + 0x08),
            vec![0x4567_0123, 0xCDEF_89AB]
        );
        assert!(probe.cr() & (1 << 31) != 0);
    }

    #[test]
    fn test_enter_is_idempotent() {
        let mut probe = MockProbe::stm32(BASE);
        probe.set_cr(0);
        let guard = UnlockGuard::enter(&mut probe, main_lock()).unwrap();
        drop(guard);
        assert!(probe.key_writes(BASE + 0x08).is_empty());
        // Exit locks even though the guard did not unlock
        assert!(probe.cr() & (1 << 31) != 0);
    }

    #[test]
    fn test_wrong_keys_fail() {
        let mut probe = MockProbe::stm32(BASE);
        let mut lock = main_lock();
        lock.keys = KeyPair(0x1111_1111, 0x2222_2222);
        let err = UnlockGuard::enter(&mut probe, lock).err().unwrap();
        assert!(matches!(
            err,
            Error::UnlockFailed {
                register: "flash",
                ..
            }
        ));
    }

    #[test]
    fn test_relock_on_error_path() {
        fn failing_op(probe: &mut MockProbe) -> Result<()> {
            let _guard = UnlockGuard::enter(probe, main_lock())?;
            Err(Error::Controller { status: 0x2 })
        }

        let mut probe = MockProbe::stm32(BASE);
        assert!(failing_op(&mut probe).is_err());
        assert!(probe.cr() & (1 << 31) != 0);
    }

    #[test]
    fn test_nested_options_lifo() {
        let mut probe = MockProbe::stm32(BASE);
        {
            let mut main = UnlockGuard::enter(&mut probe, main_lock()).unwrap();
            let options = main.options(option_lock(), true).unwrap();
            options.release().unwrap();
            main.release().unwrap();
        }
        assert_eq!(
            probe.key_writes(BASE + 0x0C),
            vec![0x0819_2A3B, 0x4C5D_6E7F]
        );
        assert!(probe.cr() & (3 << 30) == 3 << 30);
    }

    #[test]
    fn test_lock_order_violation() {
        let mut probe = MockProbe::stm32(BASE);
        let err = UnlockGuard::enter_nested(&mut probe, &main_lock(), option_lock())
            .err()
            .unwrap();
        assert!(matches!(err, Error::LockOrder));
        assert!(probe.key_writes(BASE + 0x0C).is_empty());
    }

    #[test]
    fn test_disarm_skips_relock() {
        let mut probe = MockProbe::stm32(BASE);
        let guard = UnlockGuard::enter(&mut probe, main_lock()).unwrap();
        guard.disarm();
        assert_eq!(probe.cr() & (1 << 31), 0);
    }
}
