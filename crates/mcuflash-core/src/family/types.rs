//! Family descriptor types
//!
//! A [`FamilyDescriptor`] is everything the engine needs to know about one
//! MCU family: how to recognise it, its flash geometry, where the controller
//! registers live and which option fields exist. The same types are used
//! for the built-in table and for RON files loaded at runtime.

use crate::register::Field;
use serde::Deserialize;

/// Main-array unlock keys used by every STM32 family
pub const FLASH_KEYS: KeyPair = KeyPair(0x4567_0123, 0xCDEF_89AB);

/// Option-byte unlock keys used by every STM32 family
pub const OPTION_KEYS: KeyPair = KeyPair(0x0819_2A3B, 0x4C5D_6E7F);

/// Size specification with human-readable units (for RON parsing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Size {
    /// Size in bytes
    B(u32),
    /// Size in kibibytes (1024 bytes)
    KiB(u32),
    /// Size in mebibytes (1024 * 1024 bytes)
    MiB(u32),
}

impl Size {
    /// Convert to bytes
    pub fn to_bytes(self) -> u32 {
        match self {
            Size::B(n) => n,
            Size::KiB(n) => n * 1024,
            Size::MiB(n) => n * 1024 * 1024,
        }
    }
}

/// Two-word unlock key sequence, written in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KeyPair(pub u32, pub u32);

/// Identification register of a family
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdMatch {
    /// Absolute address of the ID register
    pub addr: u32,
    /// Bits of the register holding the device ID
    pub mask: u32,
    /// Accepted device IDs (after masking)
    pub values: Vec<u32>,
}

impl IdMatch {
    /// Check a raw register value against this family
    pub fn matches(&self, raw: u32) -> bool {
        self.values.contains(&(raw & self.mask))
    }
}

/// Register write that keeps debug clocks running in low-power modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DebugEnable {
    /// Absolute address of the debug control register
    pub addr: u32,
    /// Bits to set
    pub value: u32,
}

/// How the flash is split into banks
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum BankMode {
    /// One bank
    Single,
    /// Two equal banks
    Dual,
    /// Two banks when the named option bit is set, one otherwise
    Selectable(String),
}

/// One-time-programmable area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OtpDef {
    /// Absolute base address
    pub base: u32,
    /// Size of the area
    pub size: Size,
}

/// Flash geometry as described in the database
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GeometryDef {
    /// Address of the first main-array byte
    pub flash_base: u32,
    /// Total main-array size
    pub flash_size: Size,
    /// Sector size (single-bank size for selectable families)
    pub sector_size: Size,
    /// Sector size in dual-bank mode, if different
    #[serde(default)]
    pub dual_sector_size: Option<Size>,
    /// Bank organisation
    pub banks: BankMode,
    /// OTP area
    #[serde(default)]
    pub otp: Option<OtpDef>,
}

/// Register set used to lock, control and poll one bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BankRegs {
    /// Key register offset
    pub keyr: u32,
    /// Status register offset
    pub sr: u32,
    /// Control register offset
    pub cr: u32,
    /// Separate flag-clear register; status flags are write-1-to-clear in SR otherwise
    #[serde(default)]
    pub ccr: Option<u32>,
}

/// Program size selection written before programming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Psize {
    /// Field position in the control register
    pub shift: u8,
    /// Field width
    pub width: u8,
    /// Value to program
    pub value: u32,
}

/// Bit positions inside the control register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ControlBits {
    /// LOCK bit
    pub lock: u8,
    /// PG (program enable) bit
    pub pg: u8,
    /// PER/SER (sector erase request) bit
    pub erase: u8,
    /// STRT/START bit
    pub start: u8,
    /// Sector number field as (shift, width)
    pub sector: (u8, u8),
    /// Bank select bit for controllers shared by both banks
    #[serde(default)]
    pub bank_select: Option<u8>,
    /// Program size field
    #[serde(default)]
    pub psize: Option<Psize>,
}

/// Masks inside the status register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StatusBits {
    /// Any of these set means the controller is busy
    pub busy: u32,
    /// Any of these set after an operation is a failure
    pub errors: u32,
}

/// A register offset and a mask inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MaskedReg {
    /// Register offset
    pub offset: u32,
    /// Bits of interest
    pub mask: u32,
}

/// How committed option bytes are loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ResetMethod {
    /// Set the OBL_LAUNCH bit; the controller reloads options and resets
    ObLaunch(Field),
    /// Request a system reset through AIRCR
    SystemReset,
}

/// Option-byte registers and commit protocol
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OptionRegs {
    /// Option key register offset
    pub keyr: u32,
    /// Option unlock keys
    #[serde(default = "default_option_keys")]
    pub keys: KeyPair,
    /// OPTLOCK bit
    pub lock: Field,
    /// Option start bit
    pub start: Field,
    /// Busy flag polled after start
    pub busy: Field,
    /// Error flags checked after the commit
    pub errors: MaskedReg,
    /// Option unlock requires the main array to be unlocked first
    pub nested: bool,
    /// Register set whose lock gates the option lock, when it is not the
    /// first non-secure set
    #[serde(default)]
    pub parent: Option<BankRegs>,
    /// How the new values are loaded
    pub reset: ResetMethod,
    /// Registers holding the active values
    pub current: Vec<u32>,
    /// Registers staging the values to program
    pub program: Vec<u32>,
}

fn default_option_keys() -> KeyPair {
    OPTION_KEYS
}

fn default_flash_keys() -> KeyPair {
    FLASH_KEYS
}

/// STM32-style controller: key-locked, sector commit-and-poll
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Stm32Layout {
    /// Controller base address
    pub base: u32,
    /// Main-array unlock keys
    #[serde(default = "default_flash_keys")]
    pub keys: KeyPair,
    /// Register sets, one shared or one per bank
    pub banks: Vec<BankRegs>,
    /// Secure register sets, used when `secure_option` is set
    #[serde(default)]
    pub secure_banks: Option<Vec<BankRegs>>,
    /// Option bit enabling the secure register sets
    #[serde(default)]
    pub secure_option: Option<String>,
    /// Control register bits
    pub control: ControlBits,
    /// Status register masks
    pub status: StatusBits,
    /// Option bytes
    pub options: OptionRegs,
}

/// MSP432-style controller: mask erase with pulse-and-verify, burst program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Msp432Layout {
    /// FLCTL base address
    pub base: u32,
    /// Device descriptor (TLV) base address
    pub tlv_base: u32,
}

/// Flash controller kind and its register layout
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum ControllerDef {
    /// Key-locked sector commit-and-poll controller
    Stm32(Stm32Layout),
    /// Mask erase, pulse-and-verify controller
    Msp432(Msp432Layout),
}

/// Erase strategy implied by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseAlgorithm {
    /// One sector per command, poll, check error flags
    SectorCommit,
    /// Masked mass-erase pulses, each followed by a verify
    MaskPulseVerify,
}

/// Named option field
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OptionFieldDef {
    /// Lower-case option name
    pub name: String,
    /// Index into the current/program register lists
    pub register: usize,
    /// Bit position
    pub shift: u8,
    /// Width in bits
    pub width: u8,
}

/// Everything the engine knows about one MCU family
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FamilyDescriptor {
    /// Short family name (e.g. "stm32g4")
    pub name: String,
    /// Human readable description
    #[serde(default)]
    pub description: String,
    /// Cortex-M part number from CPUID
    pub cpu_part: u16,
    /// Identification register
    pub id: IdMatch,
    /// Debug clock enable written at attach
    #[serde(default)]
    pub debug_enable: Option<DebugEnable>,
    /// Flash geometry
    pub geometry: GeometryDef,
    /// Program line size in bytes
    pub line_size: u32,
    /// Controller layout
    pub controller: ControllerDef,
    /// Option fields
    #[serde(default)]
    pub option_fields: Vec<OptionFieldDef>,
    /// Option bit selecting the bank order
    #[serde(default)]
    pub swap_option: Option<String>,
}

/// Whether a `width`-bit field at `shift` fits in a 32-bit register
fn fits(shift: u8, width: u8) -> bool {
    width > 0 && shift as u32 + width as u32 <= 32
}

impl Stm32Layout {
    /// Name of the first register field that does not fit in 32 bits
    fn check_fields(&self) -> Result<(), &'static str> {
        let control = &self.control;
        let bits = [
            ("lock bit", control.lock),
            ("program bit", control.pg),
            ("erase bit", control.erase),
            ("start bit", control.start),
        ];
        if let Some((what, _)) = bits.into_iter().find(|&(_, bit)| !fits(bit, 1)) {
            return Err(what);
        }
        if control.bank_select.is_some_and(|bit| !fits(bit, 1)) {
            return Err("bank select bit");
        }
        if !fits(control.sector.0, control.sector.1) {
            return Err("sector field");
        }
        if let Some(psize) = control.psize {
            let field = Field::new(0, psize.shift, psize.width);
            if !fits(psize.shift, psize.width) || psize.value > field.max_value() {
                return Err("program size field");
            }
        }

        let options = &self.options;
        let launch = match options.reset {
            ResetMethod::ObLaunch(field) => Some(field),
            ResetMethod::SystemReset => None,
        };
        let fields = [
            ("option lock", Some(options.lock)),
            ("option start", Some(options.start)),
            ("option busy", Some(options.busy)),
            ("option launch", launch),
        ];
        for (what, field) in fields {
            if field.is_some_and(|f| !fits(f.shift, f.width)) {
                return Err(what);
            }
        }
        Ok(())
    }

    /// Register set that owns the option-byte commit
    ///
    /// Always a non-secure set: the option lock, start and load bits live
    /// in the non-secure control register even while the secure sets drive
    /// erase and program.
    pub fn option_parent(&self) -> Option<BankRegs> {
        self.options.parent.or_else(|| self.banks.first().copied())
    }
}

impl FamilyDescriptor {
    /// Erase strategy for this family
    pub fn erase_algorithm(&self) -> EraseAlgorithm {
        match self.controller {
            ControllerDef::Stm32(_) => EraseAlgorithm::SectorCommit,
            ControllerDef::Msp432(_) => EraseAlgorithm::MaskPulseVerify,
        }
    }

    /// Look up an option field by (lower-case) name
    pub fn option_field(&self, name: &str) -> Option<&OptionFieldDef> {
        self.option_fields.iter().find(|f| f.name == name)
    }

    /// Check internal consistency of the descriptor
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.line_size, 8 | 16 | 32 | 64) {
            return Err(format!(
                "{}: program line size {} is not 8, 16, 32 or 64",
                self.name, self.line_size
            ));
        }

        let flash_size = self.geometry.flash_size.to_bytes();
        let sector_size = self.geometry.sector_size.to_bytes();
        if sector_size == 0 || flash_size % sector_size != 0 {
            return Err(format!(
                "{}: flash size {} is not a multiple of sector size {}",
                self.name, flash_size, sector_size
            ));
        }

        if let Some(dual) = self.geometry.dual_sector_size {
            let dual = dual.to_bytes();
            if dual == 0 || flash_size % dual != 0 {
                return Err(format!(
                    "{}: flash size {} is not a multiple of dual-bank sector size {}",
                    self.name, flash_size, dual
                ));
            }
        }

        if let Some(field) = self.option_fields.iter().find(|f| !fits(f.shift, f.width)) {
            return Err(format!(
                "{}: option '{}' (shift {}, width {}) does not fit in 32 bits",
                self.name, field.name, field.shift, field.width
            ));
        }

        if let BankMode::Selectable(option) = &self.geometry.banks {
            if self.option_field(option).is_none() {
                return Err(format!(
                    "{}: bank mode option '{}' is not an option field",
                    self.name, option
                ));
            }
        }

        if let Some(swap) = &self.swap_option {
            if self.option_field(swap).is_none() {
                return Err(format!(
                    "{}: swap option '{}' is not an option field",
                    self.name, swap
                ));
            }
        }

        match &self.controller {
            ControllerDef::Stm32(layout) => {
                let registers = layout.options.current.len();
                if registers != layout.options.program.len() {
                    return Err(format!(
                        "{}: current and program option register lists differ in length",
                        self.name
                    ));
                }
                if let Some(field) = self.option_fields.iter().find(|f| f.register >= registers)
                {
                    return Err(format!(
                        "{}: option '{}' refers to register {} of {}",
                        self.name, field.name, field.register, registers
                    ));
                }
                layout.check_fields().map_err(|what| {
                    format!("{}: {} does not fit in a 32-bit register", self.name, what)
                })?;
                if layout.banks.is_empty() || layout.banks.len() > 2 {
                    return Err(format!("{}: expected one or two register sets", self.name));
                }
                if let Some(option) = &layout.secure_option {
                    if layout.secure_banks.is_none() || self.option_field(option).is_none() {
                        return Err(format!(
                            "{}: secure option '{}' needs secure register sets and an option field",
                            self.name, option
                        ));
                    }
                }
            }
            ControllerDef::Msp432(_) => {
                if self.line_size != 64 {
                    return Err(format!("{}: burst program line must be 64 bytes", self.name));
                }
                if flash_size / sector_size > 64 {
                    return Err(format!(
                        "{}: erase mask covers at most 64 sectors",
                        self.name
                    ));
                }
            }
        }

        Ok(())
    }
}
