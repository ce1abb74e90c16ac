//! Info command implementation

use mcuflash_core::error::Error;
use mcuflash_core::flash::FlashVariant;
use mcuflash_core::probe::DebugProbe;
use mcuflash_core::session::Session;

use super::{format_size, CommandResult};

/// Show target identification, flash layout and option bytes
pub fn run_info<P: DebugProbe>(session: &mut Session<P>) -> CommandResult {
    println!("Target: {}", session.info());

    let device = session.device();
    let family = device.family();
    if !family.description.is_empty() {
        println!("  {}", family.description);
    }

    let geometry = device.geometry();
    println!(
        "Flash: {} at 0x{:08X}, {} sectors of {}",
        format_size(geometry.size()),
        geometry.flash_base,
        geometry.sector_count,
        format_size(geometry.sector_size)
    );
    if geometry.banks > 1 {
        println!(
            "  {} banks of {} sectors",
            geometry.banks, geometry.sectors_per_bank
        );
    }
    if let Some(otp) = &geometry.otp {
        println!("  OTP: {} at 0x{:08X}", format_size(otp.len), otp.base);
    }
    println!("  Program line: {} bytes", device.line_size());

    match device.variant() {
        FlashVariant::SingleBank => println!("  Controller: single bank"),
        FlashVariant::DualBank { swapped } => {
            println!("  Controller: dual bank{}", if swapped { ", swapped" } else { "" })
        }
        FlashVariant::SecureSplit { secure, swapped } => println!(
            "  Controller: {} register set{}",
            if secure { "secure" } else { "non-secure" },
            if swapped { ", swapped" } else { "" }
        ),
        FlashVariant::PulseVerify { budget } => println!(
            "  Controller: pulse-verify ({} program / {} erase pulses)",
            budget.max_programming_pulses, budget.max_erase_pulses
        ),
    }

    match session.get_options() {
        Ok(options) => {
            println!("Options:");
            for (name, value) in &options {
                println!("  {:<16} = 0x{:X}", name, value);
            }
        }
        Err(Error::Unsupported(_)) => println!("Options: none"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
