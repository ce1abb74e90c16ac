//! Write and verify command implementation

use mcuflash_core::probe::DebugProbe;
use mcuflash_core::session::Session;
use std::fs;
use std::path::Path;

use super::CommandResult;

fn load_image<P: DebugProbe>(
    session: &Session<P>,
    input: &Path,
    address: Option<u32>,
) -> CommandResult<(u32, Vec<u8>)> {
    let data = fs::read(input)?;
    let address = address.unwrap_or(session.device().geometry().flash_base);
    log::info!("Loaded {} bytes from {:?}", data.len(), input);
    Ok((address, data))
}

/// Write a file to flash, then read it back unless `verify` is off
pub fn run_write<P: DebugProbe>(
    session: &mut Session<P>,
    input: &Path,
    address: Option<u32>,
    verify: bool,
) -> CommandResult {
    let (address, data) = load_image(session, input, address)?;
    if data.is_empty() {
        println!("Nothing to write");
        return Ok(());
    }

    let mut flash = session.flash();
    flash.write(address, &data)?;

    if verify {
        flash.verify(address, &data)?;
        println!("Verified {} bytes at 0x{:08X}", data.len(), address);
    }

    Ok(())
}

/// Compare flash against a file
pub fn run_verify<P: DebugProbe>(
    session: &mut Session<P>,
    input: &Path,
    address: Option<u32>,
) -> CommandResult {
    let (address, data) = load_image(session, input, address)?;
    session.flash().verify(address, &data)?;
    println!("Verified {} bytes at 0x{:08X}", data.len(), address);
    Ok(())
}
