//! Read command implementation

use mcuflash_core::probe::DebugProbe;
use mcuflash_core::session::Session;
use std::fs;
use std::path::Path;

use super::CommandResult;

/// Read `length` bytes from `start` (defaults: the whole main array) into a file
pub fn run_read<P: DebugProbe>(
    session: &mut Session<P>,
    output: &Path,
    start: Option<u32>,
    length: Option<u32>,
) -> CommandResult {
    let geometry = session.device().geometry();
    let start = start.unwrap_or(geometry.flash_base);
    let length = match length {
        Some(length) => length,
        None => (geometry.flash_base + geometry.size())
            .checked_sub(start)
            .ok_or_else(|| format!("0x{:08X} is past the end of flash", start))?,
    };

    let mut data = vec![0u8; length as usize];
    session.flash().read(start, &mut data)?;

    fs::write(output, &data)?;
    println!("Wrote {} bytes to {:?}", data.len(), output);

    Ok(())
}
