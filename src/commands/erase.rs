//! Erase command implementation

use mcuflash_core::probe::DebugProbe;
use mcuflash_core::session::Session;

use super::CommandResult;

/// What to erase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseSelection {
    /// Individual sectors
    Sectors(Vec<u32>),
    /// Sector mask, bit i = sector i
    Mask(u64),
    /// Every sector touched by an address range
    Range { start: u32, length: u32 },
    /// The whole main array
    All,
}

/// Run the erase command
pub fn run_erase<P: DebugProbe>(session: &mut Session<P>, selection: EraseSelection) -> CommandResult {
    let mut flash = session.flash();

    match selection {
        EraseSelection::Sectors(sectors) => {
            for &sector in &sectors {
                flash.erase_sector(sector)?;
            }
            println!("Erased {} sectors", sectors.len());
        }
        EraseSelection::Mask(mask) => {
            flash.erase_sectors(mask)?;
            println!("Erased sectors in mask 0x{:X}", mask);
        }
        EraseSelection::Range { start, length } => {
            let count = flash.erase_range(start, length as usize)?;
            println!(
                "Erased {} sectors covering 0x{:08X}..0x{:08X}",
                count,
                start,
                start.wrapping_add(length)
            );
        }
        EraseSelection::All => {
            let count = flash.erase_all()?;
            println!("Erased all {} sectors", count);
        }
    }

    Ok(())
}
