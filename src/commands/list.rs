//! List commands implementation

use mcuflash_core::family::{ControllerDef, FamilyDatabase};
use mcuflash_probe::ProbeRegistry;

/// List all available probes
pub fn list_probes(registry: &ProbeRegistry) {
    println!("Available probes:");
    println!();
    for info in registry.list() {
        let aliases = if info.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", info.aliases.join(", "))
        };
        println!("  {:<10} - {}{}", info.name, info.description, aliases);
    }
}

/// List all known families
pub fn list_families(db: &FamilyDatabase) {
    println!("Known MCU families:");
    println!();
    println!(
        "{:<12} {:>6} {:>10} {:>10} {:>5}  {:<8} {}",
        "Family", "Part", "Flash", "Sector", "Line", "Control", "Description"
    );
    println!("{}", "-".repeat(78));

    for family in db.iter() {
        let controller = match family.controller {
            ControllerDef::Stm32(_) => "sector",
            ControllerDef::Msp432(_) => "pulse",
        };
        println!(
            "{:<12} {:>#6x} {:>10} {:>10} {:>5}  {:<8} {}",
            family.name,
            family.cpu_part,
            format_size(family.geometry.flash_size.to_bytes()),
            format_size(family.geometry.sector_size.to_bytes()),
            family.line_size,
            controller,
            family.description
        );
    }
}

/// Human readable byte count
pub fn format_size(bytes: u32) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MiB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{} B", bytes)
    }
}
