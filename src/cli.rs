//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a sector mask as hex, binary or decimal
fn parse_mask(s: &str) -> Result<u64, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex mask: {}", e))
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).map_err(|e| format!("Invalid binary mask: {}", e))
    } else {
        s.parse::<u64>().map_err(|e| format!("Invalid mask: {}", e))
    }
}

/// Parse `name=value` for option assignments
fn parse_assignment(s: &str) -> Result<(String, u32), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("'{}' (expected name=value)", s))?;
    if name.is_empty() {
        return Err(format!("'{}' has no option name", s));
    }
    Ok((name.to_lowercase(), parse_hex_u32(value)?))
}

/// Generate dynamic help text for the probe argument
fn probe_help() -> String {
    format!(
        "Probe to use, as name[:key=value,...] [available: {}]",
        mcuflash_probe::ProbeRegistry::with_defaults().names_short()
    )
}

#[derive(Parser)]
#[command(name = "mcuflash")]
#[command(author, version, about = "Cortex-M on-chip flash programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Extra family definitions (.ron file or directory), on top of the built-in ones
    #[arg(long, global = true)]
    pub family_db: Option<PathBuf>,

    #[arg(short, long, global = true, default_value = "sim", help = probe_help())]
    pub probe: String,

    /// Skip identification and assume this family
    #[arg(long, global = true)]
    pub family: Option<String>,

    /// Hold the target in reset while connecting
    #[arg(long, global = true)]
    pub connect_under_reset: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Identify the target and show its flash configuration
    Info,

    /// Read flash contents to file
    Read {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Start address (default: start of flash)
        #[arg(long, value_parser = parse_hex_u32)]
        start: Option<u32>,

        /// Number of bytes (default: to the end of flash)
        #[arg(long, value_parser = parse_hex_u32)]
        length: Option<u32>,
    },

    /// Write file to flash, erasing as needed
    Write {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Target address (default: start of flash)
        #[arg(long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Skip the final read-back comparison
        #[arg(long)]
        no_verify: bool,
    },

    /// Verify flash contents against file
    Verify {
        /// Input file path to verify against
        #[arg(short, long)]
        input: PathBuf,

        /// Target address (default: start of flash)
        #[arg(long, value_parser = parse_hex_u32)]
        address: Option<u32>,
    },

    /// Erase flash sectors
    #[command(group(
        clap::ArgGroup::new("what")
            .required(true)
            .args(["sector", "mask", "start", "all"]),
    ))]
    Erase {
        /// Sector numbers (comma-separated)
        #[arg(long, value_delimiter = ',')]
        sector: Vec<u32>,

        /// Sector mask, bit i = sector i (hex, binary or decimal)
        #[arg(long, value_parser = parse_mask)]
        mask: Option<u64>,

        /// Start address of a range to erase
        #[arg(long, value_parser = parse_hex_u32, requires = "length")]
        start: Option<u32>,

        /// Length of the range to erase
        #[arg(long, value_parser = parse_hex_u32, requires = "start")]
        length: Option<u32>,

        /// Erase the whole main array
        #[arg(long)]
        all: bool,
    },

    /// Option byte operations
    #[command(subcommand)]
    Options(OptionsCommands),

    /// Toggle the bank-swap option and reset the target
    SwapBanks,

    /// List available probes
    ListProbes,

    /// List known MCU families
    ListFamilies,
}

/// Option-byte subcommands
#[derive(Subcommand)]
pub enum OptionsCommands {
    /// Show option values
    Get {
        /// Only these options (default: all)
        names: Vec<String>,
    },

    /// Change option values; the target resets
    Set {
        /// Assignments such as rdp=0xAA bor_lev=2
        #[arg(required = true, value_parser = parse_assignment)]
        values: Vec<(String, u32)>,

        /// Validate only, do not write
        #[arg(long)]
        dry_run: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("0b111").unwrap(), 7);
        assert_eq!(parse_mask("0x10").unwrap(), 16);
        assert_eq!(parse_mask("5").unwrap(), 5);
        assert!(parse_mask("0bz").is_err());
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("RDP=0xAA").unwrap(),
            ("rdp".to_string(), 0xAA)
        );
        assert_eq!(
            parse_assignment("bor_lev=2").unwrap(),
            ("bor_lev".to_string(), 2)
        );
        assert!(parse_assignment("rdp").is_err());
        assert!(parse_assignment("=1").is_err());
        assert!(parse_assignment("rdp=x").is_err());
    }

    #[test]
    fn test_erase_needs_selection() {
        assert!(Cli::try_parse_from(["mcuflash", "erase"]).is_err());
        assert!(Cli::try_parse_from(["mcuflash", "erase", "--start", "0x08000000"]).is_err());

        let cli = Cli::try_parse_from(["mcuflash", "erase", "--sector", "1,3"]).unwrap();
        match cli.command {
            Commands::Erase { sector, .. } => assert_eq!(sector, [1, 3]),
            _ => panic!("expected erase"),
        }
    }

    #[test]
    fn test_global_probe() {
        let cli = Cli::try_parse_from(["mcuflash", "info", "--probe", "sim:family=stm32h7"]).unwrap();
        assert_eq!(cli.probe, "sim:family=stm32h7");

        let cli = Cli::try_parse_from(["mcuflash", "info"]).unwrap();
        assert_eq!(cli.probe, "sim");
    }
}
