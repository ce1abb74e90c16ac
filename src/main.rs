//! mcuflash - Cortex-M on-chip flash programmer
//!
//! Drives the flash controller of a microcontroller through a debug probe:
//! erase, program, verify, option bytes and bank swapping.
//!
//! # Architecture
//!
//! The CLI builds three things before running a command:
//! - an [`EngineConfig`] from `--config` and the global flags
//! - a [`FamilyDatabase`] with the built-in families plus `--family-db`
//! - a [`ProbeRegistry`] with every compiled-in probe driver
//!
//! The probe named by `--probe` is opened and attached, and the command
//! runs on the resulting session.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, OptionsCommands};
use commands::{EraseSelection, IndicatifProgress};
use mcuflash_core::config::EngineConfig;
use mcuflash_core::family::FamilyDatabase;
use mcuflash_core::session::Session;
use mcuflash_probe::{BoxedProbe, ProbeRegistry};
use std::path::Path;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let registry = ProbeRegistry::with_defaults();

    let db = match load_family_database(cli.family_db.as_deref()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to load family database: {}", e);
            std::process::exit(1);
        }
    };
    log::debug!("Loaded {} family definitions", db.len());

    let config = load_config(&cli)?;

    match cli.command {
        Commands::ListProbes => {
            commands::list_probes(&registry);
            Ok(())
        }
        Commands::ListFamilies => {
            commands::list_families(&db);
            Ok(())
        }
        Commands::Info => {
            let mut session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_info(&mut session)
        }
        Commands::Read {
            output,
            start,
            length,
        } => {
            let mut session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_read(&mut session, &output, start, length)
        }
        Commands::Write {
            input,
            address,
            no_verify,
        } => {
            let mut session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_write(&mut session, &input, address, !no_verify)
        }
        Commands::Verify { input, address } => {
            let mut session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_verify(&mut session, &input, address)
        }
        Commands::Erase {
            sector,
            mask,
            start,
            length,
            all,
        } => {
            let selection = match (start, length, mask, all) {
                (Some(start), Some(length), _, _) => EraseSelection::Range { start, length },
                (_, _, Some(mask), _) => EraseSelection::Mask(mask),
                (_, _, _, true) => EraseSelection::All,
                _ => EraseSelection::Sectors(sector),
            };
            let mut session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_erase(&mut session, selection)
        }
        Commands::Options(OptionsCommands::Get { names }) => {
            let mut session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_options_get(&mut session, &names)
        }
        Commands::Options(OptionsCommands::Set { values, dry_run }) => {
            let session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_options_set(session, values, dry_run).map(drop)
        }
        Commands::SwapBanks => {
            let session = open_session(&registry, &cli.probe, db, config)?;
            commands::run_swap_banks(session).map(drop)
        }
    }
}

/// Built-in families, extended or overridden by a file or directory
fn load_family_database(path: Option<&Path>) -> Result<FamilyDatabase, Box<dyn std::error::Error>> {
    let mut db = FamilyDatabase::builtin()?;

    if let Some(path) = path {
        if path.is_dir() {
            let count = db.load_dir(path)?;
            log::debug!("Loaded {} families from {}", count, path.display());
        } else if path.is_file() {
            db.load_file(path)?;
        } else {
            return Err(format!("Family database path not found: {}", path.display()).into());
        }
    }

    Ok(db)
}

/// Configuration file (or defaults) with the global flags applied on top
fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(family) = &cli.family {
        config.family = Some(family.clone());
    }
    if cli.connect_under_reset {
        config.connect_under_reset = true;
    }
    log::debug!("Engine configuration: {:?}", config);
    Ok(config)
}

fn open_session(
    registry: &ProbeRegistry,
    probe: &str,
    db: FamilyDatabase,
    config: EngineConfig,
) -> Result<Session<BoxedProbe>, Box<dyn std::error::Error>> {
    let session = registry.open_session(probe, Arc::new(db), config)?;
    Ok(session.with_observer(Box::new(IndicatifProgress::new())))
}
