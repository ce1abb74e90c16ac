//! Option byte commands

use mcuflash_core::error::Error;
use mcuflash_core::flash::{FlashVariant, OptionValues};
use mcuflash_core::probe::DebugProbe;
use mcuflash_core::session::Session;

use super::CommandResult;

fn print_options(options: &OptionValues) {
    for (name, value) in options {
        println!("{:<16} = 0x{:X}", name, value);
    }
}

/// Show all options, or only the named ones
pub fn run_options_get<P: DebugProbe>(session: &mut Session<P>, names: &[String]) -> CommandResult {
    let options = session.get_options()?;
    if names.is_empty() {
        print_options(&options);
        return Ok(());
    }

    let mut selected = OptionValues::new();
    for name in names {
        let name = name.to_lowercase();
        let value = options
            .get(&name)
            .copied()
            .ok_or_else(|| format!("Unknown option: {}", name))?;
        selected.insert(name, value);
    }
    print_options(&selected);
    Ok(())
}

/// Change options; the target resets and the reconnected session is returned
pub fn run_options_set<P: DebugProbe>(
    mut session: Session<P>,
    values: Vec<(String, u32)>,
    dry_run: bool,
) -> CommandResult<Session<P>> {
    let values: OptionValues = values.into_iter().collect();
    let staged = session.stage_options(&values)?;

    if dry_run {
        println!("Options valid, nothing written:");
        print_options(staged.changes());
        return Ok(session);
    }

    let mut session = session.commit_options(&staged).map_err(Error::from)?;
    println!("Options committed, target reconnected as {}", session.info());
    print_options(&session.get_options()?);
    Ok(session)
}

/// Toggle the bank-swap option and reconnect
pub fn run_swap_banks<P: DebugProbe>(session: Session<P>) -> CommandResult<Session<P>> {
    let session = session.swap_banks_and_reset_no_connect().map_err(Error::from)?;
    match session.device().variant() {
        FlashVariant::DualBank { swapped }
        | FlashVariant::SecureSplit { swapped, .. } => {
            println!("Banks {}", if swapped { "swapped" } else { "in natural order" });
        }
        _ => {}
    }
    Ok(session)
}
