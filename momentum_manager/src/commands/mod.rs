//! Implementations behind the `momentum` subcommands

pub mod application;
pub mod processor;
pub mod route;
pub mod stream;

use anyhow::{anyhow, Result};
use colored::*;
use momentum_core::MomentumResult;

/// Column layout shared by the listing commands
pub(crate) const NAME_WIDTH: usize = 24;
pub(crate) const FIELD_WIDTH: usize = 16;

/// Apply `op` to every name, reporting failures as warnings instead of stopping.
///
/// Returns an error naming how many failed, so the exit code still reflects them.
pub(crate) fn for_each_best_effort<F>(what: &str, names: &[String], mut op: F) -> Result<()>
where
    F: FnMut(&str) -> MomentumResult<()>,
{
    let mut failed = 0;
    for name in names {
        if let Err(e) = op(name) {
            eprintln!("{} {}", "Warning:".yellow().bold(), e);
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(anyhow!("{} of {} {} failed", failed, names.len(), what));
    }
    Ok(())
}
