use super::{for_each_best_effort, NAME_WIDTH};
use crate::processor::{ProcessorInfo, ProcessorTable};
use anyhow::{Context as _, Result};
use colored::*;
use momentum_core::MomentumConfig;

pub fn create_processor(config: &MomentumConfig, name: &str, command: &str) -> Result<()> {
    let info = ProcessorTable::new(config)
        .create_processor(name, command)
        .with_context(|| format!("Failed to create processor '{}'", name))?;
    log::info!("Processor '{}' running as pid {}", info.name, info.pid);
    Ok(())
}

pub fn remove_processors(config: &MomentumConfig, names: &[String]) -> Result<()> {
    let table = ProcessorTable::new(config);
    for_each_best_effort("processor removals", names, |name| table.remove_processor(name))
}

pub fn list_processors(config: &MomentumConfig) -> Result<()> {
    let processors = ProcessorTable::new(config)
        .list_processors()
        .context("Failed to list processors")?;
    print!("{}", format_processor_table(&processors));
    Ok(())
}

pub fn format_processor_table(processors: &[ProcessorInfo]) -> String {
    let mut out = format!("{:<width$}{}\n", "PROCESSOR_NAME", "COMMAND", width = NAME_WIDTH);
    for p in processors {
        let line = format!("{:<width$}{}", p.name, p.command, width = NAME_WIDTH);
        if p.is_running() {
            out.push_str(&line);
        } else {
            out.push_str(&format!("{} {}", line, "(exited)".dimmed()));
        }
        out.push('\n');
    }
    out
}
