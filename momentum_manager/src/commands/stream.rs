use super::{for_each_best_effort, FIELD_WIDTH, NAME_WIDTH};
use anyhow::{Context as _, Result};
use momentum_core::{MomentumConfig, Registry, StreamInfo, StreamSpec};

pub fn create_streams(config: &MomentumConfig, names: &[String], template: &StreamSpec) -> Result<()> {
    let registry = Registry::new(config.clone());
    for name in names {
        let spec = StreamSpec {
            name: name.clone(),
            ..template.clone()
        };
        let info = registry
            .create_stream(&spec)
            .with_context(|| format!("Failed to create stream '{}'", name))?;
        log::info!(
            "Created stream '{}' ({} bytes total)",
            info.name,
            info.total_memory
        );
    }
    Ok(())
}

pub fn remove_streams(config: &MomentumConfig, names: &[String]) -> Result<()> {
    let registry = Registry::new(config.clone());
    for_each_best_effort("stream removals", names, |name| registry.remove_stream(name))
}

pub fn list_streams(config: &MomentumConfig) -> Result<()> {
    let registry = Registry::new(config.clone());
    let streams = registry.list_streams().context("Failed to list streams")?;
    print!("{}", format_stream_table(&streams));
    Ok(())
}

pub fn format_stream_table(streams: &[StreamInfo]) -> String {
    let mut out = format!(
        "{:<nw$}{:<fw$}{:<fw$}{}\n",
        "STREAM_NAME",
        "BUFFER_SIZE",
        "BUFFER_COUNT",
        "TOTAL_MEMORY",
        nw = NAME_WIDTH,
        fw = FIELD_WIDTH
    );
    for s in streams {
        out.push_str(&format!(
            "{:<nw$}{:<fw$}{:<fw$}{}\n",
            s.name,
            s.buffer_size,
            s.buffer_count,
            s.total_memory,
            nw = NAME_WIDTH,
            fw = FIELD_WIDTH
        ));
    }
    out
}
