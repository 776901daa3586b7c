use super::{for_each_best_effort, NAME_WIDTH};
use anyhow::{Context as _, Result};
use momentum_core::{MomentumConfig, Registry};

pub fn create_routes(config: &MomentumConfig, names: &[String]) -> Result<()> {
    let registry = Registry::new(config.clone());
    for name in names {
        registry
            .create_route::<&str>(name, &[])
            .with_context(|| format!("Failed to create route '{}'", name))?;
    }
    Ok(())
}

pub fn remove_routes(config: &MomentumConfig, names: &[String]) -> Result<()> {
    let registry = Registry::new(config.clone());
    for_each_best_effort("route removals", names, |name| registry.remove_route(name))
}

pub fn attach_streams(config: &MomentumConfig, route: &str, streams: &[String]) -> Result<()> {
    let registry = Registry::new(config.clone());
    for stream in streams {
        registry
            .attach_stream(route, stream)
            .with_context(|| format!("Failed to attach '{}' to route '{}'", stream, route))?;
    }
    Ok(())
}

pub fn list_routes(config: &MomentumConfig) -> Result<()> {
    let registry = Registry::new(config.clone());
    let routes = registry.list_routes().context("Failed to list routes")?;
    println!("{:<width$}", "ROUTE", width = NAME_WIDTH);
    for route in routes {
        println!("{:<width$}", route, width = NAME_WIDTH);
    }
    Ok(())
}
