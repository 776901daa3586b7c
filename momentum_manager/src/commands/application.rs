//! `momentum application start|stop`: bring a whole manifest up or down.
//!
//! Start order is streams, routes, processors so processors find their
//! streams; stop runs in reverse. Every step is best effort: a failure is
//! reported and the remaining entries are still processed.

use crate::manifest::Manifest;
use crate::processor::ProcessorTable;
use anyhow::Result;
use colored::*;
use momentum_core::{MomentumConfig, Registry};
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplicationReport {
    pub completed: Vec<String>,
    pub warnings: Vec<String>,
}

impl ApplicationReport {
    fn record<T, E: std::fmt::Display>(&mut self, what: String, result: Result<T, E>) {
        match result {
            Ok(_) => self.completed.push(what),
            Err(e) => self.warnings.push(format!("{}: {}", what, e)),
        }
    }
}

pub fn start_application(config: &MomentumConfig, manifest: &Manifest) -> ApplicationReport {
    let registry = Registry::new(config.clone());
    let processors = ProcessorTable::new(config);
    let mut report = ApplicationReport::default();

    for spec in &manifest.streams {
        report.record(
            format!("create stream '{}'", spec.name),
            registry.create_stream(spec),
        );
    }
    for route in &manifest.routes {
        report.record(
            format!("create route '{}'", route.name()),
            registry.create_route(route.name(), route.streams()),
        );
    }
    for processor in &manifest.processors {
        report.record(
            format!("start processor '{}'", processor.name),
            processors.create_processor(&processor.name, &processor.command),
        );
    }
    report
}

pub fn stop_application(config: &MomentumConfig, manifest: &Manifest) -> ApplicationReport {
    let registry = Registry::new(config.clone());
    let processors = ProcessorTable::new(config);
    let mut report = ApplicationReport::default();

    for processor in manifest.processors.iter().rev() {
        report.record(
            format!("stop processor '{}'", processor.name),
            processors.remove_processor(&processor.name),
        );
    }
    for route in manifest.routes.iter().rev() {
        report.record(
            format!("remove route '{}'", route.name()),
            registry.remove_route(route.name()),
        );
    }
    for spec in manifest.streams.iter().rev() {
        report.record(
            format!("remove stream '{}'", spec.name),
            registry.remove_stream(&spec.name),
        );
    }
    report
}

/// CLI entry: load `manifest_path` and run `start` or `stop`
pub fn run_application(config: &MomentumConfig, manifest_path: &Path, start: bool) -> Result<()> {
    let manifest = Manifest::from_file(manifest_path)?;
    let report = if start {
        start_application(config, &manifest)
    } else {
        stop_application(config, &manifest)
    };

    for done in &report.completed {
        log::info!("{}", done);
    }
    for warning in &report.warnings {
        eprintln!("{} {}", "Warning:".yellow().bold(), warning);
    }
    Ok(())
}
