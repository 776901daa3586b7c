//! MOMENTUM Manager Library
//!
//! Command implementations for the `momentum` CLI, processor supervision and
//! application manifests.

pub mod commands;
pub mod manifest;
pub mod processor;

pub use manifest::Manifest;
pub use processor::{ProcessorInfo, ProcessorTable};
