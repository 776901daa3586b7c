//! Application manifests (`momentum.yaml`).
//!
//! ```yaml
//! processors:
//!   camera:
//!     command: ./camera --out mx://frames
//! streams:
//!   frames:
//!     buffer_size: 1048576
//!     buffer_count: 8
//!     broadcast: false
//! routes:
//!   - video
//!   - name: all
//!     streams: [frames]
//! ```
//!
//! Entries keep the order in which they appear in the file.

use anyhow::{bail, Context as _, Result};
use momentum_core::StreamSpec;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Defaults applied to streams that leave out their shape
pub const DEFAULT_BUFFER_SIZE: usize = 65536;
pub const DEFAULT_BUFFER_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorEntry {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RouteEntry {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        streams: Vec<String>,
    },
}

impl RouteEntry {
    pub fn name(&self) -> &str {
        match self {
            RouteEntry::Name(name) | RouteEntry::Full { name, .. } => name,
        }
    }

    pub fn streams(&self) -> &[String] {
        match self {
            RouteEntry::Name(_) => &[],
            RouteEntry::Full { streams, .. } => streams,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamFields {
    buffer_size: Option<usize>,
    buffer_count: Option<usize>,
    broadcast: Option<bool>,
    #[serde(default)]
    drop_oldest: bool,
}

#[derive(Debug, Deserialize)]
struct ProcessorFields {
    command: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    processors: Mapping,
    #[serde(default)]
    streams: Mapping,
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    pub processors: Vec<ProcessorEntry>,
    pub streams: Vec<StreamSpec>,
    pub routes: Vec<RouteEntry>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read manifest {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_yaml::from_str(contents)?;
        let raw: RawManifest = if value.is_null() {
            RawManifest::default()
        } else {
            serde_yaml::from_value(value)?
        };

        let mut processors = Vec::new();
        for (key, value) in raw.processors {
            let name = key_name(&key)?;
            let fields: ProcessorFields = serde_yaml::from_value(value)
                .with_context(|| format!("processor '{}'", name))?;
            processors.push(ProcessorEntry {
                name,
                command: fields.command,
            });
        }

        let mut streams = Vec::new();
        for (key, value) in raw.streams {
            let name = key_name(&key)?;
            let fields: StreamFields = if value.is_null() {
                StreamFields::default()
            } else {
                serde_yaml::from_value(value).with_context(|| format!("stream '{}'", name))?
            };
            streams.push(StreamSpec {
                name,
                buffer_size: fields.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
                buffer_count: fields.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT),
                broadcast: fields.broadcast.unwrap_or(true),
                drop_oldest: fields.drop_oldest,
            });
        }

        Ok(Self {
            processors,
            streams,
            routes: raw.routes,
        })
    }
}

fn key_name(key: &Value) -> Result<String> {
    match key {
        Value::String(name) => Ok(name.clone()),
        other => bail!("expected a name, found {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_manifest() {
        let manifest = Manifest::from_yaml(
            r#"
processors:
  writer:
    command: ./writer mx://frames
  reader:
    command: ./reader
streams:
  frames:
    buffer_size: 1024
    buffer_count: 4
    broadcast: false
  audio:
routes:
  - plain
  - name: video
    streams: [frames, mx://audio]
"#,
        )
        .unwrap();

        let names: Vec<&str> = manifest.processors.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["writer", "reader"]);
        assert_eq!(manifest.processors[0].command, "./writer mx://frames");

        assert_eq!(manifest.streams.len(), 2);
        let frames = &manifest.streams[0];
        assert_eq!((frames.buffer_size, frames.buffer_count), (1024, 4));
        assert!(!frames.broadcast);
        let audio = &manifest.streams[1];
        assert_eq!(audio.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(audio.buffer_count, DEFAULT_BUFFER_COUNT);
        assert!(audio.broadcast);

        assert_eq!(manifest.routes[0], RouteEntry::Name("plain".to_string()));
        assert_eq!(manifest.routes[1].name(), "video");
        assert_eq!(manifest.routes[1].streams(), ["frames", "mx://audio"]);
    }

    #[test]
    fn test_empty_manifest() {
        assert_eq!(Manifest::from_yaml("").unwrap(), Manifest::default());
        assert_eq!(Manifest::from_yaml("routes: []").unwrap(), Manifest::default());
    }

    #[test]
    fn test_processor_without_command_rejected() {
        assert!(Manifest::from_yaml("processors:\n  broken: {}\n").is_err());
        assert!(Manifest::from_yaml("streams: [a, b]\n").is_err());
    }
}
