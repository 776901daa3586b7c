//! Administrative view of streams and routes: create, remove and list them
//! without keeping anything mapped.

use crate::communication::{RouteTable, StreamOptions};
use crate::config::MomentumConfig;
use crate::error::{MomentumError, MomentumResult, ResourceKind};
use crate::memory::{stream_object_name, Backpressure, BufferPool, ShmRegion};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;

/// Everything needed to create a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub buffer_size: usize,
    pub buffer_count: usize,
    #[serde(default = "default_broadcast")]
    pub broadcast: bool,
    #[serde(default)]
    pub drop_oldest: bool,
}

fn default_broadcast() -> bool {
    true
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, buffer_size: usize, buffer_count: usize) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            buffer_count,
            broadcast: true,
            drop_oldest: false,
        }
    }

    pub fn options(&self) -> StreamOptions {
        StreamOptions::new(self.buffer_size, self.buffer_count)
            .broadcast(self.broadcast)
            .backpressure(if self.drop_oldest {
                Backpressure::DropOldest
            } else {
                Backpressure::Block
            })
    }
}

/// One row of `list_streams`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub buffer_size: usize,
    pub buffer_count: usize,
    pub broadcast: bool,
    pub total_memory: usize,
}

#[derive(Debug, Clone)]
pub struct Registry {
    config: MomentumConfig,
    routes: RouteTable,
}

impl Registry {
    pub fn new(config: MomentumConfig) -> Self {
        let routes = RouteTable::new(&config.run_path);
        Self { config, routes }
    }

    pub fn config(&self) -> &MomentumConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Create a stream segment; `AlreadyExists` if one is present
    pub fn create_stream(&self, spec: &StreamSpec) -> MomentumResult<StreamInfo> {
        let name = stream_object_name(&spec.name)?;
        let options = spec.options();
        let pool = BufferPool::create_or_attach(&self.config.data_path, &name, options.pool_config()?);
        let pool = match pool {
            Ok(pool) => pool,
            // An existing stream with another shape is still "already exists" to an admin
            Err(MomentumError::ConfigMismatch { .. }) => {
                return Err(MomentumError::already_exists(ResourceKind::Stream, name));
            }
            Err(e) => return Err(e),
        };
        if !pool.is_owner() {
            return Err(MomentumError::already_exists(ResourceKind::Stream, name));
        }

        let shape = pool.shape();
        Ok(StreamInfo {
            name,
            buffer_size: shape.buffer_size,
            buffer_count: shape.buffer_count,
            broadcast: options.broadcast,
            total_memory: shape.total_size()?,
        })
    }

    /// Destroy a stream segment; `ResourceBusy` while any process has it open
    pub fn remove_stream(&self, name: &str) -> MomentumResult<()> {
        let name = stream_object_name(name)?;
        ShmRegion::destroy(&self.config.data_path, &name)
    }

    /// Streams under the data path, sorted by name.
    ///
    /// Files that do not hold a valid stream are skipped with a warning.
    pub fn list_streams(&self) -> MomentumResult<Vec<StreamInfo>> {
        let entries = match fs::read_dir(&self.config.data_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut streams = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match BufferPool::inspect(&entry.path()) {
                Ok(info) => streams.push(StreamInfo {
                    name,
                    buffer_size: info.config.shape.buffer_size,
                    buffer_count: info.config.shape.buffer_count,
                    broadcast: info.config.broadcast,
                    total_memory: info.total_memory,
                }),
                Err(e) => log::warn!("Skipping '{}': {}", name, e),
            }
        }
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(streams)
    }

    pub fn create_route<S: AsRef<str>>(&self, name: &str, streams: &[S]) -> MomentumResult<()> {
        self.routes.create_route_with(name, streams)
    }

    pub fn attach_stream(&self, route: &str, stream: &str) -> MomentumResult<()> {
        self.routes.attach_stream(route, stream)
    }

    pub fn remove_route(&self, name: &str) -> MomentumResult<()> {
        self.routes.remove_route(name)
    }

    pub fn list_routes(&self) -> MomentumResult<Vec<String>> {
        self.routes.list_routes()
    }
}
