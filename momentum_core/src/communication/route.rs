//! Route table: a logical name mapped to an ordered set of streams.
//!
//! Each route is stored as `<run_path>/routes/<route>.json`. Routes only name
//! streams; creating or removing a route never touches stream segments.

use crate::error::{MomentumError, MomentumResult, ResourceKind};
use crate::memory::{stream_object_name, validate_name};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Persisted form of one route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    #[serde(default)]
    pub streams: Vec<String>,
}

impl Route {
    fn add_stream(&mut self, stream: String) -> bool {
        if self.streams.contains(&stream) {
            return false;
        }
        self.streams.push(stream);
        true
    }
}

/// File-backed route table
#[derive(Debug, Clone)]
pub struct RouteTable {
    dir: PathBuf,
}

impl RouteTable {
    /// Route table stored under `<run_path>/routes`
    pub fn new(run_path: &Path) -> Self {
        Self {
            dir: run_path.join("routes"),
        }
    }

    fn path_of(&self, route: &str) -> PathBuf {
        self.dir.join(format!("{}.json", route))
    }

    pub fn create_route(&self, name: &str) -> MomentumResult<()> {
        self.create_route_with::<&str>(name, &[])
    }

    /// Create a route already carrying `streams` (duplicates collapsed, order kept)
    pub fn create_route_with<S: AsRef<str>>(&self, name: &str, streams: &[S]) -> MomentumResult<()> {
        validate_name(name)?;
        let mut route = Route {
            name: name.to_string(),
            streams: Vec::new(),
        };
        for stream in streams {
            route.add_stream(stream_object_name(stream.as_ref())?);
        }

        fs::create_dir_all(&self.dir)?;
        let file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_of(name))
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(MomentumError::already_exists(ResourceKind::Route, name));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::to_writer_pretty(file, &route)?;
        log::info!("Created route '{}'", name);
        Ok(())
    }

    fn load(&self, name: &str) -> MomentumResult<Route> {
        validate_name(name)?;
        let contents = match fs::read_to_string(self.path_of(name)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MomentumError::not_found(ResourceKind::Route, name));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write through a temp file so readers never see a partial route
    fn store(&self, route: &Route) -> MomentumResult<()> {
        let tmp = self.dir.join(format!(".{}.json.tmp", route.name));
        fs::write(&tmp, serde_json::to_vec_pretty(route)?)?;
        fs::rename(&tmp, self.path_of(&route.name))?;
        Ok(())
    }

    /// Append `stream` to `route`; attaching twice is a no-op
    pub fn attach_stream(&self, route: &str, stream: &str) -> MomentumResult<()> {
        let mut current = self.load(route)?;
        if current.add_stream(stream_object_name(stream)?) {
            self.store(&current)?;
            log::debug!("Attached stream '{}' to route '{}'", stream, route);
        }
        Ok(())
    }

    /// Remove `stream` from `route`; detaching an absent stream is a no-op
    pub fn detach_stream(&self, route: &str, stream: &str) -> MomentumResult<()> {
        let mut current = self.load(route)?;
        let stream = stream_object_name(stream)?;
        let before = current.streams.len();
        current.streams.retain(|s| *s != stream);
        if current.streams.len() != before {
            self.store(&current)?;
        }
        Ok(())
    }

    /// Streams of `route` in attach order
    pub fn resolve(&self, route: &str) -> MomentumResult<Vec<String>> {
        Ok(self.load(route)?.streams)
    }

    pub fn remove_route(&self, name: &str) -> MomentumResult<()> {
        validate_name(name)?;
        match fs::remove_file(self.path_of(name)) {
            Ok(()) => {
                log::info!("Removed route '{}'", name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(MomentumError::not_found(ResourceKind::Route, name))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Route names, sorted
    pub fn list_routes(&self) -> MomentumResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let table = RouteTable::new(dir.path());

        table.create_route("camera").unwrap();
        table.attach_stream("camera", "mx://left").unwrap();
        table.attach_stream("camera", "right").unwrap();
        table.attach_stream("camera", "left").unwrap();
        assert_eq!(table.resolve("camera").unwrap(), vec!["left", "right"]);

        table.detach_stream("camera", "left").unwrap();
        assert_eq!(table.resolve("camera").unwrap(), vec!["right"]);

        table.remove_route("camera").unwrap();
        assert!(table.resolve("camera").unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = RouteTable::new(dir.path());
        table.create_route_with("r", &["a", "a", "b"]).unwrap();
        assert_eq!(table.resolve("r").unwrap(), vec!["a", "b"]);
        assert!(matches!(
            table.create_route("r"),
            Err(MomentumError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_list_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let table = RouteTable::new(dir.path());
        assert!(table.list_routes().unwrap().is_empty());
        for name in ["zeta", "alpha", "mid"] {
            table.create_route(name).unwrap();
        }
        table.attach_stream("mid", "s").unwrap();
        assert_eq!(table.list_routes().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_missing_route_operations() {
        let dir = tempfile::tempdir().unwrap();
        let table = RouteTable::new(dir.path());
        assert!(table.attach_stream("none", "s").unwrap_err().is_not_found());
        assert!(table.remove_route("none").unwrap_err().is_not_found());
    }
}
