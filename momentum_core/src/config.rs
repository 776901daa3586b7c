//! Process-wide configuration for MOMENTUM
//!
//! Resolution order for each key:
//! 1. Environment variable (`MOMENTUM_RUN_PATH`, `MOMENTUM_DATA_PATH`)
//! 2. `.momentumrc` files, from the current directory outward to the home directory
//! 3. Built-in defaults (`/run/momentum`, `/dev/shm/momentum` on Linux)

use crate::error::{MomentumError, MomentumResult};
use crate::memory::{default_data_dir, default_run_dir};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_PATH_VAR: &str = "MOMENTUM_RUN_PATH";
pub const DATA_PATH_VAR: &str = "MOMENTUM_DATA_PATH";
pub const RC_FILE_NAME: &str = ".momentumrc";

/// Resolved, absolute locations used by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MomentumConfig {
    /// Route and processor definitions
    pub run_path: PathBuf,
    /// Stream segments
    pub data_path: PathBuf,
}

impl MomentumConfig {
    /// Resolve from the environment and RC files, then create both directories
    pub fn from_env() -> MomentumResult<Self> {
        let cwd = std::env::current_dir()?;
        let vars: HashMap<String, String> = [RUN_PATH_VAR, DATA_PATH_VAR]
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        let search = Self::get_search_paths(&cwd, dirs::home_dir().as_deref());
        let config = Self::resolve(&cwd, &vars, &search)?;
        config.ensure_dirs()?;
        Ok(config)
    }

    /// Use explicit paths (made absolute against the current directory) and create them
    pub fn with_paths<P: AsRef<Path>, Q: AsRef<Path>>(run_path: P, data_path: Q) -> MomentumResult<Self> {
        let cwd = std::env::current_dir()?;
        let config = Self {
            run_path: absolute(&cwd, run_path.as_ref()),
            data_path: absolute(&cwd, data_path.as_ref()),
        };
        config.ensure_dirs()?;
        Ok(config)
    }

    /// Directories searched for `.momentumrc`, closest first.
    ///
    /// Walks from `cwd` outward, stopping at `home` when `cwd` lies below it;
    /// `home` itself is always searched last.
    pub fn get_search_paths(cwd: &Path, home: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for dir in cwd.ancestors() {
            if Some(dir) == home {
                break;
            }
            dirs.push(dir.to_path_buf());
        }
        if let Some(home) = home {
            dirs.push(home.to_path_buf());
        }
        dirs
    }

    /// Resolve both paths from `vars` (environment) and RC files in `search`.
    ///
    /// Relative values are taken against `cwd` for environment variables and
    /// against the directory holding the RC file otherwise.
    pub fn resolve(
        cwd: &Path,
        vars: &HashMap<String, String>,
        search: &[PathBuf],
    ) -> MomentumResult<Self> {
        let mut from_rc: HashMap<String, PathBuf> = HashMap::new();
        for dir in search {
            let rc = dir.join(RC_FILE_NAME);
            let Ok(contents) = fs::read_to_string(&rc) else {
                continue;
            };
            log::debug!("Reading {}", rc.display());
            for (key, value) in parse_rc(&contents) {
                from_rc
                    .entry(key)
                    .or_insert_with(|| absolute(dir, Path::new(&value)));
            }
        }

        let lookup = |key: &str, default: PathBuf| -> MomentumResult<PathBuf> {
            match vars.get(key) {
                Some(value) if value.is_empty() => Err(MomentumError::config(format!(
                    "{} is set but empty",
                    key
                ))),
                Some(value) => Ok(absolute(cwd, Path::new(value))),
                None => Ok(from_rc.get(key).cloned().unwrap_or(default)),
            }
        };

        Ok(Self {
            run_path: lookup(RUN_PATH_VAR, default_run_dir())?,
            data_path: lookup(DATA_PATH_VAR, default_data_dir())?,
        })
    }

    fn ensure_dirs(&self) -> MomentumResult<()> {
        for dir in [&self.run_path, &self.data_path] {
            fs::create_dir_all(dir).map_err(|e| {
                MomentumError::config(format!("Cannot create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.run_path.join("routes")
    }

    pub fn processors_dir(&self) -> PathBuf {
        self.run_path.join("processors")
    }

    /// Environment handed to child processes so they resolve the same paths
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            (
                RUN_PATH_VAR.to_string(),
                self.run_path.to_string_lossy().into_owned(),
            ),
            (
                DATA_PATH_VAR.to_string(),
                self.data_path.to_string_lossy().into_owned(),
            ),
        ]
    }
}

/// Parse `KEY=VALUE` lines; blank lines and `#` comments are skipped
pub fn parse_rc(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rc() {
        let parsed = parse_rc(
            "# comment\n\nMOMENTUM_RUN_PATH=/tmp/run\nexport MOMENTUM_DATA_PATH=\"data\"\nBROKEN\nEMPTY=\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("MOMENTUM_RUN_PATH".to_string(), "/tmp/run".to_string()),
                ("MOMENTUM_DATA_PATH".to_string(), "data".to_string()),
            ]
        );
    }

    #[test]
    fn test_search_stops_at_home() {
        let paths = MomentumConfig::get_search_paths(
            Path::new("/home/me/work/project"),
            Some(Path::new("/home/me")),
        );
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/me/work/project"),
                PathBuf::from("/home/me/work"),
                PathBuf::from("/home/me"),
            ]
        );
    }

    #[test]
    fn test_environment_wins_then_closest_rc() {
        let root = tempfile::tempdir().unwrap();
        let outer = root.path().to_path_buf();
        let inner = outer.join("inner");
        fs::create_dir_all(&inner).unwrap();
        fs::write(
            outer.join(RC_FILE_NAME),
            "MOMENTUM_RUN_PATH=/outer/run\nMOMENTUM_DATA_PATH=/outer/data\n",
        )
        .unwrap();
        fs::write(inner.join(RC_FILE_NAME), "MOMENTUM_DATA_PATH=data\n").unwrap();

        let search = vec![inner.clone(), outer.clone()];
        let config = MomentumConfig::resolve(&inner, &HashMap::new(), &search).unwrap();
        assert_eq!(config.run_path, PathBuf::from("/outer/run"));
        assert_eq!(config.data_path, inner.join("data"));

        let vars = HashMap::from([(RUN_PATH_VAR.to_string(), "rel".to_string())]);
        let config = MomentumConfig::resolve(&inner, &vars, &search).unwrap();
        assert_eq!(config.run_path, inner.join("rel"));
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = MomentumConfig::resolve(Path::new("/"), &HashMap::new(), &[]).unwrap();
        assert_eq!(config.run_path, default_run_dir());
        assert_eq!(config.data_path, default_data_dir());
    }

    #[test]
    fn test_env_vars_round_trip_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            MomentumConfig::with_paths(dir.path().join("run"), dir.path().join("data")).unwrap();
        assert!(config.run_path.is_dir());
        let vars = config.env_vars();
        assert_eq!(vars[0].0, RUN_PATH_VAR);
        assert_eq!(PathBuf::from(&vars[1].1), config.data_path);
    }
}
