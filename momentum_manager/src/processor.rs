//! Processor supervision: worker processes started from a shell command and
//! tracked through one JSON definition per processor under
//! `<run_path>/processors/`.

use chrono::{DateTime, Utc};
use momentum_core::error::{MomentumError, MomentumResult, ResourceKind};
use momentum_core::memory::validate_name;
use momentum_core::MomentumConfig;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Time a processor gets to exit after SIGTERM before it is killed
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorInfo {
    pub name: String,
    pub command: String,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
}

impl ProcessorInfo {
    pub fn is_running(&self) -> bool {
        process_alive(self.pid)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorTable {
    dir: PathBuf,
    env: Vec<(String, String)>,
}

impl ProcessorTable {
    pub fn new(config: &MomentumConfig) -> Self {
        Self {
            dir: config.processors_dir(),
            env: config.env_vars(),
        }
    }

    fn definition_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.log", name))
    }

    /// Start `sh -c <command>` in its own process group and record it.
    ///
    /// The child inherits the resolved `MOMENTUM_*` paths; its output goes to
    /// `<name>.log` next to the definition.
    pub fn create_processor(&self, name: &str, command: &str) -> MomentumResult<ProcessorInfo> {
        validate_name(name)?;
        if command.trim().is_empty() {
            return Err(MomentumError::invalid_input("processor command must not be empty"));
        }
        fs::create_dir_all(&self.dir)?;

        // Claim the name before spawning so two creators cannot both start
        let definition = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.definition_path(name))
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(MomentumError::already_exists(ResourceKind::Processor, name));
            }
            Err(e) => return Err(e.into()),
        };

        let spawned = self.spawn(name, command);
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                drop(definition);
                let _ = fs::remove_file(self.definition_path(name));
                return Err(e);
            }
        };

        let info = ProcessorInfo {
            name: name.to_string(),
            command: command.to_string(),
            pid: child.id(),
            start_time: Utc::now(),
        };
        serde_json::to_writer_pretty(definition, &info)?;
        log::info!("Started processor '{}' (pid {})", name, info.pid);
        Ok(info)
    }

    fn spawn(&self, name: &str, command: &str) -> MomentumResult<std::process::Child> {
        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(name))?;
        let errors = output.try_clone()?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(output)
            .stderr(errors)
            .process_group(0)
            .spawn()?;
        Ok(child)
    }

    pub fn get(&self, name: &str) -> MomentumResult<ProcessorInfo> {
        validate_name(name)?;
        let file = match File::open(self.definition_path(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MomentumError::not_found(ResourceKind::Processor, name));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_reader(file)?)
    }

    /// Stop the processor (SIGTERM, then SIGKILL after the grace period) and
    /// forget it, output log included
    pub fn remove_processor(&self, name: &str) -> MomentumResult<()> {
        self.remove_processor_with_grace(name, STOP_GRACE_PERIOD)
    }

    pub fn remove_processor_with_grace(&self, name: &str, grace: Duration) -> MomentumResult<()> {
        let info = self.get(name)?;
        stop_process_group(info.pid, grace);
        fs::remove_file(self.definition_path(name))?;
        match fs::remove_file(self.log_path(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove log of processor '{}': {}", name, e),
        }
        log::info!("Stopped processor '{}' (pid {})", name, info.pid);
        Ok(())
    }

    /// Recorded processors, sorted by name
    pub fn list_processors(&self) -> MomentumResult<Vec<ProcessorInfo>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut processors = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(MomentumError::from)
                .and_then(|s| serde_json::from_str::<ProcessorInfo>(&s).map_err(Into::into));
            match parsed {
                Ok(info) => processors.push(info),
                Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
            }
        }
        processors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(processors)
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Collect the exit status if the process is our own child
    let _ = waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG));
    if matches!(signal::kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)) {
        return false;
    }
    !is_zombie(pid)
}

/// Exited children of another parent linger until reaped; they are not running
fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .map_or(false, |state| state == 'Z')
}

fn stop_process_group(pid: u32, grace: Duration) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pid = Pid::from_raw(raw);

    // The processor leads its own group; fall back to the single pid
    if signal::killpg(pid, Signal::SIGTERM).is_err() {
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            if e != Errno::ESRCH {
                log::warn!("Failed to send SIGTERM to {}: {}", pid, e);
            }
            return;
        }
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !process_alive(raw as u32) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    log::warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
    let _ = signal::killpg(pid, Signal::SIGKILL);
    let _ = signal::kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (tempfile::TempDir, ProcessorTable) {
        let dir = tempfile::tempdir().unwrap();
        let config =
            MomentumConfig::with_paths(dir.path().join("run"), dir.path().join("data")).unwrap();
        (dir, ProcessorTable::new(&config))
    }

    #[test]
    fn test_processor_lifecycle() {
        let (dir, table) = table();
        let info = table.create_processor("sleeper", "sleep 30").unwrap();
        assert!(info.is_running());

        let listed = table.list_processors().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].command, "sleep 30");

        let log = dir.path().join("run/processors/sleeper.log");
        assert!(log.exists());

        table.remove_processor("sleeper").unwrap();
        assert!(!info.is_running());
        assert!(table.list_processors().unwrap().is_empty());
        assert!(!log.exists());
    }

    #[test]
    fn test_processor_sees_momentum_environment() {
        let (dir, table) = table();
        table
            .create_processor("env", "echo $MOMENTUM_DATA_PATH")
            .unwrap();

        let log = dir.path().join("run/processors/env.log");
        let expected = dir.path().join("data");
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if fs::read_to_string(&log).unwrap_or_default().contains(expected.to_str().unwrap()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(fs::read_to_string(&log).unwrap().contains(expected.to_str().unwrap()));
        table.remove_processor("env").unwrap();
    }

    #[test]
    fn test_stubborn_processor_is_killed() {
        let (_dir, table) = table();
        let info = table
            .create_processor("stubborn", "trap '' TERM; while true; do sleep 1; done")
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        table
            .remove_processor_with_grace("stubborn", Duration::from_millis(200))
            .unwrap();
        assert!(!info.is_running());
    }

    #[test]
    fn test_duplicate_and_missing_processors() {
        let (_dir, table) = table();
        table.create_processor("once", "sleep 30").unwrap();
        assert!(matches!(
            table.create_processor("once", "sleep 30"),
            Err(MomentumError::AlreadyExists { .. })
        ));
        table.remove_processor("once").unwrap();
        assert!(table.remove_processor("once").unwrap_err().is_not_found());
    }
}
