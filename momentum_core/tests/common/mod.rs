#![allow(dead_code)]

use momentum_core::{Context, MomentumConfig};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Isolated run/data paths for one test
pub fn temp_config() -> (TempDir, MomentumConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = MomentumConfig::with_paths(dir.path().join("run"), dir.path().join("data")).unwrap();
    (dir, config)
}

pub fn manual_context(config: &MomentumConfig) -> Context {
    Context::builder()
        .config(config.clone())
        .manual_dispatch(true)
        .build()
        .unwrap()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
