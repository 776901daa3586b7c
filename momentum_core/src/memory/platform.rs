// Cross-platform default locations and stream naming
//
// Linux: /dev/shm/momentum (tmpfs - RAM-backed, fastest)
// macOS: /tmp/momentum (no /dev/shm)
// Windows: %TEMP%\momentum

use crate::error::{MomentumError, MomentumResult};
use std::path::PathBuf;

/// URI scheme accepted in front of stream names (`mx://frames`)
pub const STREAM_SCHEME: &str = "mx://";

/// Default directory holding stream segments
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/momentum")
    }

    #[cfg(target_os = "windows")]
    {
        std::env::temp_dir().join("momentum")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/momentum")
    }
}

/// Default directory holding route and processor definitions
pub fn default_run_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/run/momentum")
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::env::temp_dir().join("momentum_run")
    }
}

/// Strip the `mx://` scheme and validate what is left.
///
/// The result is used verbatim as the segment file name, so it must be a
/// single path component made of `[A-Za-z0-9._-]` that does not start with `.`.
pub fn stream_object_name(name: &str) -> MomentumResult<String> {
    let bare = name.strip_prefix(STREAM_SCHEME).unwrap_or(name);
    validate_name(bare)?;
    Ok(bare.to_string())
}

/// Validate a stream, route or processor name
pub fn validate_name(name: &str) -> MomentumResult<()> {
    if name.is_empty() {
        return Err(MomentumError::invalid_input("name must not be empty"));
    }
    if name.starts_with('.') {
        return Err(MomentumError::invalid_input(format!(
            "name '{}' must not start with '.'",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(MomentumError::invalid_input(format!(
            "name '{}' contains invalid character {:?}",
            name, bad
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_is_stripped() {
        assert_eq!(stream_object_name("mx://streamer").unwrap(), "streamer");
        assert_eq!(stream_object_name("streamer").unwrap(), "streamer");
        assert_eq!(stream_object_name("mx://cam.left-0").unwrap(), "cam.left-0");
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(stream_object_name("mx://").is_err());
        assert!(stream_object_name("mx://a/b").is_err());
        assert!(stream_object_name(".hidden").is_err());
        assert!(stream_object_name("has space").is_err());
    }

    #[test]
    fn test_default_dirs_are_absolute() {
        assert!(default_data_dir().is_absolute());
        assert!(default_run_dir().is_absolute());
    }
}
