//! Startup configuration management

use crate::types::MirrorError;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ═══════════════════════════════════════════════════════════
// CLI Argument Parsing
// ═══════════════════════════════════════════════════════════

/// mirra - Interactive live directory mirroring
///
/// Commands (add/end/restore/list/exit) are read line by line on stdin.
#[derive(Parser, Debug)]
#[command(name = "mirra")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Optional TOML file overriding queue and copy limits
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log filter directive (overrides RUST_LOG), e.g. "mirra=debug"
    #[arg(long)]
    pub log_level: Option<String>,
}

// ═══════════════════════════════════════════════════════════
// Runtime Limits
// ═══════════════════════════════════════════════════════════

/// Per-worker queue and copy limits.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Bounded event-queue capacity per target worker
    pub queue_capacity: usize,

    /// Concurrent file copies allowed per target worker
    pub copy_permits: usize,

    /// Buffer size for streamed file copies
    pub copy_buffer_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            copy_permits: 4,
            copy_buffer_bytes: 128 * 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    limits: Limits,
}

impl Limits {
    /// Load limits from a TOML config file.
    pub fn load(path: &Path) -> Result<Self, MirrorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: ConfigFile = toml::from_str(&raw).map_err(|e| {
            MirrorError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        file.validate()?;
        Ok(file.limits)
    }
}

impl ConfigFile {
    fn validate(&self) -> Result<(), MirrorError> {
        if self.limits.queue_capacity == 0 {
            return Err(MirrorError::Config(
                "limits.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.limits.copy_permits == 0 {
            return Err(MirrorError::Config(
                "limits.copy_permits must be at least 1".to_string(),
            ));
        }
        if self.limits.copy_buffer_bytes == 0 {
            return Err(MirrorError::Config(
                "limits.copy_buffer_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_limits_defaults() {
        let limits = Limits::default();
        assert_eq!(limits.queue_capacity, 10_000);
        assert_eq!(limits.copy_permits, 4);
        assert_eq!(limits.copy_buffer_bytes, 128 * 1024);
    }

    #[test]
    fn test_load_partial_limits_table() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("mirra.toml");
        fs::write(&path, "[limits]\nqueue_capacity = 64\n").expect("write config");

        let limits = Limits::load(&path).expect("load config");
        assert_eq!(limits.queue_capacity, 64);
        assert_eq!(limits.copy_permits, 4, "unset fields keep defaults");
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let temp = TempDir::new().expect("create temp dir");
        let result = Limits::load(&temp.path().join("absent.toml"));
        assert!(matches!(result, Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_load_rejects_zero_queue_capacity() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("mirra.toml");
        fs::write(&path, "[limits]\nqueue_capacity = 0\n").expect("write config");

        let result = Limits::load(&path);
        assert!(matches!(result, Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("mirra.toml");
        fs::write(&path, "[limits]\nqueue_capcity = 5\n").expect("write config");

        let result = Limits::load(&path);
        assert!(matches!(result, Err(MirrorError::Config(_))));
    }
}
