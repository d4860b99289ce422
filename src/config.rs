//! Layered runtime configuration.
//!
//! Resolution order, poorest-confidence first: compiled-in defaults, then
//! `AFD_WORK_DIR` and friends from the process environment, then CLI flags
//! (highest precedence, applied by the caller after constructing the base
//! [`AfdConfig`] from the environment).

use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Environment variable naming the root of the on-disk layout.
pub const AFD_WORK_DIR_VAR: &str = "AFD_WORK_DIR";

const DEFAULT_BLOCK_SIZE: u32 = 4096;
const DEFAULT_TRANSFER_TIMEOUT_SECS: u32 = 120;
const DEFAULT_TRL_POLL_INTERVAL_SECS: u32 = 5;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `AFD_WORK_DIR` was not set and no explicit override was given.
    #[error("{AFD_WORK_DIR_VAR} is not set and no work directory was given")]
    MissingWorkDir,
}

/// Centralises the paths and defaults every binary needs, so none of them
/// re-derive `$AFD_WORK_DIR/fifo_dir`, `$AFD_WORK_DIR/etc`, etc. by hand.
#[derive(Debug, Clone)]
pub struct AfdConfig {
    work_dir: PathBuf,
    pub default_block_size: u32,
    pub default_transfer_timeout_secs: u32,
    pub trl_poll_interval_secs: u32,
}

impl AfdConfig {
    /// Builds configuration from the process environment, applying compiled
    /// defaults for everything the environment doesn't specify.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingWorkDir`] if `AFD_WORK_DIR` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let work_dir = env::var(AFD_WORK_DIR_VAR).map_err(|_| ConfigError::MissingWorkDir)?;
        Ok(Self::new(PathBuf::from(work_dir)))
    }

    /// Builds configuration from an explicit work directory, e.g. one
    /// supplied as a worker's first positional CLI argument.
    #[must_use]
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            default_block_size: DEFAULT_BLOCK_SIZE,
            default_transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            trl_poll_interval_secs: DEFAULT_TRL_POLL_INTERVAL_SECS,
        }
    }

    /// Root of the on-disk layout (`$AFD_WORK_DIR`).
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// `$AFD_WORK_DIR/fifo_dir`: shared-status tables and the DEMCD queue.
    #[must_use]
    pub fn fifo_dir(&self) -> PathBuf {
        self.work_dir.join("fifo_dir")
    }

    /// `$AFD_WORK_DIR/file_dir`: the local spool.
    #[must_use]
    pub fn file_dir(&self) -> PathBuf {
        self.work_dir.join("file_dir")
    }

    /// `$AFD_WORK_DIR/file_dir/incoming/ls_data`: retrieve lists.
    #[must_use]
    pub fn ls_data_dir(&self) -> PathBuf {
        self.file_dir().join("incoming").join("ls_data")
    }

    /// `$AFD_WORK_DIR/etc`: configuration, including `afd.trl`.
    #[must_use]
    pub fn etc_dir(&self) -> PathBuf {
        self.work_dir.join("etc")
    }

    /// `$AFD_WORK_DIR/etc/afd.trl`.
    #[must_use]
    pub fn trl_file(&self) -> PathBuf {
        self.etc_dir().join("afd.trl")
    }

    /// `$AFD_WORK_DIR/fifo_dir/status.db`: the sqlite-backed FSA/FRA/MDB
    /// store and the DEMCD queue/dup-check tables.
    #[must_use]
    pub fn status_db_path(&self) -> PathBuf {
        self.fifo_dir().join("status.db")
    }

    /// `$AFD_WORK_DIR/archive`: resend-from-archive source.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.work_dir.join("archive")
    }

    /// `$AFD_WORK_DIR/log`: rotated log output.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_anchored_under_work_dir() {
        let cfg = AfdConfig::new(PathBuf::from("/srv/afd"));
        assert_eq!(cfg.fifo_dir(), PathBuf::from("/srv/afd/fifo_dir"));
        assert_eq!(
            cfg.ls_data_dir(),
            PathBuf::from("/srv/afd/file_dir/incoming/ls_data")
        );
        assert_eq!(cfg.trl_file(), PathBuf::from("/srv/afd/etc/afd.trl"));
        assert_eq!(
            cfg.status_db_path(),
            PathBuf::from("/srv/afd/fifo_dir/status.db")
        );
    }

    #[test]
    fn defaults_are_positive() {
        let cfg = AfdConfig::new(PathBuf::from("/srv/afd"));
        assert!(cfg.default_block_size > 0);
        assert!(cfg.default_transfer_timeout_secs > 0);
        assert!(cfg.trl_poll_interval_secs > 0);
    }
}
