//! Daemon discovery through a config file on disk.
//!
//! The server mode records where it listens; client invocations read the
//! file and probe the recorded PID with signal 0 to decide whether a new
//! daemon has to be spawned.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub pid: i32,
    pub port: u16,
    pub token: String,
    /// Unix timestamp of daemon start.
    pub created: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Read(#[source] io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("writing config file: {0}")]
    Write(#[source] io::Error),
    #[error("no process with pid {0}")]
    Stale(i32),
}

pub fn read_server_config(path: &Path) -> Result<ServerInfo, ConfigError> {
    let data = fs::read(path).map_err(ConfigError::Read)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Writes the config atomically: temp file in the target directory, mode
/// 0644, rename over the destination.
pub fn write_server_config(info: &ServerInfo, path: &Path) -> Result<(), ConfigError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .map_err(ConfigError::Write)?;

    let data = serde_json::to_vec(info)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(ConfigError::Write)?;
    tmp.write_all(&data).map_err(ConfigError::Write)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))
        .map_err(ConfigError::Write)?;
    tmp.persist(path).map_err(|err| ConfigError::Write(err.error))?;
    Ok(())
}

/// Signal 0 probes for existence without delivering anything.
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Reads the config and verifies the recorded daemon still exists.
pub fn verify_connection(path: &Path) -> Result<ServerInfo, ConfigError> {
    let info = read_server_config(path)?;
    if !process_alive(info.pid) {
        return Err(ConfigError::Stale(info.pid));
    }
    Ok(info)
}
