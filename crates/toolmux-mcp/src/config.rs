//! Launch configuration for a tool server process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub(crate) fn default_timeout() -> u64 {
    30000
}

/// How to launch one tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable to run, either a path or a name looked up on `PATH`.
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overlay applied on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Timeout for handshake requests in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            timeout_ms: default_timeout(),
        }
    }

    /// Locate the executable, honoring `PATH` for bare names.
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        resolve_executable(&self.command, std::env::var_os("PATH").as_deref())
    }
}

pub(crate) fn resolve_executable(
    command: &str,
    path_var: Option<&std::ffi::OsStr>,
) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}
