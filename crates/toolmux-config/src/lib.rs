//! Multi-tier TOML configuration for toolmux.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

pub mod error;

pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolmux_mcp::ServerConfig;
use toolmux_session::{LoginConfig, SupervisorConfig};

/// Default handshake timeout for the tool server.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Sessions with no connections are reclaimed after this long.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;

pub const DEFAULT_PROMPT_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 300;

/// Resolved configuration for a toolmux process.
#[derive(Debug, Clone)]
pub struct ToolmuxConfig {
    /// Tool server executable launched once per session.
    pub server_command: String,
    pub server_args: Vec<String>,
    /// Environment defaults for every session; session settings override them.
    pub server_env: HashMap<String, String>,
    pub timeout_ms: u64,
    pub root_dir: PathBuf,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub prompt_timeout: Duration,
    pub cleanup_workdirs: bool,
    /// `None` when login is disabled.
    pub login: Option<LoginConfig>,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
    #[serde(default)]
    pub login: LoginSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub idle_timeout_secs: Option<u64>,
    pub reap_interval_secs: Option<u64>,
    pub prompt_timeout_secs: Option<u64>,
    pub root_dir: Option<PathBuf>,
    pub cleanup_workdirs: Option<bool>,
}

/// The login subprocess reuses the server command with its own arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_login_args")]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            args: default_login_args(),
            timeout_secs: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_login_args() -> Vec<String> {
    vec!["login".to_string()]
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub server_command: Option<String>,
    /// Replaces the file's `server.args` when non-empty.
    pub server_args: Vec<String>,
    pub idle_timeout_secs: Option<u64>,
    /// Read this file instead of `<config_dir>/config.toml`.
    pub config_path: Option<PathBuf>,
}

impl ToolmuxConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. Config file (~/.toolmux/config.toml, or `--config`)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let config_dir = config_dir();
        let path = overrides
            .config_path
            .clone()
            .unwrap_or_else(|| config_dir.join("config.toml"));
        let settings = load_settings_file(&path);
        Self::resolve(overrides, settings, config_dir, |key| std::env::var(key).ok())
    }

    /// Merge already-read sources. `env` looks up environment variables.
    pub fn resolve(
        overrides: CliOverrides,
        settings: SettingsFile,
        config_dir: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Resolve server command: CLI > env > config file
        let server_command = overrides
            .server_command
            .or_else(|| env("TOOLMUX_SERVER_COMMAND"))
            .or(settings.server.command)
            .ok_or_else(|| ConfigError::MissingKey {
                key: "server.command (pass --server-command, set TOOLMUX_SERVER_COMMAND or add to ~/.toolmux/config.toml)".into(),
            })?;

        let server_args = if overrides.server_args.is_empty() {
            settings.server.args
        } else {
            overrides.server_args
        };

        let root_dir = env("TOOLMUX_SESSIONS_DIR")
            .map(PathBuf::from)
            .or(settings.sessions.root_dir)
            .unwrap_or_else(|| SupervisorConfig::default().root_dir);

        let idle_timeout_secs = overrides
            .idle_timeout_secs
            .or(settings.sessions.idle_timeout_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let reap_interval_secs = positive(
            "sessions.reap_interval_secs",
            settings
                .sessions
                .reap_interval_secs
                .unwrap_or(DEFAULT_REAP_INTERVAL_SECS),
        )?;
        let prompt_timeout_secs = positive(
            "sessions.prompt_timeout_secs",
            settings
                .sessions
                .prompt_timeout_secs
                .unwrap_or(DEFAULT_PROMPT_TIMEOUT_SECS),
        )?;

        let login = settings.login.enabled.then(|| LoginConfig {
            command: server_command.clone(),
            args: settings.login.args,
            timeout: Duration::from_secs(
                settings
                    .login
                    .timeout_secs
                    .unwrap_or(DEFAULT_LOGIN_TIMEOUT_SECS),
            ),
        });

        Ok(ToolmuxConfig {
            server_command,
            server_args,
            server_env: settings.server.env,
            timeout_ms: settings.server.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            root_dir,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            reap_interval: Duration::from_secs(reap_interval_secs),
            prompt_timeout: Duration::from_secs(prompt_timeout_secs),
            cleanup_workdirs: settings.sessions.cleanup_workdirs.unwrap_or(true),
            login,
            config_dir,
        })
    }

    /// Launch configuration for the per-session tool server. Environment
    /// defaults travel through [`SupervisorConfig::base_env`] instead, so the
    /// login subprocess sees them too.
    pub fn server_config(&self) -> ServerConfig {
        let mut server = ServerConfig::new(self.server_command.clone());
        server.args = self.server_args.clone();
        server.timeout_ms = self.timeout_ms;
        server
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            root_dir: self.root_dir.clone(),
            base_env: self.server_env.clone(),
            idle_timeout: self.idle_timeout,
            reap_interval: self.reap_interval,
            prompt_timeout: self.prompt_timeout,
            login: self.login.clone(),
            cleanup_workdirs: self.cleanup_workdirs,
        }
    }
}

fn positive(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

/// Get the toolmux config directory path (~/.toolmux/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLMUX_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolmux")
}

/// Load and parse a TOML settings file, returning defaults on any error.
pub fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(e) => {
            tracing::debug!("No settings read from {}: {}", path.display(), e);
            SettingsFile::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn with_command(command: &str) -> SettingsFile {
        let mut settings = SettingsFile::default();
        settings.server.command = Some(command.to_string());
        settings
    }

    #[test]
    fn test_default_settings() {
        let settings = SettingsFile::default();
        assert!(settings.server.command.is_none());
        assert!(settings.login.enabled);
        assert_eq!(settings.login.args, vec!["login"]);
    }

    #[test]
    fn test_settings_toml_parse() {
        let toml_str = r#"
[server]
command = "/opt/tools/bin/tool-server"
args = ["--stdio"]
timeout_ms = 5000

[server.env]
REGION = "eu-west-1"

[sessions]
idle_timeout_secs = 600
root_dir = "/var/lib/toolmux"
cleanup_workdirs = false

[login]
args = ["auth", "login"]
timeout_secs = 90
"#;
        let settings: SettingsFile = toml::from_str(toml_str).unwrap();
        assert_eq!(
            settings.server.command.as_deref(),
            Some("/opt/tools/bin/tool-server")
        );
        assert_eq!(settings.server.args, vec!["--stdio"]);
        assert_eq!(settings.server.env["REGION"], "eu-west-1");
        assert_eq!(settings.server.timeout_ms, Some(5000));
        assert_eq!(settings.sessions.idle_timeout_secs, Some(600));
        assert_eq!(settings.sessions.cleanup_workdirs, Some(false));
        assert!(settings.login.enabled);
        assert_eq!(settings.login.args, vec!["auth", "login"]);
    }

    #[test]
    fn test_resolve_defaults() {
        let config = ToolmuxConfig::resolve(
            CliOverrides::default(),
            with_command("tool-server"),
            PathBuf::from("/cfg"),
            no_env,
        )
        .unwrap();
        assert_eq!(config.server_command, "tool-server");
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.reap_interval, Duration::from_secs(60));
        assert_eq!(config.prompt_timeout, Duration::from_secs(120));
        assert!(config.cleanup_workdirs);

        let login = config.login.unwrap();
        assert_eq!(login.command, "tool-server");
        assert_eq!(login.args, vec!["login"]);
        assert_eq!(login.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_missing_command_is_error() {
        let result = ToolmuxConfig::resolve(
            CliOverrides::default(),
            SettingsFile::default(),
            PathBuf::new(),
            no_env,
        );
        match result {
            Err(ConfigError::MissingKey { key }) => assert!(key.contains("server.command")),
            other => panic!("Expected MissingKey, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence_cli_over_env_over_file() {
        let env = |key: &str| match key {
            "TOOLMUX_SERVER_COMMAND" => Some("from-env".to_string()),
            "TOOLMUX_SESSIONS_DIR" => Some("/env/sessions".to_string()),
            _ => None,
        };

        let from_env =
            ToolmuxConfig::resolve(CliOverrides::default(), with_command("from-file"), PathBuf::new(), env)
                .unwrap();
        assert_eq!(from_env.server_command, "from-env");
        assert_eq!(from_env.root_dir, PathBuf::from("/env/sessions"));

        let from_cli = ToolmuxConfig::resolve(
            CliOverrides {
                server_command: Some("from-cli".into()),
                idle_timeout_secs: Some(5),
                ..CliOverrides::default()
            },
            with_command("from-file"),
            PathBuf::new(),
            env,
        )
        .unwrap();
        assert_eq!(from_cli.server_command, "from-cli");
        assert_eq!(from_cli.idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_reap_interval_rejected() {
        let mut settings = with_command("tool-server");
        settings.sessions.reap_interval_secs = Some(0);
        let result =
            ToolmuxConfig::resolve(CliOverrides::default(), settings, PathBuf::new(), no_env);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_login_disabled() {
        let toml_str = r#"
[server]
command = "tool-server"

[login]
enabled = false
"#;
        let settings: SettingsFile = toml::from_str(toml_str).unwrap();
        let config =
            ToolmuxConfig::resolve(CliOverrides::default(), settings, PathBuf::new(), no_env)
                .unwrap();
        assert!(config.login.is_none());
        assert!(config.supervisor_config().login.is_none());
    }

    #[test]
    fn test_conversions() {
        let mut settings = with_command("tool-server");
        settings.server.args = vec!["--stdio".into()];
        settings.server.env.insert("REGION".into(), "eu".into());
        settings.server.timeout_ms = Some(1234);
        let config =
            ToolmuxConfig::resolve(CliOverrides::default(), settings, PathBuf::new(), no_env)
                .unwrap();

        let server = config.server_config();
        assert_eq!(server.command, "tool-server");
        assert_eq!(server.args, vec!["--stdio"]);
        assert_eq!(server.timeout_ms, 1234);
        assert!(server.env.is_empty());

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.base_env["REGION"], "eu");
        assert_eq!(supervisor.idle_timeout, config.idle_timeout);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\ncommand = ").unwrap();
        let settings = load_settings_file(&path);
        assert!(settings.server.command.is_none());

        std::fs::write(&path, "[server]\ncommand = \"tool-server\"\n").unwrap();
        assert_eq!(
            load_settings_file(&path).server.command.as_deref(),
            Some("tool-server")
        );
        let absent = load_settings_file(&dir.path().join("absent.toml"));
        assert!(absent.server.command.is_none());
    }
}
