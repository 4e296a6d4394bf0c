//! Login runner: drives the out-of-band authentication subprocess.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// How to launch the login subprocess.
#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Wall-clock limit after which the subprocess is killed.
    pub timeout: Duration,
}

/// How a login subprocess ended.
///
/// None of these fail configuration: the authentication may finish through
/// a browser redirect this process never sees.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Run the login subprocess with the session's environment and working
/// directory, killing it if it exceeds the configured timeout.
pub async fn run_login(
    config: &LoginConfig,
    env: &HashMap<String, String>,
    cwd: &Path,
) -> LoginOutcome {
    let mut child = match tokio::process::Command::new(&config.command)
        .args(&config.args)
        .envs(env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return LoginOutcome::Failed(format!("Failed to spawn login: {e}")),
    };

    match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(Ok(status)) => match status.code() {
            Some(0) => LoginOutcome::Completed,
            Some(code) => LoginOutcome::Failed(format!("Login exited with code {code}")),
            None => LoginOutcome::Failed("Login terminated by signal".to_string()),
        },
        Ok(Err(e)) => LoginOutcome::Failed(format!("Failed to wait for login: {e}")),
        Err(_) => {
            let _ = child.kill().await;
            LoginOutcome::TimedOut
        }
    }
}
