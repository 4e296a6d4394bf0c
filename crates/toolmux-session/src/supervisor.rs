//! Session supervisor: lazy per-session tool servers, prompt fan-out and
//! idle reclamation.

use crate::connection::{Connection, SESSION_CLOSED_CODE};
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::factory::{ClientFactory, LaunchSpec};
use crate::login::{LoginConfig, LoginOutcome, run_login};
use crate::session::{
    ClientSlot, EmptyResources, PromptOutcome, Session, SessionPhase, SessionPrompter,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolmux_mcp::{InboundHandlers, ProtocolClient, ToolDefinition};
use uuid::Uuid;

/// Environment variable carrying the session id into the child.
pub const SESSION_ID_ENV: &str = "TOOLMUX_SESSION_ID";
/// Environment variable carrying the session directory into the child.
pub const SESSION_DIR_ENV: &str = "TOOLMUX_SESSION_DIR";

/// Tunables for a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Parent of every session-private working directory.
    pub root_dir: PathBuf,
    /// Process-wide environment defaults; session settings override them.
    pub base_env: HashMap<String, String>,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub prompt_timeout: Duration,
    /// Login subprocess run after each successful configure.
    pub login: Option<LoginConfig>,
    /// Remove a session's working directory when it is destroyed.
    pub cleanup_workdirs: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("toolmux-sessions"),
            base_env: HashMap::new(),
            idle_timeout: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            prompt_timeout: Duration::from_secs(120),
            login: None,
            cleanup_workdirs: true,
        }
    }
}

/// Owns every live session.
pub struct Supervisor {
    config: SupervisorConfig,
    factory: Arc<dyn ClientFactory>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    reaper: CancellationToken,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            config,
            factory,
            sessions: Mutex::new(HashMap::new()),
            reaper: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Return the session for `id`, creating it with a fresh private working
    /// directory if needed. Always counts as activity.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(id) {
                Some(session) => Arc::clone(session),
                None => {
                    let workdir = self.config.root_dir.join(Uuid::new_v4().to_string());
                    tokio::fs::create_dir_all(&workdir).await?;
                    let session = Arc::new(Session::new(id.to_string(), workdir));
                    tracing::info!(
                        "Created session '{}' in {}",
                        id,
                        session.workdir().display()
                    );
                    sessions.insert(id.to_string(), Arc::clone(&session));
                    session
                }
            }
        };
        session.touch().await;
        Ok(session)
    }

    /// Look up an existing session without creating one.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession { id: id.to_string() })
    }

    /// Launch and initialize the session's tool server.
    ///
    /// One-shot: a no-op while the session's tool server is running, and
    /// rejected with `ConfigureInProgress` while another configure is still
    /// running. A failed configure leaves the session unconfigured, and a
    /// session whose tool server exited is configured afresh.
    pub async fn configure(
        &self,
        id: &str,
        settings: HashMap<String, String>,
    ) -> Result<(), SessionError> {
        let session = self.get(id).await?;
        session.touch().await;

        let dead = {
            let mut slot = session.client.lock().await;
            match &*slot {
                ClientSlot::Ready(client) if client.is_running().await => {
                    tracing::debug!("Session '{}' already configured", id);
                    return Ok(());
                }
                ClientSlot::Configuring => {
                    return Err(SessionError::ConfigureInProgress { id: id.to_string() });
                }
                ClientSlot::Ready(_) | ClientSlot::Unconfigured => {}
            }
            match std::mem::replace(&mut *slot, ClientSlot::Configuring) {
                ClientSlot::Ready(client) => Some(client),
                _ => None,
            }
        };
        if let Some(dead) = dead {
            tracing::warn!("Tool server for session '{}' exited; relaunching", id);
            dead.shutdown().await;
        }

        let env = self.child_env(&session, &settings);
        let client = match self.launch(&session, env.clone()).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                *session.client.lock().await = ClientSlot::Unconfigured;
                tracing::warn!("Configuring session '{}' failed: {e}", id);
                return Err(e);
            }
        };

        {
            let mut slot = session.client.lock().await;
            if session.is_terminated().await {
                drop(slot);
                client.shutdown().await;
                return Err(SessionError::SessionTerminated { id: id.to_string() });
            }
            *slot = ClientSlot::Ready(Arc::clone(&client));
        }
        session.state.lock().await.settings = settings;
        tracing::info!(
            "Session '{}' ready with {} tools",
            id,
            client.list_tools().len()
        );
        session
            .broadcast(SessionEvent::Tools {
                tools: client.list_tools(),
            })
            .await;

        if let Some(login) = &self.config.login {
            match run_login(login, &env, session.workdir()).await {
                LoginOutcome::Completed => tracing::info!("Login for session '{}' completed", id),
                LoginOutcome::Failed(reason) => tracing::warn!(
                    "Login for session '{}' did not complete ({reason}); it may finish out of band",
                    id
                ),
                LoginOutcome::TimedOut => tracing::warn!(
                    "Login for session '{}' killed after {:?}; it may finish out of band",
                    id,
                    login.timeout
                ),
            }
        }
        Ok(())
    }

    async fn launch(
        &self,
        session: &Arc<Session>,
        env: HashMap<String, String>,
    ) -> Result<ProtocolClient, SessionError> {
        let handlers = InboundHandlers::new()
            .with_prompts(Arc::new(SessionPrompter::new(
                Arc::downgrade(session),
                self.config.prompt_timeout,
            )))
            .with_resources(Arc::new(EmptyResources));

        let client = self.factory.create(LaunchSpec {
            session_id: session.id().to_string(),
            workdir: session.workdir().to_path_buf(),
            env,
            handlers,
        })?;

        client.start().await?;
        if let Err(e) = client.initialize().await {
            client.shutdown().await;
            return Err(e.into());
        }
        Ok(client)
    }

    /// Defaults, then session settings, then the session's identity.
    fn child_env(
        &self,
        session: &Session,
        settings: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env = self.config.base_env.clone();
        env.extend(settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(SESSION_ID_ENV.to_string(), session.id().to_string());
        env.insert(
            SESSION_DIR_ENV.to_string(),
            session.workdir().display().to_string(),
        );
        env
    }

    /// Call a tool on the session's server; the result is returned verbatim.
    pub async fn call_tool(
        &self,
        id: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, SessionError> {
        let client = self.ready_client(id).await?;
        Ok(client.call_tool(tool, arguments).await?)
    }

    /// The session's tool catalog.
    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDefinition>, SessionError> {
        Ok(self.ready_client(id).await?.list_tools())
    }

    async fn ready_client(&self, id: &str) -> Result<Arc<ProtocolClient>, SessionError> {
        let session = self.get(id).await?;
        session.touch().await;
        if let Some(dead) = session.take_dead_client().await {
            tracing::warn!(
                "Tool server for session '{}' exited; configure it again",
                id
            );
            dead.shutdown().await;
        }
        session
            .client()
            .await
            .ok_or_else(|| SessionError::NotConfigured { id: id.to_string() })
    }

    /// Ask the session's live connections for input on behalf of its tool
    /// server.
    pub async fn prompt_for_session(
        &self,
        id: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SessionError> {
        let session = self.get(id).await?;
        session.prompt(params, self.config.prompt_timeout).await
    }

    /// Deliver a connection's answer to a pending prompt.
    ///
    /// Returns `false` when the prompt was already settled or never existed.
    pub async fn respond_prompt(
        &self,
        id: &str,
        prompt_id: &str,
        response: serde_json::Value,
    ) -> Result<bool, SessionError> {
        let session = self.get(id).await?;
        Ok(session.resolve_prompt(prompt_id, response).await)
    }

    pub async fn attach_connection(
        &self,
        id: &str,
        conn: Arc<dyn Connection>,
    ) -> Result<(), SessionError> {
        let session = self.get(id).await?;
        let conn_id = conn.id().to_string();
        session.attach(conn).await?;
        tracing::debug!("Connection {} attached to session '{}'", conn_id, id);
        Ok(())
    }

    /// Remove a connection. The session itself is left for the reaper.
    pub async fn detach_connection(&self, id: &str, conn_id: &str) -> Result<bool, SessionError> {
        let session = self.get(id).await?;
        let removed = session.detach(conn_id).await;
        if removed {
            tracing::debug!("Connection {} detached from session '{}'", conn_id, id);
        }
        Ok(removed)
    }

    /// Destroy every session with no live connections that has been idle
    /// longer than the configured threshold. Returns the reaped ids.
    pub async fn reap_idle(&self) -> Vec<String> {
        let reaped: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let mut idle = Vec::new();
            for (id, session) in sessions.iter() {
                if session.is_idle(self.config.idle_timeout).await {
                    idle.push(id.clone());
                }
            }
            idle.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(reaped.len());
        for session in reaped {
            tracing::info!("Reaping idle session '{}'", session.id());
            self.teardown(&session).await;
            ids.push(session.id().to_string());
        }
        ids
    }

    /// Run [`reap_idle`](Self::reap_idle) every `reap_interval` until
    /// [`shutdown`](Self::shutdown).
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::downgrade(self);
        let cancel = self.reaper.clone();
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(supervisor) = supervisor.upgrade() else {
                            break;
                        };
                        let reaped = supervisor.reap_idle().await;
                        if !reaped.is_empty() {
                            tracing::debug!("Reaper destroyed {} session(s)", reaped.len());
                        }
                    }
                }
            }
        })
    }

    /// Tear down one session. Returns `false` if it did not exist.
    pub async fn destroy(&self, id: &str) -> bool {
        let session = self.sessions.lock().await.remove(id);
        match session {
            Some(session) => {
                self.teardown(&session).await;
                true
            }
            None => false,
        }
    }

    /// Stop the reaper and destroy every session.
    pub async fn shutdown(&self) {
        self.reaper.cancel();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &sessions {
            self.teardown(session).await;
        }
        tracing::info!("Supervisor shut down ({} sessions)", sessions.len());
    }

    /// Reject pending prompts, close connections, terminate the tool server
    /// and remove the working directory.
    async fn teardown(&self, session: &Session) {
        let (prompts, connections) = {
            let mut state = session.state.lock().await;
            state.terminated = true;
            let prompts: Vec<_> = state.prompts.drain().map(|(_, tx)| tx).collect();
            let connections: Vec<_> = state.connections.drain().map(|(_, c)| c).collect();
            (prompts, connections)
        };

        for tx in prompts {
            let _ = tx.send(PromptOutcome::Terminated);
        }
        for conn in connections {
            conn.close(SESSION_CLOSED_CODE, "session terminated");
        }

        let slot = std::mem::replace(&mut *session.client.lock().await, ClientSlot::Unconfigured);
        if let ClientSlot::Ready(client) = slot {
            client.shutdown().await;
        }

        if self.config.cleanup_workdirs {
            if let Err(e) = tokio::fs::remove_dir_all(session.workdir()).await {
                tracing::warn!(
                    "Failed to remove {} for session '{}': {e}",
                    session.workdir().display(),
                    session.id()
                );
            }
        }
        tracing::info!("Session '{}' destroyed", session.id());
    }

    /// Ids of every live session.
    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn phase(&self, id: &str) -> Result<SessionPhase, SessionError> {
        Ok(self.get(id).await?.phase().await)
    }

    pub async fn pending_prompt_count(&self, id: &str) -> Result<usize, SessionError> {
        Ok(self.get(id).await?.pending_prompt_count().await)
    }

    pub async fn connection_count(&self, id: &str) -> Result<usize, SessionError> {
        Ok(self.get(id).await?.connection_count().await)
    }
}
