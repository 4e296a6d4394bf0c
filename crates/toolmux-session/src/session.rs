//! One logical user session: its client, live connections and pending
//! prompts.

use crate::connection::Connection;
use crate::error::SessionError;
use crate::event::SessionEvent;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use toolmux_mcp::{InboundError, InboundHandler, ProtocolClient};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unconfigured,
    Configuring,
    Ready,
    Destroyed,
}

/// The session's tool server slot.
pub(crate) enum ClientSlot {
    Unconfigured,
    Configuring,
    Ready(Arc<ProtocolClient>),
}

/// How a pending prompt was settled by someone other than its waiter.
#[derive(Debug)]
pub(crate) enum PromptOutcome {
    Resolved(serde_json::Value),
    Terminated,
}

pub(crate) struct SessionState {
    pub(crate) connections: HashMap<String, Arc<dyn Connection>>,
    pub(crate) prompts: HashMap<String, oneshot::Sender<PromptOutcome>>,
    pub(crate) settings: HashMap<String, String>,
    pub(crate) last_activity: Instant,
    pub(crate) terminated: bool,
}

/// A session keyed by an opaque identifier.
pub struct Session {
    id: String,
    workdir: PathBuf,
    pub(crate) client: Mutex<ClientSlot>,
    pub(crate) state: Mutex<SessionState>,
    prompt_seq: AtomicU64,
}

impl Session {
    pub(crate) fn new(id: String, workdir: PathBuf) -> Self {
        Self {
            id,
            workdir,
            client: Mutex::new(ClientSlot::Unconfigured),
            state: Mutex::new(SessionState {
                connections: HashMap::new(),
                prompts: HashMap::new(),
                settings: HashMap::new(),
                last_activity: Instant::now(),
                terminated: false,
            }),
            prompt_seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session-private working directory.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub async fn phase(&self) -> SessionPhase {
        if self.state.lock().await.terminated {
            return SessionPhase::Destroyed;
        }
        match &*self.client.lock().await {
            ClientSlot::Unconfigured => SessionPhase::Unconfigured,
            ClientSlot::Configuring => SessionPhase::Configuring,
            ClientSlot::Ready(client) if client.is_running().await => SessionPhase::Ready,
            // The tool server exited; the next configure relaunches it
            ClientSlot::Ready(_) => SessionPhase::Unconfigured,
        }
    }

    /// The ready client, if configuration has completed and its process is
    /// still running.
    pub async fn client(&self) -> Option<Arc<ProtocolClient>> {
        match &*self.client.lock().await {
            ClientSlot::Ready(client) if client.is_running().await => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// Clear a ready slot whose tool server has exited, returning the session
    /// to unconfigured. The dead client is handed back for shutdown.
    pub(crate) async fn take_dead_client(&self) -> Option<Arc<ProtocolClient>> {
        let mut slot = self.client.lock().await;
        let dead = match &*slot {
            ClientSlot::Ready(client) => !client.is_running().await,
            _ => false,
        };
        if !dead {
            return None;
        }
        match std::mem::replace(&mut *slot, ClientSlot::Unconfigured) {
            ClientSlot::Ready(client) => Some(client),
            _ => None,
        }
    }

    /// Settings supplied by the last successful `configure`.
    pub async fn settings(&self) -> HashMap<String, String> {
        self.state.lock().await.settings.clone()
    }

    pub(crate) async fn touch(&self) {
        self.state.lock().await.last_activity = Instant::now();
    }

    /// No live connections and no activity for longer than `threshold`.
    pub(crate) async fn is_idle(&self, threshold: Duration) -> bool {
        let state = self.state.lock().await;
        state.connections.is_empty() && state.last_activity.elapsed() > threshold
    }

    pub(crate) async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminated
    }

    pub(crate) async fn attach(&self, conn: Arc<dyn Connection>) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.terminated {
            return Err(self.terminated());
        }
        state.connections.insert(conn.id().to_string(), conn);
        state.last_activity = Instant::now();
        Ok(())
    }

    pub(crate) async fn detach(&self, conn_id: &str) -> bool {
        self.state.lock().await.connections.remove(conn_id).is_some()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn pending_prompt_count(&self) -> usize {
        self.state.lock().await.prompts.len()
    }

    /// Send an event to every live connection; returns how many accepted it.
    pub(crate) async fn broadcast(&self, event: SessionEvent) -> usize {
        let connections: Vec<Arc<dyn Connection>> =
            self.state.lock().await.connections.values().cloned().collect();
        let mut delivered = 0;
        for conn in connections {
            if conn.send(event.clone()) {
                delivered += 1;
            } else {
                tracing::debug!("Connection {} of session '{}' is gone", conn.id(), self.id);
            }
        }
        delivered
    }

    /// Announce a prompt to every live connection and wait for the first
    /// answer.
    ///
    /// Fails at once with `NoClients` when nobody is attached.
    pub(crate) async fn prompt(
        &self,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        let (prompt_id, rx, connections) = {
            let mut state = self.state.lock().await;
            if state.terminated {
                return Err(self.terminated());
            }
            if state.connections.is_empty() {
                return Err(SessionError::NoClients {
                    id: self.id.clone(),
                });
            }
            let prompt_id = self.next_prompt_id();
            let (tx, rx) = oneshot::channel();
            state.prompts.insert(prompt_id.clone(), tx);
            let connections: Vec<Arc<dyn Connection>> =
                state.connections.values().cloned().collect();
            (prompt_id, rx, connections)
        };

        let event = SessionEvent::Prompt {
            id: prompt_id.clone(),
            params,
        };
        let delivered = connections
            .iter()
            .filter(|conn| conn.send(event.clone()))
            .count();
        if delivered == 0 {
            self.state.lock().await.prompts.remove(&prompt_id);
            return Err(SessionError::NoClients {
                id: self.id.clone(),
            });
        }
        tracing::info!(
            "Session '{}' prompt {} sent to {} connection(s)",
            self.id,
            prompt_id,
            delivered
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(PromptOutcome::Resolved(response))) => Ok(response),
            Ok(Ok(PromptOutcome::Terminated)) | Ok(Err(_)) => Err(self.terminated()),
            Err(_) => {
                self.state.lock().await.prompts.remove(&prompt_id);
                tracing::warn!("Session '{}' prompt {} timed out", self.id, prompt_id);
                Err(SessionError::PromptTimeout {
                    id: self.id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Settle a pending prompt. The first answer wins; later answers for the
    /// same id return `false` and change nothing.
    pub(crate) async fn resolve_prompt(&self, prompt_id: &str, response: serde_json::Value) -> bool {
        let tx = {
            let mut state = self.state.lock().await;
            state.last_activity = Instant::now();
            state.prompts.remove(prompt_id)
        };
        match tx {
            Some(tx) => tx.send(PromptOutcome::Resolved(response)).is_ok(),
            None => {
                tracing::debug!(
                    "Ignoring answer for settled prompt {} in session '{}'",
                    prompt_id,
                    self.id
                );
                false
            }
        }
    }

    fn next_prompt_id(&self) -> String {
        let seq = self.prompt_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", self.id, Utc::now().timestamp_millis(), seq)
    }

    fn terminated(&self) -> SessionError {
        SessionError::SessionTerminated {
            id: self.id.clone(),
        }
    }
}

/// Answers the child's `prompts/get` by asking the session's connections.
///
/// Holds a weak reference: the session owns the client that owns this
/// handler.
pub(crate) struct SessionPrompter {
    session: Weak<Session>,
    timeout: Duration,
}

impl SessionPrompter {
    pub(crate) fn new(session: Weak<Session>, timeout: Duration) -> Self {
        Self { session, timeout }
    }
}

impl InboundHandler for SessionPrompter {
    fn handle(
        &self,
        params: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, InboundError>> + Send + '_>> {
        Box::pin(async move {
            let session = self
                .session
                .upgrade()
                .ok_or_else(|| InboundError::new("session was terminated"))?;
            session
                .prompt(params, self.timeout)
                .await
                .map_err(|e| InboundError::new(e.to_string()))
        })
    }
}

/// Stand-in for `resources/read`: no resources are exposed.
pub(crate) struct EmptyResources;

impl InboundHandler for EmptyResources {
    fn handle(
        &self,
        params: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, InboundError>> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!("resources/read requested: {params}");
            Ok(serde_json::json!({ "contents": [] }))
        })
    }
}
