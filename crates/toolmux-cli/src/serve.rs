//! Line-delimited JSON front end: one command per stdin line, one event per
//! stdout line.
//!
//! Every command names a session key; the first command for a key creates
//! the session and attaches a connection whose events are echoed to stdout
//! tagged with that key.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use toolmux_session::{ChannelConnection, Connection, SessionEvent, Supervisor};

#[derive(Debug, Deserialize)]
struct Envelope {
    session: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    Configure {
        #[serde(default)]
        settings: HashMap<String, String>,
    },
    CallTool {
        tool: String,
        #[serde(default = "empty_arguments")]
        arguments: Value,
    },
    ListTools {},
    PromptResponse {
        prompt_id: String,
        response: Value,
    },
    Detach {},
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Configure { .. } => "configure",
            Command::CallTool { .. } => "call_tool",
            Command::ListTools {} => "list_tools",
            Command::PromptResponse { .. } => "prompt_response",
            Command::Detach {} => "detach",
        }
    }
}

fn empty_arguments() -> Value {
    Value::Object(Default::default())
}

/// Replies that are not session events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Configured {},
    PromptResolved { prompt_id: String, accepted: bool },
    Detached {},
    Error { command: String, message: String },
}

/// Serializes `body` with the session key added alongside its fields.
fn tagged(session: &str, body: impl Serialize) -> String {
    let mut value = serde_json::to_value(body).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("session".into(), Value::String(session.to_string()));
    }
    value.to_string()
}

/// Routes parsed commands to the supervisor.
pub struct Frontend {
    supervisor: Arc<Supervisor>,
    out: mpsc::UnboundedSender<String>,
    connections: HashMap<String, ChannelConnection>,
}

impl Frontend {
    pub fn new(supervisor: Arc<Supervisor>, out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            supervisor,
            out,
            connections: HashMap::new(),
        }
    }

    pub async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return self.reply("", Reply::error("parse", e)),
        };
        let session = match Envelope::deserialize(&value) {
            Ok(envelope) => envelope.session,
            Err(e) => return self.reply("", Reply::error("parse", e)),
        };
        let command = match Command::deserialize(&value) {
            Ok(command) => command,
            Err(e) => return self.reply(&session, Reply::error("parse", e)),
        };
        tracing::debug!("Session '{}': {}", session, command.name());
        let name = command.name();
        if let Err(e) = self.dispatch(&session, command).await {
            self.reply(&session, Reply::error(name, e));
        }
    }

    async fn dispatch(&mut self, session: &str, command: Command) -> Result<()> {
        if let Command::Detach {} = command {
            if let Some(conn) = self.connections.remove(session) {
                self.supervisor.detach_connection(session, conn.id()).await?;
            }
            self.reply(session, Reply::Detached {});
            return Ok(());
        }

        let conn = self.connection(session).await?;
        match command {
            Command::Configure { settings } => {
                // Login may take minutes; keep reading commands meanwhile.
                let supervisor = Arc::clone(&self.supervisor);
                let out = self.out.clone();
                let session = session.to_string();
                tokio::spawn(async move {
                    let reply = match supervisor.configure(&session, settings).await {
                        Ok(()) => Reply::Configured {},
                        Err(e) => Reply::error("configure", e),
                    };
                    let _ = out.send(tagged(&session, reply));
                });
            }
            Command::CallTool { tool, arguments } => {
                // A tool call can block on a prompt answered by a later line.
                let supervisor = Arc::clone(&self.supervisor);
                let out = self.out.clone();
                let session = session.to_string();
                tokio::spawn(async move {
                    match supervisor.call_tool(&session, &tool, arguments).await {
                        Ok(result) => {
                            conn.send(SessionEvent::ToolResult { tool, result });
                        }
                        Err(e) => {
                            let _ = out.send(tagged(&session, Reply::error("call_tool", e)));
                        }
                    }
                });
            }
            Command::ListTools {} => {
                let tools = self.supervisor.list_tools(session).await?;
                conn.send(SessionEvent::Tools { tools });
            }
            Command::PromptResponse {
                prompt_id,
                response,
            } => {
                let accepted = self
                    .supervisor
                    .respond_prompt(session, &prompt_id, response)
                    .await?;
                self.reply(
                    session,
                    Reply::PromptResolved {
                        prompt_id,
                        accepted,
                    },
                );
            }
            Command::Detach {} => {}
        }
        Ok(())
    }

    /// The connection for `session`, creating the session and attaching a
    /// stdout-bound connection on first use.
    async fn connection(&mut self, session: &str) -> Result<ChannelConnection> {
        if let Some(conn) = self.connections.get(session) {
            return Ok(conn.clone());
        }
        self.supervisor.get_or_create(session).await?;
        let (conn, mut events) = ChannelConnection::new();
        self.supervisor
            .attach_connection(session, Arc::new(conn.clone()))
            .await?;

        let out = self.out.clone();
        let key = session.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if out.send(tagged(&key, &event)).is_err() {
                    break;
                }
            }
        });
        self.connections.insert(session.to_string(), conn.clone());
        Ok(conn)
    }

    fn reply(&self, session: &str, reply: Reply) {
        let _ = self.out.send(tagged(session, reply));
    }
}

impl Reply {
    fn error(command: &str, err: impl std::fmt::Display) -> Self {
        Reply::Error {
            command: command.to_string(),
            message: err.to_string(),
        }
    }
}

/// Run the front end until stdin closes or a shutdown signal arrives.
pub async fn run(supervisor: Arc<Supervisor>) -> Result<()> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(out_rx));
    let reaper = supervisor.spawn_reaper();

    let mut frontend = Frontend::new(Arc::clone(&supervisor), out_tx);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => frontend.handle_line(&line).await,
                None => {
                    tracing::info!("stdin closed");
                    break;
                }
            },
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    supervisor.shutdown().await;
    drop(frontend);
    let _ = reaper.await;
    // Forwarders finish once their connections are dropped.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer).await;
    Ok(())
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            break;
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {},
                    _ = tokio::signal::ctrl_c() => {},
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
