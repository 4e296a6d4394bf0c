//! Session supervisor: one tool server process per logical session.
//!
//! Sessions are created on demand, configured once with per-session
//! environment settings, and reclaimed after they sit idle with no live
//! connections. Prompts raised by a session's tool server are fanned out to
//! every attached connection; the first answer wins.

pub mod connection;
pub mod error;
pub mod event;
pub mod factory;
pub mod login;
pub mod session;
pub mod supervisor;

pub use connection::{ChannelConnection, Connection, SESSION_CLOSED_CODE};
pub use error::SessionError;
pub use event::SessionEvent;
pub use factory::{ClientFactory, LaunchSpec, ProcessClientFactory};
pub use login::{LoginConfig, LoginOutcome, run_login};
pub use session::{Session, SessionPhase};
pub use supervisor::{SESSION_DIR_ENV, SESSION_ID_ENV, Supervisor, SupervisorConfig};
