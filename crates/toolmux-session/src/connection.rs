//! Live front-end connections attached to a session.

use crate::event::SessionEvent;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Close code sent to connections when their session is torn down.
pub const SESSION_CLOSED_CODE: u16 = 1001;

/// One live front-end connection (a WebSocket, a stdio pipe, ...).
pub trait Connection: Send + Sync {
    /// Stable identifier, unique among a session's connections.
    fn id(&self) -> &str;

    /// Queue an event for delivery. Returns `false` if the connection is gone.
    fn send(&self, event: SessionEvent) -> bool;

    /// Deliver a terminal status; nothing is sent afterward.
    fn close(&self, code: u16, reason: &str);
}

/// A connection backed by an unbounded channel; the receiver side belongs
/// to whatever transport relays events to the real client.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    id: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelConnection {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id: Uuid::new_v4().to_string(),
            tx,
        };
        (conn, rx)
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(SessionEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let (a, _ra) = ChannelConnection::new();
        let (b, _rb) = ChannelConnection::new();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn send_and_close_reach_receiver() {
        let (conn, mut rx) = ChannelConnection::new();
        assert!(conn.send(SessionEvent::Tools { tools: vec![] }));
        conn.close(SESSION_CLOSED_CODE, "session terminated");

        assert_eq!(rx.recv().await, Some(SessionEvent::Tools { tools: vec![] }));
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Closed {
                code: SESSION_CLOSED_CODE,
                reason: "session terminated".into()
            })
        );
    }

    #[test]
    fn send_after_receiver_dropped_reports_failure() {
        let (conn, rx) = ChannelConnection::new();
        drop(rx);
        assert!(!conn.send(SessionEvent::Tools { tools: vec![] }));
    }
}
