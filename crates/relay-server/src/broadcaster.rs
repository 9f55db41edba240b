//! Per-connection outbound path: encodes server events and queues them for
//! the connection's writer task.

use relay_core::ids::ConnectionId;
use relay_core::protocol::{encode_event, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Sends [`ServerEvent`]s to one client connection.
///
/// The queue is bounded. A full queue makes `emit` wait for the writer, so
/// events are never dropped or reordered while the client is connected.
#[derive(Clone, Debug)]
pub struct Broadcaster {
    connection_id: ConnectionId,
    tx: mpsc::Sender<String>,
}

impl Broadcaster {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self { connection_id, tx }
    }

    /// A broadcaster together with the receiving end of its queue.
    pub fn channel(connection_id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(connection_id, tx), rx)
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Whether the connection's writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue one event. Returns `false` if the connection is gone.
    pub async fn emit(&self, event: ServerEvent) -> bool {
        let text = match encode_event(&event) {
            Ok(text) => text,
            Err(e) => {
                error!(connection_id = %self.connection_id, error = %e, "failed to encode event");
                return false;
            }
        };
        debug!(
            connection_id = %self.connection_id,
            event_type = event.event_type(),
            "emit"
        );
        self.tx.send(text).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::protocol::AgentStatus;
    use serde_json::Value;

    #[tokio::test]
    async fn emit_encodes_in_order() {
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 8);
        assert!(b.emit(ServerEvent::status(AgentStatus::Working)).await);
        assert!(b.emit(ServerEvent::TaskComplete { success: true }).await);

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "status");
        assert_eq!(first["status"], "working");
        assert_eq!(second["type"], "taskComplete");
        assert_eq!(second["success"], true);
    }

    #[tokio::test]
    async fn emit_after_close_reports_false() {
        let (b, rx) = Broadcaster::channel(ConnectionId::new(), 8);
        drop(rx);
        assert!(b.is_closed());
        assert!(!b.emit(ServerEvent::error("gone")).await);
    }

    #[tokio::test]
    async fn full_queue_waits_for_reader() {
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 1);
        assert!(b.emit(ServerEvent::Nav { url: "a".into() }).await);

        let sender = b.clone();
        let pending = tokio::spawn(async move { sender.emit(ServerEvent::Nav { url: "b".into() }).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert!(rx.recv().await.unwrap().contains("\"a\""));
        assert!(pending.await.unwrap());
        assert!(rx.recv().await.unwrap().contains("\"b\""));
    }
}
