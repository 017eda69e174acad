// Room transport: one logical room per replicated-document key.
//
// A member joins a room and gets a channel pair. Frames it sends are
// delivered to every other member; it never receives its own frames.
// Transport is abstracted via `RoomTransport` so the registry can run over
// an in-process hub (multi-session, simulator, tests) or a network relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-room fan-out capacity before slow members start lagging.
const ROOM_CAPACITY: usize = 1024;

/// Binary CRDT sync frames exchanged inside a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomFrame {
    /// Sent on join: "here is my state vector, send me what I'm missing".
    SyncRequest { state_vector: Vec<u8> },
    /// An encoded v1 update.
    Update { payload: Vec<u8> },
}

/// A frame plus the member that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub sender: Uuid,
    pub frame: RoomFrame,
}

/// A live room membership. Cancelling `leave` (or dropping the connection's
/// owner task) leaves the room.
pub struct RoomConnection {
    pub room: String,
    pub outbound: mpsc::UnboundedSender<RoomFrame>,
    pub inbound: mpsc::UnboundedReceiver<RoomMessage>,
    pub leave: CancellationToken,
}

/// Abstraction over the network transport for testability.
pub trait RoomTransport: Send + Sync + 'static {
    /// Join `room` as `member`. Must be called from within a tokio runtime.
    fn join(&self, room: &str, member: Uuid) -> Result<RoomConnection>;
}

/// In-process transport: rooms are broadcast channels shared by every
/// session that holds a clone of the hub.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    rooms: Arc<Mutex<HashMap<String, broadcast::Sender<RoomMessage>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members currently joined to `room`.
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .ok()
            .and_then(|rooms| rooms.get(room).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    fn room_sender(&self, room: &str) -> Result<broadcast::Sender<RoomMessage>> {
        let mut rooms = self.rooms.lock().map_err(|_| anyhow!("room table lock poisoned"))?;
        let sender =
            rooms.entry(room.to_string()).or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0);
        Ok(sender.clone())
    }
}

impl RoomTransport for LocalHub {
    fn join(&self, room: &str, member: Uuid) -> Result<RoomConnection> {
        let room_tx = self.room_sender(room)?;
        let mut room_rx = room_tx.subscribe();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RoomFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RoomMessage>();
        let leave = CancellationToken::new();

        let task_leave = leave.clone();
        let room_name = room.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_leave.cancelled() => {
                        // Frames queued before leaving still go out.
                        while let Ok(frame) = outbound_rx.try_recv() {
                            let _ = room_tx.send(RoomMessage { sender: member, frame });
                        }
                        break;
                    }
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        // Err only means nobody else is in the room right now.
                        let _ = room_tx.send(RoomMessage { sender: member, frame });
                    }
                    message = room_rx.recv() => match message {
                        Ok(message) if message.sender == member => {}
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(room = %room_name, skipped, "room member lagged, frames dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(room = %room_name, %member, "left room");
        });

        debug!(room, %member, "joined room");
        Ok(RoomConnection { room: room.to_string(), outbound: outbound_tx, inbound: inbound_rx, leave })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn frames_reach_other_members_but_not_sender() {
        let hub = LocalHub::new();
        let a = hub.join("space:s1", Uuid::new_v4()).unwrap();
        let mut b = hub.join("space:s1", Uuid::new_v4()).unwrap();
        let mut a_inbound = a.inbound;

        a.outbound.send(RoomFrame::Update { payload: vec![1, 2, 3] }).unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), b.inbound.recv())
            .await
            .expect("b should receive within timeout")
            .expect("channel open");
        assert_eq!(message.frame, RoomFrame::Update { payload: vec![1, 2, 3] });

        let echo = tokio::time::timeout(Duration::from_millis(50), a_inbound.recv()).await;
        assert!(echo.is_err(), "sender must not receive its own frame");
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let hub = LocalHub::new();
        let a = hub.join("space:s1", Uuid::new_v4()).unwrap();
        let mut other = hub.join("space:s2", Uuid::new_v4()).unwrap();

        a.outbound.send(RoomFrame::Update { payload: vec![9] }).unwrap();
        let received = tokio::time::timeout(Duration::from_millis(50), other.inbound.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn leaving_stops_delivery() {
        let hub = LocalHub::new();
        let a = hub.join("presence-s1", Uuid::new_v4()).unwrap();
        let mut b = hub.join("presence-s1", Uuid::new_v4()).unwrap();
        assert_eq!(hub.member_count("presence-s1"), 2);

        b.leave.cancel();
        tokio::task::yield_now().await;
        a.outbound.send(RoomFrame::Update { payload: vec![7] }).unwrap();

        let received = tokio::time::timeout(Duration::from_millis(50), b.inbound.recv()).await;
        assert!(matches!(received, Ok(None)) || received.is_err());
    }
}
