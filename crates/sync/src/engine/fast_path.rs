// Ephemeral fast-path bus for window drag positions.
//
// In-process only: renders the dragged window at frame rate without waiting
// for the replicated document. Per-window dedup drops an event when the
// previous one was published inside the dedup window AND the window moved
// less than `min_delta` on both axes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use deskspace_common::types::Position;

const BUS_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    pub dedup_window_ms: u64,
    pub min_delta: f64,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self { dedup_window_ms: 16, min_delta: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DragEvent {
    pub space_id: String,
    pub window_id: String,
    pub position: Position,
}

#[derive(Debug, Clone, Copy)]
struct LastPublished {
    position: Position,
    at: Instant,
}

pub struct DragBus {
    dedup_window: Duration,
    min_delta: f64,
    last: Mutex<HashMap<String, LastPublished>>,
    tx: broadcast::Sender<DragEvent>,
}

impl DragBus {
    pub fn new(config: FastPathConfig) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            dedup_window: Duration::from_millis(config.dedup_window_ms),
            min_delta: config.min_delta,
            last: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Publish a drag position. Returns false when the event was deduplicated.
    pub fn publish(&self, space_id: &str, window_id: &str, position: Position) -> bool {
        self.publish_at(space_id, window_id, position, Instant::now())
    }

    pub fn publish_at(&self, space_id: &str, window_id: &str, position: Position, now: Instant) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return false;
        };
        if let Some(previous) = last.get(window_id) {
            let recent = now.saturating_duration_since(previous.at) < self.dedup_window;
            if recent && !position.moved_at_least(&previous.position, self.min_delta) {
                trace!(window_id, "drag event deduplicated");
                return false;
            }
        }
        last.insert(window_id.to_string(), LastPublished { position, at: now });
        drop(last);

        // Err only means nobody is listening.
        let _ = self.tx.send(DragEvent {
            space_id: space_id.to_string(),
            window_id: window_id.to_string(),
            position,
        });
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DragEvent> {
        self.tx.subscribe()
    }

    /// Clear the dedup entry so the next drag of this window always dispatches.
    pub fn forget(&self, window_id: &str) {
        if let Ok(mut last) = self.last.lock() {
            last.remove(window_id);
        }
    }
}

impl Default for DragBus {
    fn default() -> Self {
        Self::new(FastPathConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_fast_moves_are_dropped() {
        let bus = DragBus::default();
        let mut rx = bus.subscribe();
        let now = Instant::now();

        assert!(bus.publish_at("s1", "w1", Position::new(0.0, 0.0), now));
        assert!(!bus.publish_at("s1", "w1", Position::new(0.5, 0.5), now + Duration::from_millis(5)));
        assert!(bus.publish_at("s1", "w1", Position::new(3.0, 0.0), now + Duration::from_millis(8)));

        assert_eq!(rx.recv().await.unwrap().position, Position::new(0.0, 0.0));
        assert_eq!(rx.recv().await.unwrap().position, Position::new(3.0, 0.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn small_moves_pass_after_dedup_window() {
        let bus = DragBus::default();
        let now = Instant::now();
        assert!(bus.publish_at("s1", "w1", Position::new(0.0, 0.0), now));
        assert!(bus.publish_at("s1", "w1", Position::new(0.2, 0.0), now + Duration::from_millis(20)));
    }

    #[test]
    fn windows_are_deduplicated_independently() {
        let bus = DragBus::default();
        let now = Instant::now();
        assert!(bus.publish_at("s1", "w1", Position::new(0.0, 0.0), now));
        assert!(bus.publish_at("s1", "w2", Position::new(0.0, 0.0), now));
    }

    #[test]
    fn forget_resets_dedup() {
        let bus = DragBus::default();
        let now = Instant::now();
        assert!(bus.publish_at("s1", "w1", Position::new(0.0, 0.0), now));
        bus.forget("w1");
        assert!(bus.publish_at("s1", "w1", Position::new(0.0, 0.0), now + Duration::from_millis(1)));
    }
}
