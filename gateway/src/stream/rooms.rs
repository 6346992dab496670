//! Widget pub/sub rooms.
//!
//! Subscribers attach over the widget WebSocket with a room identifier (the
//! agent extension). Events are fanned out as serialized JSON; senders whose
//! subscriber went away are pruned on the next publish.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::results::Word;

/// Events emitted to widget subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum WidgetEvent {
    CallStart {
        uuid: String,
        exten: String,
        caller: String,
        callername: String,
        from: String,
        to: String,
        timestamp: u64,
    },
    Stt {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
        words: Vec<Word>,
        uuid: String,
        dir: String,
        speaker: String,
        exten: String,
        caller: String,
    },
    SttEnd {
        uuid: String,
    },
    Assist {
        text: String,
        speaker: String,
    },
}

/// Room registry.
#[derive(Default)]
pub struct Rooms {
    inner: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl Rooms {
    /// Attach a subscriber to a room.
    pub fn subscribe(&self, room: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .entry(room.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish an event to every live subscriber of a room.
    pub fn publish(&self, room: &str, event: &WidgetEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        let mut map = self.inner.lock();
        if let Some(subscribers) = map.get_mut(room) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
            if subscribers.is_empty() {
                map.remove(room);
            }
        } else {
            debug!(room, "no widget subscribers for event");
        }
    }

    /// Number of subscribers across all rooms.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

/// Milliseconds since the Unix epoch, for event timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
