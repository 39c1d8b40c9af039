use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use llmux_common::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyEventKind {
    RateLimited,
    Disabled,
    Updated,
    Recovered,
}

/// Key-state change notification. The dispatcher subscribes so partitions
/// re-evaluate eligibility without waiting for the periodic tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub service: Service,
    pub hash: String,
    pub kind: KeyEventKind,
}

#[derive(Clone)]
pub struct KeyEventHub {
    tx: broadcast::Sender<KeyEvent>,
}

impl KeyEventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: KeyEvent) {
        // No receivers is fine; state changes are observable via the pool.
        let _ = self.tx.send(event);
    }
}
