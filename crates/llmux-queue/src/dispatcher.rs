use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::queue::{AdmissionQueue, DISPATCH_TICK};

/// The single dispatcher task. It drains the queue on every enqueue or
/// completion wake, on every key-state change, and at least every tick so a
/// lockout expiry is never missed.
pub fn spawn_dispatcher(queue: Arc<AdmissionQueue>) -> JoinHandle<()> {
    let mut key_events = queue.keypool().events().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = queue.notified() => {}
                event = key_events.recv() => {
                    // Lagged receivers just trigger an extra pass.
                    if let Ok(event) = event {
                        tracing::trace!(service = %event.service, kind = ?event.kind, "key event");
                    }
                }
                _ = tokio::time::sleep(DISPATCH_TICK) => {}
            }
            queue.drain().await;
        }
    })
}
