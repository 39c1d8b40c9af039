use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::Instant;

use llmux_common::{ModelFamily, ProxyError, Service};
use llmux_keypool::{KeyPool, KeyRecord};

use crate::estimator::WaitEstimator;

/// Upper bound between dispatcher passes even when no wake event fires.
pub const DISPATCH_TICK: Duration = Duration::from_millis(100);

/// One queued request awaiting a key. Dropping the receiver side cancels it;
/// the dispatcher observes the closed channel and skips the ticket.
pub struct Ticket {
    pub model: String,
    pub first_enqueued_at: Instant,
    tx: oneshot::Sender<KeyRecord>,
}

struct Partition {
    fifo: VecDeque<Ticket>,
    waits: WaitEstimator,
    inflight: usize,
}

impl Partition {
    fn new() -> Self {
        Self {
            fifo: VecDeque::new(),
            waits: WaitEstimator::new(),
            inflight: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionStats {
    pub queued: usize,
    pub inflight: usize,
    pub estimated_wait: Duration,
}

/// The partitioned admission queue: one FIFO per `(service, family)` plus a
/// rotation cursor for round-robin draining.
pub struct AdmissionQueue {
    keypool: Arc<KeyPool>,
    partitions: Mutex<HashMap<(Service, ModelFamily), Partition>>,
    cursor: Mutex<usize>,
    notify: Notify,
}

impl AdmissionQueue {
    pub fn new(keypool: Arc<KeyPool>) -> Arc<Self> {
        Arc::new(Self {
            keypool,
            partitions: Mutex::new(HashMap::new()),
            cursor: Mutex::new(0),
            notify: Notify::new(),
        })
    }

    pub fn keypool(&self) -> &Arc<KeyPool> {
        &self.keypool
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Append at the partition tail and wake the dispatcher. Fails fast when
    /// no key of the service owns the family at all (infinite lockout).
    /// Re-enqueues pass their original `first_enqueued_at` and still join at
    /// the tail.
    pub async fn enqueue(
        &self,
        service: Service,
        family: ModelFamily,
        model: impl Into<String>,
        first_enqueued_at: Option<Instant>,
    ) -> Result<oneshot::Receiver<KeyRecord>, ProxyError> {
        if self.keypool.lockout_period(service, family).await.is_none() {
            return Err(ProxyError::NoKeysAvailable(format!("{service}/{family}")));
        }

        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        let ticket = Ticket {
            model: model.into(),
            first_enqueued_at: first_enqueued_at.unwrap_or(now),
            tx,
        };
        {
            let mut partitions = self.partitions.lock().await;
            partitions
                .entry((service, family))
                .or_insert_with(Partition::new)
                .fifo
                .push_back(ticket);
        }
        tracing::debug!(service = %service, family = %family, "request queued");
        self.wake();
        Ok(rx)
    }

    /// One dispatcher pass: visit non-empty partitions round-robin and pop
    /// every head that can be served right now.
    pub async fn drain(&self) {
        let keys: Vec<(Service, ModelFamily)> = {
            let partitions = self.partitions.lock().await;
            let mut keys: Vec<_> = partitions
                .iter()
                .filter(|(_, partition)| !partition.fifo.is_empty())
                .map(|(key, _)| *key)
                .collect();
            keys.sort();
            keys
        };
        if keys.is_empty() {
            return;
        }

        let start = {
            let mut cursor = self.cursor.lock().await;
            let start = *cursor % keys.len();
            *cursor = cursor.wrapping_add(1);
            start
        };

        for offset in 0..keys.len() {
            let (service, family) = keys[(start + offset) % keys.len()];
            self.drain_partition(service, family).await;
        }
    }

    async fn drain_partition(&self, service: Service, family: ModelFamily) {
        loop {
            // Look-ahead: drop cancelled heads before spending a key.
            {
                let mut partitions = self.partitions.lock().await;
                let Some(partition) = partitions.get_mut(&(service, family)) else {
                    return;
                };
                while matches!(partition.fifo.front(), Some(head) if head.tx.is_closed()) {
                    partition.fifo.pop_front();
                    tracing::debug!(service = %service, family = %family, "dropped cancelled request");
                }
                if partition.fifo.is_empty() {
                    return;
                }
            }

            if self.keypool.available(service, Some(family)).await == 0 {
                return;
            }
            let Ok(key) = self.keypool.get(service, family).await else {
                return;
            };

            let mut partitions = self.partitions.lock().await;
            let Some(partition) = partitions.get_mut(&(service, family)) else {
                return;
            };
            let Some(ticket) = partition.fifo.pop_front() else {
                return;
            };
            let wait = Instant::now().saturating_duration_since(ticket.first_enqueued_at);
            partition.waits.record(wait);
            if ticket.tx.send(key).is_ok() {
                partition.inflight += 1;
            }
        }
    }

    /// Called by the pipeline when an upstream attempt finishes, releasing
    /// the inflight slot and waking the dispatcher.
    pub async fn complete(&self, service: Service, family: ModelFamily) {
        let mut partitions = self.partitions.lock().await;
        if let Some(partition) = partitions.get_mut(&(service, family)) {
            partition.inflight = partition.inflight.saturating_sub(1);
        }
        drop(partitions);
        self.wake();
    }

    pub async fn stats(&self, service: Service, family: ModelFamily) -> PartitionStats {
        let mut partitions = self.partitions.lock().await;
        match partitions.get_mut(&(service, family)) {
            Some(partition) => {
                partition.fifo.retain(|ticket| !ticket.tx.is_closed());
                PartitionStats {
                    queued: partition.fifo.len(),
                    inflight: partition.inflight,
                    estimated_wait: partition.waits.estimate(),
                }
            }
            None => PartitionStats::default(),
        }
    }
}
