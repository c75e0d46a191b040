//! In-process broker.
//!
//! Mirrors the AMQP behaviour the pipeline depends on: fanout exchanges,
//! default-exchange routing by queue name, per-channel prefetch, ack, nack
//! with and without requeue, and requeue of unacknowledged messages when a
//! channel closes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::errors::{BrokerError, BrokerResult};
use super::{
    Acknowledger, BrokerChannel, BrokerConnector, Delivery, Subscription, Topology,
    DEFAULT_EXCHANGE,
};

/// Prefetch when the consumer never asks for one (AMQP treats 0 as unlimited)
const UNLIMITED_PREFETCH: usize = Semaphore::MAX_PERMITS;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: VecDeque<StoredMessage>,
    /// delivery tag -> (channel id, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// exchange name -> bound queues
    exchanges: HashMap<String, HashSet<String>>,
    queues: HashMap<String, MemoryQueue>,
    next_delivery_tag: u64,
    published: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    unavailable: AtomicBool,
    next_channel_id: AtomicU64,
}

/// In-memory broker; clones share the same queues
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable broker; `open` fails while set
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Messages waiting for delivery on a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered but not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Bodies waiting on a queue, oldest first
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Queues bound to an exchange, sorted
    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        let mut bound: Vec<String> = self
            .state()
            .exchanges
            .get(exchange)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        bound.sort();
        bound
    }

    /// Total successful publishes, across all channels
    pub fn published_count(&self) -> u64 {
        self.state().published
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-update; the data is still usable.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn open(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let id = self.shared.next_channel_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            id,
            prefetch: Mutex::new(Arc::new(Semaphore::new(UNLIMITED_PREFETCH))),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    prefetch: Mutex<Arc<Semaphore>>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }

    fn prefetch_semaphore(&self) -> Arc<Semaphore> {
        self.prefetch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_topology(&self, topology: &Topology) -> BrokerResult<()> {
        self.ensure_open()?;

        let mut state = self.broker.state();
        state.queues.entry(topology.queue.clone()).or_default();
        state
            .queues
            .entry(topology.dead_letter_queue.clone())
            .or_default();
        state
            .exchanges
            .entry(topology.exchange.clone())
            .or_default()
            .insert(topology.queue.clone());
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<()> {
        self.ensure_open()?;

        let mut state = self.broker.state();
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::NotFound(format!("exchange '{}'", exchange)))?
                .iter()
                .cloned()
                .collect()
        };

        // Unroutable messages are dropped, as AMQP does without the mandatory flag.
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(StoredMessage {
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
        }
        state.published += 1;
        drop(state);

        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> BrokerResult<()> {
        self.ensure_open()?;

        let permits = if prefetch == 0 {
            UNLIMITED_PREFETCH
        } else {
            prefetch as usize
        };
        *self
            .prefetch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(Semaphore::new(permits));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> BrokerResult<Box<dyn Subscription>> {
        self.ensure_open()?;

        if !self.broker.queue_exists(queue) {
            return Err(BrokerError::NotFound(format!("queue '{}'", queue)));
        }

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            channel_id: self.id,
            queue: queue.to_string(),
            prefetch: self.prefetch_semaphore(),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.prefetch_semaphore().close();

        let mut state = self.broker.state();
        for queue in state.queues.values_mut() {
            let mine: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (channel, _))| *channel == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in mine {
                if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        drop(state);

        self.broker.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    channel_id: u64,
    queue: String,
    prefetch: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        let permit = Arc::clone(&self.prefetch).acquire_owned().await.ok()?;

        loop {
            let notified = self.broker.shared.notify.notified();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            {
                let mut state = self.broker.state();
                let tag = state.next_delivery_tag;
                let queue = state.queues.get_mut(&self.queue)?;
                if let Some(message) = queue.ready.pop_front() {
                    let body = message.body.clone();
                    let redelivered = message.redelivered;
                    queue.unacked.insert(tag, (self.channel_id, message));
                    state.next_delivery_tag += 1;

                    let acker = MemoryAcker {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        tag,
                        permit: Mutex::new(Some(permit)),
                    };
                    return Some(Ok(Delivery::new(body, redelivered, Box::new(acker))));
                }
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> BrokerResult<()> {
        let mut state = self.broker.state();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", self.queue)))?;
        let (_, mut message) = queue
            .unacked
            .remove(&self.tag)
            .ok_or(BrokerError::ChannelClosed)?;

        if requeue {
            message.redelivered = true;
            queue.ready.push_front(message);
        }
        drop(state);

        // Releasing the permit lets the subscription hand out the next message.
        self.permit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if requeue {
            self.broker.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.settle(requeue)
    }
}
