//! In-process broker for tests.
//!
//! Queues are FIFO; a requeued or abandoned message goes to the back with
//! `redelivered` set. Every settlement is recorded so tests can assert on
//! ack policy.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Acknowledge, Broker, Deliveries, Message, Outgoing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
}

/// How a delivered message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<Stored>>,
    notify: Notify,
}

impl Queue {
    fn push(&self, item: Stored) {
        self.items.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Stored> {
        self.items.lock().unwrap().pop_front()
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    settlements: Arc<Mutex<Vec<(String, Settlement)>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        Arc::clone(
            self.queues
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default(),
        )
    }

    /// Put a raw message on `queue`.
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>, correlation_id: Option<&str>) {
        self.queue(queue).push(Stored {
            body: body.into(),
            correlation_id: correlation_id.map(String::from),
            redelivered: false,
        });
    }

    /// Messages currently waiting on `queue`.
    pub fn pending(&self, queue: &str) -> Vec<Stored> {
        self.queue(queue).items.lock().unwrap().iter().cloned().collect()
    }

    /// Settlements of messages taken from `queue`, in order.
    pub fn settlements(&self, queue: &str) -> Vec<Settlement> {
        self.settlements
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str) -> Result<()> {
        self.queue(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, message: Outgoing) -> Result<()> {
        self.queue(queue).push(Stored {
            body: message.body,
            correlation_id: message.correlation_id,
            redelivered: false,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries> {
        let name = queue.to_string();
        let q = self.queue(queue);
        let settlements = Arc::clone(&self.settlements);

        let stream = futures::stream::unfold((), move |()| {
            let q = Arc::clone(&q);
            let name = name.clone();
            let settlements = Arc::clone(&settlements);
            async move {
                loop {
                    // keep requeue loops from starving other tasks
                    tokio::task::yield_now().await;
                    if let Some(item) = q.pop() {
                        let acker = MemoryAcker {
                            queue: Arc::clone(&q),
                            name,
                            item: item.clone(),
                            settlements,
                            settled: AtomicBool::new(false),
                        };
                        let message = Message::new(
                            item.body,
                            item.correlation_id,
                            item.redelivered,
                            Box::new(acker),
                        );
                        return Some((Ok(message), ()));
                    }
                    q.notify.notified().await;
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

struct MemoryAcker {
    queue: Arc<Queue>,
    name: String,
    item: Stored,
    settlements: Arc<Mutex<Vec<(String, Settlement)>>>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn requeue(&self) {
        self.queue.push(Stored {
            redelivered: true,
            ..self.item.clone()
        });
    }

    async fn settle(&self, settlement: Settlement, requeue: bool) {
        self.settled.store(true, Ordering::SeqCst);
        self.settlements
            .lock()
            .unwrap()
            .push((self.name.clone(), settlement));
        if requeue {
            self.requeue();
            // step aside so another consumer can claim it
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Unsettled messages go back to the queue, as on a closed AMQP channel.
impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.requeue();
        }
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Ack, false).await;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Settlement::Nack { requeue }, requeue).await;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(Settlement::Reject { requeue }, requeue).await;
        Ok(())
    }
}
