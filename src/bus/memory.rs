//! In-memory bus used by tests and local development.
//!
//! Queues are simple FIFO buffers; requeued messages go to the back.
//! Delivery guarantees are weaker than the broker's (nothing survives the
//! process), which is exactly enough to exercise the consumers.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::{Acknowledge, BusError, Delivery, MessageBus};

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl QueueState {
    fn push(&self, payload: Vec<u8>) {
        self.messages
            .lock()
            .expect("queue mutex poisoned")
            .push_back(payload);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.messages
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()
    }
}

/// A process-local [`MessageBus`] implementation.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    queues: Arc<Mutex<HashMap<String, Arc<QueueState>>>>,
}

impl InMemoryBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        let mut queues = self.queues.lock().expect("bus mutex poisoned");
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    /// Number of messages currently buffered on a queue.
    pub fn depth(&self, name: &str) -> usize {
        self.queue(name)
            .messages
            .lock()
            .expect("queue mutex poisoned")
            .len()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BusError> {
        self.queue(queue).push(payload.to_vec());
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        delay: Duration,
    ) -> Result<(), BusError> {
        let state = self.queue(queue);
        let payload = payload.to_vec();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.push(payload);
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, BusError> {
        let state = self.queue(queue);
        let bus = self.clone();
        let queue_name = queue.to_string();
        let (tx, rx) = mpsc::channel(prefetch.max(1) as usize);

        tokio::spawn(async move {
            loop {
                match state.pop() {
                    Some(payload) => {
                        let delivery = Delivery::new(
                            payload.clone(),
                            Box::new(MemoryAcker {
                                bus: bus.clone(),
                                queue: queue_name.clone(),
                                payload,
                            }),
                        );
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    None => state.notify.notified().await,
                }
            }
        });

        Ok(rx)
    }
}

struct MemoryAcker {
    bus: InMemoryBus,
    queue: String,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BusError> {
        if requeue {
            self.bus.publish(&self.queue, &self.payload).await?;
        }
        Ok(())
    }
}
