// src/queue/memory.rs
// In-process broker with RabbitMQ-like ack semantics, for local runs and tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use super::errors::{QueueError, Result};
use super::{Acknowledger, IncomingMessage, QueueClient, Subscription};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    /// Times this message has been handed to a consumer.
    deliveries: u32,
    retry_attempts: u32,
}

impl StoredMessage {
    fn new(body: Vec<u8>, retry_attempts: u32) -> Self {
        Self {
            body,
            deliveries: 0,
            retry_attempts,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    channel: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, InFlight>,
    dead_letters: Vec<Vec<u8>>,
    discarded: usize,
    open_channels: HashSet<u64>,
    next_channel: u64,
    next_tag: u64,
    published: usize,
    acked: usize,
    connects: usize,
    fail_connects: u32,
    fail_publishes: u32,
    /// Queue declared without a dead-letter route: rejected messages are lost.
    no_dead_letter: bool,
}

impl BrokerState {
    /// Closes a channel and puts its unsettled deliveries back at the head of the queue.
    fn close_channel(&mut self, channel: u64) {
        if !self.open_channels.remove(&channel) {
            return;
        }
        let mut tags: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(entry) = self.in_flight.remove(&tag) {
                self.ready.push_front(entry.message);
            }
        }
    }

    fn settle(&mut self, tag: u64) -> Result<StoredMessage> {
        let channel_open = self
            .in_flight
            .get(&tag)
            .map(|entry| self.open_channels.contains(&entry.channel));
        match channel_open {
            Some(true) => self
                .in_flight
                .remove(&tag)
                .map(|entry| entry.message)
                .ok_or_else(|| QueueError::ack(format!("Unknown delivery tag {}", tag))),
            Some(false) => Err(QueueError::ack(format!(
                "Channel closed before delivery tag {} was settled",
                tag
            ))),
            None => Err(QueueError::ack(format!("Unknown delivery tag {}", tag))),
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// A single durable queue held in memory. Clones share the same queue.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Behaves like a queue declared without `x-dead-letter-exchange`:
    /// a reject without requeue discards the message.
    pub fn without_dead_letter(self) -> Self {
        self.shared.lock().no_dead_letter = true;
        self
    }

    pub fn client(&self, queue_name: &str) -> MemoryQueueClient {
        MemoryQueueClient {
            shared: Arc::clone(&self.shared),
            queue_name: queue_name.to_string(),
            channel: None,
        }
    }

    /// Enqueues a raw body, bypassing any client.
    pub fn push_raw(&self, body: impl Into<Vec<u8>>) {
        {
            let mut state = self.shared.lock();
            state.ready.push_back(StoredMessage::new(body.into(), 0));
            state.published += 1;
        }
        self.shared.wake();
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().fail_connects = count;
    }

    /// The next `count` publishes fail and take their channel down with them.
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.lock().fail_publishes = count;
    }

    /// Drops every open channel, as a broker restart would.
    pub fn disconnect_all(&self) {
        {
            let mut state = self.shared.lock();
            let channels: Vec<u64> = state.open_channels.iter().copied().collect();
            for channel in channels {
                state.close_channel(channel);
            }
        }
        self.shared.wake();
    }

    pub fn ready_count(&self) -> usize {
        self.shared.lock().ready.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn published_count(&self) -> usize {
        self.shared.lock().published
    }

    pub fn acked_count(&self) -> usize {
        self.shared.lock().acked
    }

    pub fn connect_count(&self) -> usize {
        self.shared.lock().connects
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.shared.lock().dead_letters.clone()
    }

    /// Messages rejected without requeue while no dead-letter route exists.
    pub fn discarded_count(&self) -> usize {
        self.shared.lock().discarded
    }

    /// Retry counters of the waiting messages, head first.
    pub fn ready_retry_attempts(&self) -> Vec<u32> {
        self.shared
            .lock()
            .ready
            .iter()
            .map(|message| message.retry_attempts)
            .collect()
    }

    /// Bodies waiting in the queue, head first.
    pub fn ready_bodies(&self) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .ready
            .iter()
            .map(|message| message.body.clone())
            .collect()
    }
}

pub struct MemoryQueueClient {
    shared: Arc<Shared>,
    queue_name: String,
    channel: Option<u64>,
}

impl MemoryQueueClient {
    fn open_channel(&self) -> Result<u64> {
        self.channel
            .filter(|channel| self.shared.lock().open_channels.contains(channel))
            .ok_or_else(|| QueueError::channel("Channel is not open"))
    }
}

#[async_trait]
impl QueueClient for MemoryQueueClient {
    async fn ensure_ready(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(channel) = self.channel {
            if state.open_channels.contains(&channel) {
                return Ok(());
            }
        }

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(QueueError::connection("Connection refused"));
        }

        state.next_channel += 1;
        let channel = state.next_channel;
        state.open_channels.insert(channel);
        state.connects += 1;
        self.channel = Some(channel);
        debug!(queue = %self.queue_name, channel, "Opened in-memory channel");
        Ok(())
    }

    async fn publish(&mut self, body: &[u8]) -> Result<()> {
        self.ensure_ready().await?;
        let channel = self.open_channel()?;
        {
            let mut state = self.shared.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                state.close_channel(channel);
                self.channel = None;
                return Err(QueueError::publish("Channel closed during publish"));
            }
            state.ready.push_back(StoredMessage::new(body.to_vec(), 0));
            state.published += 1;
        }
        self.shared.wake();
        Ok(())
    }

    async fn subscribe(&mut self, _consumer_tag: &str) -> Result<Subscription> {
        self.ensure_ready().await?;
        let channel = self.open_channel()?;
        let shared = Arc::clone(&self.shared);

        let stream = futures::stream::unfold(Some(shared), move |shared| async move {
            let shared = shared?;
            loop {
                let waiter = Arc::clone(&shared);
                let notified = waiter.notify.notified();

                let next = {
                    let mut state = shared.lock();
                    if !state.open_channels.contains(&channel) {
                        None
                    } else if let Some(mut message) = state.ready.pop_front() {
                        message.deliveries += 1;
                        state.next_tag += 1;
                        let tag = state.next_tag;
                        let redelivered = message.deliveries > 1;
                        let retry_attempts = message.retry_attempts;
                        let body = message.body.clone();
                        state.in_flight.insert(tag, InFlight { message, channel });
                        Some(Some((tag, body, redelivered, retry_attempts)))
                    } else {
                        Some(None)
                    }
                };

                match next {
                    None => {
                        let closed = QueueError::channel("Channel closed");
                        return Some((Err(closed), None));
                    }
                    Some(Some((tag, body, redelivered, retry_attempts))) => {
                        let acker = MemoryAcker {
                            shared: Arc::clone(&shared),
                            tag,
                        };
                        let message =
                            IncomingMessage::new(body, redelivered, retry_attempts, Box::new(acker));
                        return Some((Ok(message), Some(shared)));
                    }
                    Some(None) => notified.await,
                }
            }
        });

        Ok(stream.boxed())
    }

    fn reset(&mut self) {
        self.channel = None;
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            self.shared.lock().close_channel(channel);
            self.shared.wake();
        }
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.shared.lock();
        state.settle(self.tag)?;
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.reject(requeue).await
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let message = state.settle(self.tag)?;
            if requeue {
                state.ready.push_front(message);
            } else if state.no_dead_letter {
                state.discarded += 1;
            } else {
                state.dead_letters.push(message.body);
            }
        }
        self.shared.wake();
        Ok(())
    }

    async fn republish(&self, body: &[u8], retry_attempts: u32) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.settle(self.tag)?;
            state
                .ready
                .push_back(StoredMessage::new(body.to_vec(), retry_attempts));
            state.published += 1;
            state.acked += 1;
        }
        self.shared.wake();
        Ok(())
    }
}
