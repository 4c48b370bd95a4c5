//! An in-memory topic broker implementing the transport traits, for tests.
//!
//! It keeps the parts of AMQP the worker relies on: topic routing, per-queue ready
//! and unacknowledged messages, requeue with the `redelivered` flag, and returning
//! unacknowledged messages to the queue when their channel closes.

use crate::error::WorkerError;
use crate::transport::{
    Acknowledge, BrokerChannel, BrokerConnection, DeliveryInfo, DeliveryStream, InFlightMessage,
    LifecycleListener, LifecycleSignal, Transport,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use url::Url;

/// Channel id used by `MemoryBroker::subscribe`.
const DIRECT_CHANNEL: u64 = 0;

#[derive(Clone)]
struct Stored {
    payload: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    sender: mpsc::UnboundedSender<InFlightMessage>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, (u64, Stored)>,
    consumer: Option<Consumer>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: u64,
    next_channel: u64,
    open_channels: HashSet<u64>,
    closed_channels: usize,
    refuse_connections: bool,
    connection_open: bool,
    last_url: Option<String>,
    prefetch: Option<u16>,
    connection_listeners: Vec<LifecycleListener>,
    channel_listeners: Vec<LifecycleListener>,
}

/// Shared handle to the in-memory broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every following `connect` fail.
    pub fn refuse_connections(&self) {
        self.lock().refuse_connections = true;
    }

    /// Publishes to an exchange. Returns how many queues the message was routed to.
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> usize {
        let mut state = self.lock();
        let targets: HashSet<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(Stored {
                    payload: payload.to_vec(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
            self.pump(&mut state, queue);
        }
        targets.len()
    }

    /// Ready plus unacknowledged messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumer.is_some())
            .unwrap_or(false)
    }

    /// `(queue, exchange, routing key)` for every binding, in declaration order.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock()
            .bindings
            .iter()
            .map(|b| (b.queue.clone(), b.exchange.clone(), b.pattern.clone()))
            .collect()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    /// URL of the most recent connection attempt.
    pub fn last_url(&self) -> Option<String> {
        self.lock().last_url.clone()
    }

    pub fn is_connection_open(&self) -> bool {
        self.lock().connection_open
    }

    pub fn closed_channels(&self) -> usize {
        self.lock().closed_channels
    }

    /// Raises a lifecycle signal on the open connection.
    pub fn emit_connection_signal(&self, signal: LifecycleSignal) {
        let listeners = self.lock().connection_listeners.clone();
        for listener in listeners {
            listener(signal.clone());
        }
    }

    /// Raises a lifecycle signal on every open channel.
    pub fn emit_channel_signal(&self, signal: LifecycleSignal) {
        let listeners = self.lock().channel_listeners.clone();
        for listener in listeners {
            listener(signal.clone());
        }
    }

    /// Declares `exchange` and `queue`, binds them on `routing_key` and consumes the
    /// queue without going through a connection.
    pub fn subscribe(&self, exchange: &str, queue: &str, routing_key: &str) -> DeliveryStream {
        let mut state = self.lock();
        state.exchanges.insert(exchange.to_string());
        state.queues.entry(queue.to_string()).or_default();
        state.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: routing_key.to_string(),
        });
        self.attach_consumer(&mut state, queue, DIRECT_CHANNEL)
    }

    fn attach_consumer(&self, state: &mut BrokerState, queue: &str, channel: u64) -> DeliveryStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumer = Some(Consumer { channel, sender });
        }
        self.pump(state, queue);

        stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (Ok(message), receiver))
        })
        .boxed()
    }

    /// Hands ready messages to the queue's consumer, if it has one, until the
    /// prefetch window is full.
    fn pump(&self, state: &mut BrokerState, queue: &str) {
        let window = state.prefetch.map(usize::from);
        loop {
            let tag = state.next_tag + 1;
            let Some(q) = state.queues.get_mut(queue) else { return };
            let Some(consumer) = &q.consumer else { return };
            if window.is_some_and(|limit| q.unacked.len() >= limit) {
                return;
            }
            let Some(stored) = q.ready.pop_front() else { return };

            let info = DeliveryInfo {
                delivery_tag: tag,
                redelivered: stored.redelivered,
                exchange: stored.exchange.clone(),
                routing_key: stored.routing_key.clone(),
            };
            let acker = MemoryAcker {
                broker: self.clone(),
                queue: queue.to_string(),
                tag,
            };
            let channel = consumer.channel;
            let message = InFlightMessage::new(stored.payload.clone(), info, Box::new(acker));

            if consumer.sender.send(message).is_err() {
                q.ready.push_front(stored);
                q.consumer = None;
                return;
            }
            q.unacked.insert(tag, (channel, stored));
            state.next_tag = tag;
        }
    }

    fn settle(&self, queue: &str, tag: u64, requeue: bool) -> Result<(), WorkerError> {
        let mut state = self.lock();
        let entry = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag))
            .ok_or_else(|| WorkerError::State(format!("unknown delivery tag {} on {}", tag, queue)))?;

        if requeue {
            let (_, mut stored) = entry;
            stored.redelivered = true;
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(stored);
            }
        }
        self.pump(&mut state, queue);
        Ok(())
    }

    fn close_channel(&self, channel: u64) {
        let mut state = self.lock();
        if !state.open_channels.remove(&channel) {
            return;
        }
        state.closed_channels += 1;

        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for name in queues {
            let Some(q) = state.queues.get_mut(&name) else { continue };
            if q.consumer.as_ref().map(|c| c.channel) == Some(channel) {
                q.consumer = None;
            }
            let returned: Vec<u64> = q
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in returned {
                if let Some((_, mut stored)) = q.unacked.remove(&tag) {
                    stored.redelivered = true;
                    q.ready.push_back(stored);
                }
            }
        }
        if state.open_channels.is_empty() {
            state.channel_listeners.clear();
        }
    }
}

/// Topic matching: `*` is exactly one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((part, key_rest))) if word == part => matches(rest, key_rest),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), WorkerError> {
        self.broker.settle(&self.queue, self.tag, false)
    }

    async fn nack(&self) -> Result<(), WorkerError> {
        self.broker.settle(&self.queue, self.tag, true)
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let mut state = self.lock();
        state.last_url = Some(url.to_string());
        if state.refuse_connections {
            let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
            return Err(WorkerError::Lapin(lapin::Error::IOError(Arc::new(refused))));
        }
        state.connection_open = true;
        Ok(Arc::new(MemoryConnection { broker: self.clone() }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        let mut state = self.broker.lock();
        if !state.connection_open {
            return Err(WorkerError::State("connection is closed".to_string()));
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.open_channels.insert(id);
        Ok(Arc::new(MemoryChannel { broker: self.broker.clone(), id }))
    }

    fn on_signal(&self, listener: LifecycleListener) {
        self.broker.lock().connection_listeners.push(listener);
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let channels: Vec<u64> = self.broker.lock().open_channels.iter().copied().collect();
        for channel in channels {
            self.broker.close_channel(channel);
        }
        let mut state = self.broker.lock();
        state.connection_open = false;
        state.connection_listeners.clear();
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), WorkerError> {
        if state.open_channels.contains(&self.id) {
            Ok(())
        } else {
            Err(WorkerError::State(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn prefetch(&self, count: u16) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        state.prefetch = Some(count);
        Ok(())
    }

    async fn assert_exchange(&self, exchange: &str) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn assert_queue(&self, queue: &str) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        if !state.exchanges.contains(exchange) || !state.queues.contains_key(queue) {
            return Err(WorkerError::State(format!(
                "cannot bind {} to undeclared {}",
                queue, exchange
            )));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, WorkerError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        if !state.queues.contains_key(queue) {
            return Err(WorkerError::State(format!("no queue named {}", queue)));
        }
        Ok(self.broker.attach_consumer(&mut state, queue, self.id))
    }

    fn on_signal(&self, listener: LifecycleListener) {
        self.broker.lock().channel_listeners.push(listener);
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("email.send", "email.send"));
        assert!(!topic_matches("email.send", "email.bounce"));
        assert!(topic_matches("email.*", "email.send"));
        assert!(!topic_matches("email.*", "email.send.now"));
        assert!(topic_matches("email.#", "email"));
        assert!(topic_matches("email.#", "email.send.now"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.send", "sms.send"));
    }

    #[tokio::test]
    async fn test_nack_requeues_with_redelivered_flag() {
        let broker = MemoryBroker::new();
        let mut deliveries = broker.subscribe("ex", "q", "k");
        assert_eq!(broker.publish("ex", "k", b"{}"), 1);

        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.info().redelivered);
        first.nack().await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.info().redelivered);
        assert_eq!(broker.queue_depth("q"), 1);
        second.ack().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_unrouted_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let _deliveries = broker.subscribe("ex", "q", "k");
        assert_eq!(broker.publish("ex", "other", b"{}"), 0);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_deliveries_until_ack() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(&Url::parse("amqp://localhost").unwrap()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.prefetch(1).await.unwrap();
        channel.assert_exchange("ex").await.unwrap();
        channel.assert_queue("q").await.unwrap();
        channel.bind_queue("q", "ex", "k").await.unwrap();
        let mut deliveries = channel.consume("q", "q_consumer").await.unwrap();

        broker.publish("ex", "k", br#"{"n":1}"#);
        broker.publish("ex", "k", br#"{"n":2}"#);
        let first = deliveries.next().await.unwrap().unwrap();

        let held = tokio::time::timeout(Duration::from_millis(30), deliveries.next()).await;
        assert!(held.is_err());

        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.payload(), br#"{"n":2}"#);
        second.ack().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_closing_channel_returns_unacked_messages() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(&Url::parse("amqp://localhost").unwrap()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.assert_exchange("ex").await.unwrap();
        channel.assert_queue("q").await.unwrap();
        channel.bind_queue("q", "ex", "k").await.unwrap();
        let mut deliveries = channel.consume("q", "q_consumer").await.unwrap();

        broker.publish("ex", "k", b"{}");
        let message = deliveries.next().await.unwrap().unwrap();

        channel.close().await.unwrap();
        assert!(message.ack().await.is_err());
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.closed_channels(), 1);
    }
}
