//! In-memory broker implementing the consumer's broker capabilities.
//!
//! It keeps a single queue, tracks unacknowledged deliveries per channel and
//! records every settlement so tests can assert on acknowledgment semantics.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{BasicAckOptions, BasicRejectOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use rabbitmq_consumer::{
    queue::QueueDefinition, AmqpError, BrokerChannel, BrokerConnection, CloseNotify, Connector,
    Delivery, DeliveryStream,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub deliveries: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Discard,
}

struct ActiveConsumer {
    channel_id: u64,
    tx: Option<mpsc::UnboundedSender<Result<Delivery, AmqpError>>>,
    next_tag: u64,
    unacked: HashMap<u64, Message>,
}

#[derive(Default)]
struct BrokerState {
    /// Quorum queues count deliveries in `x-delivery-count`, classic queues
    /// only set `redelivered`.
    quorum: bool,
    queue: VecDeque<Message>,
    active: Option<ActiveConsumer>,
    refuse_connections: usize,
    connect_attempts: usize,
    consume_calls: usize,
    declared: Vec<QueueDefinition>,
    bindings: Vec<(String, String, String)>,
    acked: Vec<Vec<u8>>,
    dead_lettered: Vec<Vec<u8>>,
    settlements: Vec<(u64, u64, Settlement)>,
    violations: Vec<String>,
    connections: Vec<Arc<FakeConnection>>,
}

impl BrokerState {
    fn deliver_pending(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(tx) = active.tx.as_ref() else {
            return;
        };

        while let Some(message) = self.queue.pop_front() {
            active.next_tag += 1;
            let tag = active.next_tag;

            let mut delivery = Delivery::new(tag, message.payload.clone());
            delivery.redelivered = message.deliveries > 0;
            if self.quorum && message.deliveries > 0 {
                let mut headers = BTreeMap::new();
                headers.insert(
                    ShortString::from("x-delivery-count"),
                    AMQPValue::LongLongInt(message.deliveries),
                );
                delivery.properties =
                    BasicProperties::default().with_headers(FieldTable::from(headers));
            }

            active.unacked.insert(tag, message);
            let _ = tx.send(Ok(delivery));
        }
    }

    /// Puts back every unacked delivery of `channel_id`, as a broker does when
    /// a channel goes away.
    fn release_channel(&mut self, channel_id: u64) {
        let owned = matches!(&self.active, Some(active) if active.channel_id == channel_id);
        if !owned {
            return;
        }

        if let Some(active) = self.active.take() {
            let mut unacked: Vec<_> = active.unacked.into_iter().collect();
            unacked.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in unacked.into_iter().rev() {
                message.deliveries += 1;
                self.queue.push_front(message);
            }
        }
    }
}

/// Handle shared by the test and every connection it hands out.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<AtomicU64>,
}

impl FakeBroker {
    /// A broker serving a classic queue.
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    /// A broker serving a quorum queue.
    pub fn quorum() -> FakeBroker {
        let broker = FakeBroker::default();
        broker.with(|state| state.quorum = true);
        broker
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn with<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn publish(&self, payload: &[u8]) {
        self.with(|state| {
            state.queue.push_back(Message {
                payload: payload.to_vec(),
                deliveries: 0,
            });
            state.deliver_pending();
        });
    }

    pub fn refuse_next_connections(&self, count: usize) {
        self.with(|state| state.refuse_connections = count);
    }

    fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.with(|state| state.connections.last().cloned())
    }

    fn last_channel(&self) -> Option<Arc<FakeChannel>> {
        self.last_connection()
            .and_then(|connection| connection.channels.lock().unwrap().last().cloned())
    }

    /// Drops the most recent connection as if the broker had crashed.
    pub fn kill_connection(&self) {
        if let Some(connection) = self.last_connection() {
            connection.shutdown(Some(AmqpError::ConnectionClosed(
                "CONNECTION_FORCED - broker forced connection closure".to_owned(),
            )));
        }
    }

    /// Closes the most recent connection from the broker side with reply
    /// code 200, which notifies without an error.
    pub fn close_gracefully(&self) {
        if let Some(connection) = self.last_connection() {
            connection.shutdown(None);
        }
    }

    /// Closes the most recent channel with a channel exception, leaving its
    /// connection open.
    pub fn kill_channel(&self) {
        if let Some(channel) = self.last_channel() {
            channel.shutdown(Some(AmqpError::ChannelClosed(
                "PRECONDITION_FAILED - channel exception".to_owned(),
            )));
        }
    }

    /// Drops the notification sender of the most recent connection without
    /// sending anything. The connection itself stays up.
    pub fn abandon_connection_notify(&self) {
        if let Some(connection) = self.last_connection() {
            connection.notify.abandon();
        }
    }

    /// Cancels the active consumer from the broker side, as when its queue is
    /// deleted. The channel and the connection stay open.
    pub fn cancel_consumer(&self) {
        self.with(|state| {
            if let Some(active) = state.active.as_mut() {
                active.tx = None;
            }
        });
    }

    pub fn open_connections(&self) -> usize {
        self.with(|state| {
            state
                .connections
                .iter()
                .filter(|connection| connection.open.load(Ordering::SeqCst))
                .count()
        })
    }

    pub fn connect_attempts(&self) -> usize {
        self.with(|state| state.connect_attempts)
    }

    pub fn consume_calls(&self) -> usize {
        self.with(|state| state.consume_calls)
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.with(|state| state.acked.clone())
    }

    pub fn acked_count(&self, payload: &[u8]) -> usize {
        self.with(|state| state.acked.iter().filter(|p| p.as_slice() == payload).count())
    }

    pub fn dead_lettered(&self) -> Vec<Vec<u8>> {
        self.with(|state| state.dead_lettered.clone())
    }

    pub fn settlements(&self) -> Vec<(u64, u64, Settlement)> {
        self.with(|state| state.settlements.clone())
    }

    pub fn violations(&self) -> Vec<String> {
        self.with(|state| state.violations.clone())
    }

    pub fn declared(&self) -> Vec<QueueDefinition> {
        self.with(|state| state.declared.clone())
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.with(|state| state.bindings.clone())
    }

    pub fn queue_len(&self) -> usize {
        self.with(|state| state.queue.len())
    }

    pub fn unacked_len(&self) -> usize {
        self.with(|state| {
            state
                .active
                .as_ref()
                .map(|active| active.unacked.len())
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl Connector for FakeBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let refused = self.with(|state| {
            state.connect_attempts += 1;
            if state.refuse_connections > 0 {
                state.refuse_connections -= 1;
                true
            } else {
                false
            }
        });

        if refused {
            return Err(AmqpError::ConnectionError(format!("{uri}: connection refused")));
        }

        let connection = Arc::new(FakeConnection {
            broker: self.clone(),
            open: AtomicBool::new(true),
            notify: Notifier::new(),
            channels: Mutex::new(vec![]),
        });
        self.with(|state| state.connections.push(connection.clone()));

        Ok(connection)
    }
}

struct Notifier {
    tx: Mutex<Option<oneshot::Sender<Option<AmqpError>>>>,
    rx: Mutex<Option<CloseNotify>>,
}

impl Notifier {
    fn new() -> Notifier {
        let (tx, rx) = oneshot::channel();
        Notifier {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    fn fire(&self, reason: Option<AmqpError>) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(reason);
        }
    }

    fn abandon(&self) {
        drop(self.tx.lock().unwrap().take());
    }

    fn subscribe(&self) -> CloseNotify {
        self.rx.lock().unwrap().take().unwrap_or_else(|| {
            let (_, rx) = oneshot::channel();
            rx
        })
    }
}

pub struct FakeConnection {
    broker: FakeBroker,
    open: AtomicBool,
    notify: Notifier,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    fn shutdown(&self, reason: Option<AmqpError>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let channels = self.channels.lock().unwrap().clone();
        for channel in channels {
            channel.shutdown(
                reason
                    .as_ref()
                    .map(|err| AmqpError::ChannelClosed(err.to_string())),
            );
        }
        self.notify.fire(reason);
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        let channel = Arc::new(FakeChannel {
            id: self.broker.next_id(),
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            notify: Notifier::new(),
        });
        self.channels.lock().unwrap().push(channel.clone());

        Ok(channel)
    }

    fn close_notify(&self) -> CloseNotify {
        self.notify.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown(None);
        Ok(())
    }
}

pub struct FakeChannel {
    id: u64,
    broker: FakeBroker,
    open: AtomicBool,
    notify: Notifier,
}

impl FakeChannel {
    fn shutdown(&self, reason: Option<AmqpError>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        self.broker.with(|state| state.release_channel(self.id));
        self.notify.fire(reason);
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed(format!("channel {} closed", self.id)))
        }
    }

    fn settle(&self, tag: u64, settlement: Settlement) -> Result<Message, String> {
        self.broker.with(|state| {
            let owned = state
                .active
                .as_mut()
                .filter(|active| active.channel_id == self.id)
                .and_then(|active| active.unacked.remove(&tag));

            match owned {
                Some(message) => {
                    state.settlements.push((self.id, tag, settlement));
                    Ok(message)
                }
                None => {
                    let violation = format!(
                        "PRECONDITION_FAILED - unknown delivery tag {tag} on channel {}",
                        self.id
                    );
                    state.violations.push(violation.clone());
                    Err(violation)
                }
            }
        })
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|state| state.declared.push(def.clone()));
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|state| {
            state
                .bindings
                .push((queue.to_owned(), exchange.to_owned(), routing_key.to_owned()))
        });
        Ok(())
    }

    async fn consume(&self, _queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.with(|state| {
            state.consume_calls += 1;
            if let Some(active) = &state.active {
                state.violations.push(format!(
                    "consumer {consumer_tag} started while channel {} still consumes",
                    active.channel_id
                ));
            }
            state.active = Some(ActiveConsumer {
                channel_id: self.id,
                tx: Some(tx),
                next_tag: 0,
                unacked: HashMap::new(),
            });
            state.deliver_pending();
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.ensure_open()?;
        if options.multiple {
            self.broker
                .with(|state| state.violations.push(format!("cumulative ack of {delivery_tag}")));
        }

        let message = self
            .settle(delivery_tag, Settlement::Ack)
            .map_err(|_| AmqpError::AckMessageError(delivery_tag))?;
        self.broker.with(|state| state.acked.push(message.payload));

        Ok(())
    }

    async fn reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let settlement = if options.requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        let mut message = self
            .settle(delivery_tag, settlement)
            .map_err(|_| AmqpError::RejectMessageError(delivery_tag))?;

        self.broker.with(|state| {
            if options.requeue {
                message.deliveries += 1;
                state.queue.push_back(message);
                state.deliver_pending();
            } else {
                state.dead_lettered.push(message.payload);
            }
        });

        Ok(())
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|state| {
            if let Some(active) = state.active.as_mut() {
                if active.channel_id == self.id {
                    active.tx = None;
                }
            }
        });
        Ok(())
    }

    fn close_notify(&self) -> CloseNotify {
        self.notify.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown(None);
        Ok(())
    }
}

/// Polls `condition` until it holds, failing the test after `within`.
pub async fn eventually<F>(within: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {within:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs `fut` with a deadline, failing the test if it does not complete.
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| panic!("did not complete within {limit:?}"))
}
