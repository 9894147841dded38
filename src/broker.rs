// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capabilities
//!
//! This module defines the broker operations the consumer relies on: dialing,
//! opening channels, declaring and binding queues, consuming, acknowledging,
//! rejecting, cancelling and closing, plus one-shot close notifications for
//! connections and channels.
//!
//! The lapin-backed implementation lives in [`crate::channel`]. Keeping the
//! operations behind traits lets the supervisor run against any transport.

use crate::{errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{BasicAckOptions, BasicRejectOptions},
    BasicProperties,
};
use std::sync::Arc;
use tokio::sync::oneshot;

/// One-shot signal fired when a connection or a channel goes away.
///
/// `Ok(Some(err))` means the resource failed, `Ok(None)` means it was closed
/// gracefully and `Err(_)` means the sender vanished without a value. All
/// three are handled as "the resource is gone".
pub type CloseNotify = oneshot::Receiver<Option<AmqpError>>;

/// Live sequence of deliveries, ending when the channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A message received from the broker.
///
/// `delivery_tag` is only meaningful on the channel that produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    /// Creates a first delivery of `data` with default properties.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag identifying the delivery on its channel
    /// * `data` - Message payload
    ///
    /// # Returns
    /// A `Delivery` that is not flagged as redelivered
    pub fn new(delivery_tag: u64, data: Vec<u8>) -> Delivery {
        Delivery {
            delivery_tag,
            data,
            ..Default::default()
        }
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Dials the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection to the broker at `uri`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live transport connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Subscribes to the close notification. Can only be taken once, later
    /// calls return an already-closed receiver.
    fn close_notify(&self) -> CloseNotify;

    fn is_open(&self) -> bool;

    /// Closes the connection. Closing an already closed connection is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel used for queue operations and consumption.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Starts consuming `queue` in manual acknowledgment mode.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, options: BasicRejectOptions)
        -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Subscribes to the close notification. Can only be taken once, later
    /// calls return an already-closed receiver.
    fn close_notify(&self) -> CloseNotify;

    fn is_open(&self) -> bool;

    /// Closes the channel. Closing an already closed channel is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Holds the sending half of a close notification until it fires.
///
/// Shared between the handle and the transport callbacks; whichever side
/// fires first wins, later fires are ignored.
#[derive(Debug, Clone)]
pub(crate) struct CloseSignal {
    sender: Arc<std::sync::Mutex<Option<oneshot::Sender<Option<AmqpError>>>>>,
    receiver: Arc<std::sync::Mutex<Option<CloseNotify>>>,
}

impl CloseSignal {
    pub(crate) fn new() -> CloseSignal {
        let (tx, rx) = oneshot::channel();
        CloseSignal {
            sender: Arc::new(std::sync::Mutex::new(Some(tx))),
            receiver: Arc::new(std::sync::Mutex::new(Some(rx))),
        }
    }

    pub(crate) fn fire(&self, reason: Option<AmqpError>) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(tx) = sender {
            let _ = tx.send(reason);
        }
    }

    pub(crate) fn subscribe(&self) -> CloseNotify {
        let receiver = match self.receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        receiver.unwrap_or_else(|| {
            let (_, rx) = oneshot::channel();
            rx
        })
    }
}
