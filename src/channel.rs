// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Gate
//!
//! This module handles the creation and management of AMQP connections and channels
//! on top of lapin. It implements the broker capabilities of [`crate::broker`]:
//! connections and channels report their failures through close notifications,
//! and closing them is idempotent.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, CloseNotify, CloseSignal, Connector, Delivery,
        DeliveryStream,
    },
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        BasicRejectOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent to the broker on a local close
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    /// Creates a connector announcing itself to the broker as `connection_name`.
    ///
    /// # Parameters
    /// * `connection_name` - Name shown for every connection in the broker
    ///   management UI
    ///
    /// # Returns
    /// A `LapinConnector` ready to dial any AMQP URI
    pub fn new(connection_name: &str) -> LapinConnector {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection::new(conn)))
    }
}

/// A lapin connection wired to a close notification.
pub struct LapinConnection {
    conn: Connection,
    closed: CloseSignal,
}

impl LapinConnection {
    fn new(conn: Connection) -> LapinConnection {
        let closed = CloseSignal::new();

        let signal = closed.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            signal.fire(Some(AmqpError::ConnectionClosed(err.to_string())));
        });

        LapinConnection { conn, closed }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn close_notify(&self) -> CloseNotify {
        self.closed.subscribe()
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            self.closed.fire(None);
            return Ok(());
        }

        let result = self.conn.close(REPLY_SUCCESS, "OK").await;
        self.closed.fire(None);

        match result {
            Err(err) if self.is_open() => {
                error!(error = err.to_string(), "failure to close connection");
                Err(AmqpError::CloseError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// A lapin channel wired to a close notification.
pub struct LapinChannel {
    channel: Channel,
    closed: CloseSignal,
}

impl LapinChannel {
    fn new(channel: Channel) -> LapinChannel {
        let closed = CloseSignal::new();

        let signal = closed.clone();
        channel.on_error(move |err| {
            error!(error = err.to_string(), "amqp channel failure");
            signal.fire(Some(AmqpError::ChannelClosed(err.to_string())));
        });

        LapinChannel { channel, closed }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = %def.name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling reject msg");
                AmqpError::RejectMessageError(delivery_tag)
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    fn close_notify(&self) -> CloseNotify {
        self.closed.subscribe()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            self.closed.fire(None);
            return Ok(());
        }

        let result = self.channel.close(REPLY_SUCCESS, "OK").await;
        self.closed.fire(None);

        match result {
            Err(err) if self.is_open() => {
                error!(error = err.to_string(), "failure to close channel");
                Err(AmqpError::CloseError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}
