// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Consumer
//!
//! This module provides the error types for broker operations performed by the
//! consumer. The `AmqpError` enum covers connecting, opening channels, declaring
//! and binding queues, consuming, acknowledging and closing. Configuration
//! errors live in [`crate::config::ConfigError`].

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connect and setup variants are surfaced to the caller of
/// [`crate::consumer::RabbitMQConsumer::consume`]. Everything else is logged
/// by the component that hit it and never escalated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(u64),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// The connection was closed, by the broker or by the transport
    #[error("connection closed `{0}`")]
    ConnectionClosed(String),

    /// The channel was closed, by the broker or by the transport
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Error receiving a message from the delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// `consume` was called on a consumer that is already running
    #[error("consumer already started")]
    AlreadyConsuming,

    /// `consume` was called after `stop`
    #[error("consumer stopped")]
    ConsumerStopped,
}
