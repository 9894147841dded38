// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod dispatcher;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod queue;
pub mod supervisor;
pub mod topology;

pub use broker::{BrokerChannel, BrokerConnection, CloseNotify, Connector, Delivery, DeliveryStream};
pub use config::{ConfigError, ConsumerConfig, FromEnv};
pub use consumer::RabbitMQConsumer;
pub use errors::AmqpError;
pub use handler::{handler_fn, AckDecision, ConsumerHandler, ConsumerMessage, HandlerError};
pub use supervisor::SupervisorState;
