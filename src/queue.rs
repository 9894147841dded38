// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the queue declaration parameters and the queue to
//! exchange binding used by the topology setup. Both are derived from a
//! [`ConsumerConfig`] and re-applied on every (re)connection.

use crate::config::ConsumerConfig;

/// Definition of a RabbitMQ queue with its declaration flags.
///
/// Queues are declared non-durable, non-exclusive and without extra arguments
/// unless told otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new `QueueDefinition` instance with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            passive: false,
            no_wait: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether the queue is deleted once its last consumer goes away.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    /// Whether the queue is restricted to the declaring connection.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl From<&ConsumerConfig> for QueueDefinition {
    fn from(cfg: &ConsumerConfig) -> Self {
        let mut def = QueueDefinition::new(&cfg.queue);
        if cfg.durable {
            def = def.durable();
        }
        if cfg.auto_delete {
            def = def.delete();
        }
        def
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to bind
    ///
    /// # Returns
    /// A new `QueueBinding` instance
    pub fn new(queue: &'qeb str) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }
}

impl<'qeb> From<&'qeb ConsumerConfig> for QueueBinding<'qeb> {
    fn from(cfg: &'qeb ConsumerConfig) -> Self {
        QueueBinding::new(&cfg.queue)
            .exchange(&cfg.exchange)
            .routing_key(&cfg.routing_key)
    }
}
