// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Supervisor
//!
//! This module owns the current connection generation (connection, channel,
//! close notifications and delivery pump) and replaces it whenever the broker
//! takes it away:
//!
//! ```text
//! RUNNING --close notification / stream end--> TEARING_DOWN --> RECONNECTING --> RUNNING
//!    |                                                               |
//!    +------------------------ quit signal ---------------------------+--> STOPPED
//! ```
//!
//! The previous generation is always fully retired (consumer cancelled, channel
//! and connection closed, notifications detached) before a new one is
//! established, so two delivery streams never coexist. Reconnection is retried
//! forever with a fixed backoff; only the quit signal ends the supervisor.

use crate::{
    broker::{BrokerChannel, BrokerConnection, CloseNotify, Connector},
    config::ConsumerConfig,
    dispatcher::DeliveryPump,
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
};
use std::{fmt, sync::Arc};
use tokio::{
    sync::{oneshot::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a consumer, as driven by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// `consume()` was not called yet.
    Idle,
    Running,
    TearingDown,
    Reconnecting,
    /// Terminal, reached only through the quit signal.
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "IDLE",
            SupervisorState::Running => "RUNNING",
            SupervisorState::TearingDown => "TEARING_DOWN",
            SupervisorState::Reconnecting => "RECONNECTING",
            SupervisorState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Resolves once the quit signal is raised, or once its sender is gone.
pub(crate) async fn quit_raised(quit: &mut watch::Receiver<bool>) {
    let _ = quit.wait_for(|raised| *raised).await;
}

/// Everything tied to one live connection.
pub(crate) struct Generation {
    pub(crate) id: Uuid,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    connection_closed: CloseNotify,
    channel_closed: CloseNotify,
    pump: JoinHandle<()>,
}

/// Why a running generation is being torn down.
#[derive(Debug)]
enum Retirement {
    Quit,
    ConnectionClosed(Result<Option<AmqpError>, RecvError>),
    ChannelClosed(Result<Option<AmqpError>, RecvError>),
    StreamEnded,
}

impl fmt::Display for Retirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn reason(closed: &Result<Option<AmqpError>, RecvError>) -> String {
            match closed {
                Ok(Some(err)) => err.to_string(),
                Ok(None) => "closed gracefully".to_owned(),
                Err(_) => "closed without notification".to_owned(),
            }
        }

        match self {
            Retirement::Quit => f.write_str("quit signal raised"),
            Retirement::ConnectionClosed(closed) => write!(f, "connection: {}", reason(closed)),
            Retirement::ChannelClosed(closed) => write!(f, "channel: {}", reason(closed)),
            Retirement::StreamEnded => f.write_str("delivery stream ended"),
        }
    }
}

/// Single writer of the current generation.
pub(crate) struct Supervisor {
    config: Arc<ConsumerConfig>,
    connector: Arc<dyn Connector>,
    pump: DeliveryPump,
    quit: watch::Receiver<bool>,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl Supervisor {
    pub(crate) fn new(
        config: Arc<ConsumerConfig>,
        connector: Arc<dyn Connector>,
        pump: DeliveryPump,
        quit: watch::Receiver<bool>,
        state: Arc<watch::Sender<SupervisorState>>,
    ) -> Supervisor {
        Supervisor {
            config,
            connector,
            pump,
            quit,
            state,
        }
    }

    /// Opens a connection and a channel, installs the topology and starts the
    /// delivery pump.
    ///
    /// Whatever was opened is closed again before an error is returned.
    pub(crate) async fn establish(&self) -> Result<Generation, AmqpError> {
        let id = Uuid::new_v4();
        debug!(generation = %id, "establishing a new generation");

        let connection = self.connector.connect(&self.config.uri).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                close_connection(&connection).await;
                return Err(err);
            }
        };

        let connection_closed = connection.close_notify();
        let channel_closed = channel.close_notify();

        let deliveries = match self.setup(&channel).await {
            Ok(_) => channel
                .consume(&self.config.queue, &self.config.consumer_tag)
                .await,
            Err(err) => Err(err),
        };

        let deliveries = match deliveries {
            Ok(deliveries) => deliveries,
            Err(err) => {
                close_channel(&channel).await;
                close_connection(&connection).await;
                return Err(err);
            }
        };

        let pump = self
            .pump
            .spawn(id, channel.clone(), deliveries, self.quit.clone());

        info!(
            generation = %id,
            queue = %self.config.queue,
            consumer_tag = %self.config.consumer_tag,
            "consumer started"
        );

        Ok(Generation {
            id,
            connection,
            channel,
            connection_closed,
            channel_closed,
            pump,
        })
    }

    async fn setup(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        if let Some(prefetch_count) = self.config.prefetch_count {
            channel.qos(prefetch_count).await?;
        }

        let queue = QueueDefinition::from(self.config.as_ref());
        let binding = QueueBinding::from(self.config.as_ref());

        AmqpTopology::new(channel.clone())
            .queue(&queue)
            .queue_binding(&binding)
            .install()
            .await
    }

    /// Supervises `generation` and its successors until the quit signal.
    pub(crate) async fn run(mut self, mut generation: Generation) {
        loop {
            self.set_state(SupervisorState::Running);

            let retirement = tokio::select! {
                biased;
                _ = quit_raised(&mut self.quit) => Retirement::Quit,
                closed = &mut generation.connection_closed => Retirement::ConnectionClosed(closed),
                closed = &mut generation.channel_closed => Retirement::ChannelClosed(closed),
                _ = &mut generation.pump => Retirement::StreamEnded,
            };

            if let Retirement::Quit = retirement {
                info!(generation = %generation.id, "stopping consumer");
                self.set_state(SupervisorState::TearingDown);
                self.retire(generation).await;
                break;
            }

            warn!(
                generation = %generation.id,
                reason = %retirement,
                "rabbitmq consumer lost its connection"
            );

            self.set_state(SupervisorState::TearingDown);
            self.retire(generation).await;

            self.set_state(SupervisorState::Reconnecting);
            generation = match self.reconnect().await {
                Some(generation) => generation,
                None => break,
            };
        }

        self.set_state(SupervisorState::Stopped);
    }

    /// Retries until a generation is established or quit is raised.
    async fn reconnect(&mut self) -> Option<Generation> {
        let backoff = self.config.backoff();

        loop {
            if *self.quit.borrow() {
                return None;
            }

            info!("rabbitmq consumer - reconnect");
            match self.establish().await {
                Ok(generation) => {
                    info!(generation = %generation.id, "rabbitmq consumer reconnected");
                    return Some(generation);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "rabbitmq consumer - reconnect failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = quit_raised(&mut self.quit) => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Cancels the subscription and closes the channel and the connection of
    /// `generation`. Its close notifications are detached, not drained.
    async fn retire(&self, generation: Generation) {
        let Generation {
            id,
            connection,
            channel,
            connection_closed,
            channel_closed,
            pump,
        } = generation;

        drop(connection_closed);
        drop(channel_closed);

        if channel.is_open() {
            if let Err(err) = channel.cancel(&self.config.consumer_tag).await {
                warn!(error = err.to_string(), generation = %id, "channel cancel failed");
            }
        }

        close_channel(&channel).await;
        close_connection(&connection).await;

        // Handler tasks are not owned by the pump and keep running.
        pump.abort();

        debug!(generation = %id, "generation retired");
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "supervisor state changed");
        }
    }
}

async fn close_channel(channel: &Arc<dyn BrokerChannel>) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), "channel close failed");
    }
}

async fn close_connection(connection: &Arc<dyn BrokerConnection>) {
    if let Err(err) = connection.close().await {
        warn!(error = err.to_string(), "connection close failed");
    }
}
