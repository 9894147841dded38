// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Pump
//!
//! This module pulls deliveries off a channel's consumer stream and fans each
//! one out to its own handler task. The pump never waits for a handler to
//! finish; when `max_in_flight` is configured it only waits for a free slot.
//!
//! A pump belongs to one connection generation. It ends when the delivery
//! stream ends (channel closed by either side) or when the quit signal is raised.

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryStream},
    handler::{dispatch, ConsumerHandler, DispatchPolicy},
    supervisor::quit_raised,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Spawns one pump per generation, sharing the handler and the concurrency
/// limit across generations.
#[derive(Clone)]
pub(crate) struct DeliveryPump {
    handler: Arc<dyn ConsumerHandler>,
    policy: Arc<DispatchPolicy>,
    limiter: Option<Arc<Semaphore>>,
}

impl DeliveryPump {
    pub(crate) fn new(
        handler: Arc<dyn ConsumerHandler>,
        policy: DispatchPolicy,
        max_in_flight: Option<usize>,
    ) -> DeliveryPump {
        DeliveryPump {
            handler,
            policy: Arc::new(policy),
            limiter: max_in_flight.map(|max| Arc::new(Semaphore::new(max.max(1)))),
        }
    }

    /// Starts pumping `deliveries` received on `channel`.
    ///
    /// Every handler task settles its delivery on `channel`, never on a newer one.
    pub(crate) fn spawn(
        &self,
        generation: Uuid,
        channel: Arc<dyn BrokerChannel>,
        mut deliveries: DeliveryStream,
        mut quit: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pump = self.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = quit_raised(&mut quit) => {
                        debug!(generation = %generation, "quit raised, no more deliveries accepted");
                        break;
                    }
                    next = deliveries.next() => next,
                };

                let Some(result) = next else {
                    break;
                };

                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        continue;
                    }
                };

                let permit = match &pump.limiter {
                    None => None,
                    Some(limiter) => tokio::select! {
                        biased;
                        _ = quit_raised(&mut quit) => break,
                        permit = limiter.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    },
                };

                pump.fan_out(generation, channel.clone(), delivery, permit);
            }

            info!(generation = %generation, "handle: async deliveries channel closed");
        })
    }

    fn fan_out(
        &self,
        generation: Uuid,
        channel: Arc<dyn BrokerChannel>,
        delivery: Delivery,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let handler = self.handler.clone();
        let policy = self.policy.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let delivery_tag = delivery.delivery_tag;

            if let Err(err) = dispatch(
                &global::tracer("amqp consumer"),
                delivery,
                handler,
                channel,
                &policy,
            )
            .await
            {
                error!(
                    error = err.to_string(),
                    generation = %generation,
                    delivery_tag,
                    "error consume msg"
                );
            }
        });
    }
}
