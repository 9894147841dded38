// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Dispatch
//!
//! This module runs the owner supplied business logic for a single delivery and
//! maps its outcome to an acknowledgment decision:
//!
//! - success: `basic.ack` with `multiple = false`
//! - failure: `basic.reject` with `requeue = true`
//! - failure after the configured redelivery cap: `basic.reject` with `requeue = false`
//!
//! Handlers run concurrently and complete out of order, so acknowledgments are
//! always issued per delivery. A cumulative ack would confirm younger deliveries
//! whose handlers are still running, and their own ack would later fail with
//! `PRECONDITION_FAILED`.

use crate::{
    broker::{BrokerChannel, Delivery},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicRejectOptions},
    types::AMQPValue,
    BasicProperties,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    collections::{hash_map::DefaultHasher, HashMap},
    future::Future,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Constant for the delivery counter maintained by quorum queues
pub const AMQP_HEADERS_X_DELIVERY_COUNT: &str = "x-delivery-count";

/// Upper bound of requeued messages whose failures are remembered locally
const MAX_TRACKED_MESSAGES: usize = 10_000;

/// Error returned by a handler to signal a processing failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The message handed to a [`ConsumerHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Previous delivery attempts, 0 on a first delivery.
    ///
    /// Read from the broker headers, or counted by the consumer itself when a
    /// redelivery cap is configured and the queue carries no counter.
    pub delivery_count: i64,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    /// Builds the message a handler sees from a broker delivery.
    ///
    /// # Parameters
    /// * `queue` - Queue the delivery was consumed from
    /// * `delivery` - The delivery received from the broker
    ///
    /// # Returns
    /// A `ConsumerMessage` with the broker reported delivery count
    pub fn new(queue: &str, delivery: &Delivery) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            delivery_count: extract_delivery_count(&delivery.properties),
            data: delivery.data.clone(),
        }
    }
}

/// Business logic invoked once per delivery.
///
/// Returning `Ok(())` acknowledges the delivery, returning an error requeues it.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Adapts an async closure over the raw payload into a [`ConsumerHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(msg.data.clone()).await
    }
}

/// Wraps `f` so it can be given to a consumer.
///
/// # Parameters
/// * `f` - Async function receiving the message payload
///
/// # Returns
/// A shareable `ConsumerHandler` calling `f` for every delivery
///
/// ```ignore
/// let handler = handler_fn(|body: Vec<u8>| async move {
///     println!("{}", String::from_utf8_lossy(&body));
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// What to tell the broker about a processed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed, remove it from the queue.
    Ack,
    /// Failed, redeliver it.
    Requeue,
    /// Failed too many times, let the broker drop or dead-letter it.
    Discard,
}

impl AckDecision {
    pub(crate) fn from_outcome(
        outcome: &Result<(), HandlerError>,
        delivery_count: i64,
        max_redeliveries: Option<i64>,
    ) -> AckDecision {
        match outcome {
            Ok(_) => AckDecision::Ack,
            Err(_) if max_redeliveries.is_some_and(|max| delivery_count >= max) => {
                AckDecision::Discard
            }
            Err(_) => AckDecision::Requeue,
        }
    }
}

/// Per-consumer settings used by every dispatch.
#[derive(Debug)]
pub(crate) struct DispatchPolicy {
    pub(crate) queue: String,
    pub(crate) max_redeliveries: Option<i64>,
    attempts: AttemptTracker,
}

impl DispatchPolicy {
    pub(crate) fn new(queue: &str, max_redeliveries: Option<i64>) -> DispatchPolicy {
        DispatchPolicy {
            queue: queue.to_owned(),
            max_redeliveries,
            attempts: AttemptTracker::default(),
        }
    }
}

/// Identifies a message across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AttemptKey {
    MessageId(String),
    Payload(u64),
}

impl AttemptKey {
    fn of(delivery: &Delivery) -> AttemptKey {
        match delivery.properties.message_id() {
            Some(id) => AttemptKey::MessageId(id.as_str().to_owned()),
            None => {
                let mut hasher = DefaultHasher::new();
                delivery.data.hash(&mut hasher);
                AttemptKey::Payload(hasher.finish())
            }
        }
    }
}

/// Counts the failed attempts of requeued messages.
///
/// Classic queues only flag a redelivery with `redelivered` and never carry a
/// delivery counter, so the count is kept on the consumer side. It survives
/// reconnections but not a restart of the process.
#[derive(Debug, Default)]
struct AttemptTracker {
    failures: Mutex<HashMap<AttemptKey, i64>>,
}

impl AttemptTracker {
    /// A first delivery starts over from zero.
    fn previous_failures(&self, key: &AttemptKey, redelivered: bool) -> i64 {
        let mut failures = self.failures();
        if !redelivered {
            failures.remove(key);
            return 0;
        }

        failures.get(key).copied().unwrap_or_default()
    }

    fn record(&self, key: AttemptKey, decision: AckDecision) {
        let mut failures = self.failures();
        match decision {
            AckDecision::Requeue => {
                if failures.len() >= MAX_TRACKED_MESSAGES && !failures.contains_key(&key) {
                    warn!(
                        tracked = failures.len(),
                        "too many requeued messages tracked, forgetting their attempts"
                    );
                    failures.clear();
                }
                *failures.entry(key).or_default() += 1;
            }
            AckDecision::Ack | AckDecision::Discard => {
                failures.remove(&key);
            }
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<AttemptKey, i64>> {
        match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Processes one delivery and settles it on the channel that produced it.
///
/// Returns the decision that was applied. If the channel was retired while the
/// handler ran, nothing is sent and `ChannelClosed` is returned: the broker
/// already requeued the delivery when the channel went away.
pub(crate) async fn dispatch(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: Arc<dyn ConsumerHandler>,
    channel: Arc<dyn BrokerChannel>,
    policy: &DispatchPolicy,
) -> Result<AckDecision, AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &policy.queue);

    debug!(
        delivery_tag = delivery.delivery_tag,
        size = delivery.data.len(),
        "received: {} - exchange: {}",
        policy.queue,
        delivery.exchange,
    );

    let attempt_key = policy.max_redeliveries.map(|_| AttemptKey::of(&delivery));

    let mut msg = ConsumerMessage::new(&policy.queue, &delivery);
    if let Some(key) = &attempt_key {
        let failures = policy.attempts.previous_failures(key, delivery.redelivered);
        msg.delivery_count = msg.delivery_count.max(failures);
    }

    let result = handler.exec(&ctx, &msg).await;

    if let Err(err) = &result {
        warn!(
            error = err.to_string(),
            delivery_tag = delivery.delivery_tag,
            "error whiling handling msg"
        );
        span.record_error(err.as_ref());
    }

    let decision = AckDecision::from_outcome(&result, msg.delivery_count, policy.max_redeliveries);

    if !channel.is_open() {
        warn!(
            delivery_tag = delivery.delivery_tag,
            "channel retired before the msg was settled, the broker will redeliver it"
        );
        span.set_status(Status::Error {
            description: Cow::from("channel closed before settlement"),
        });
        return Err(AmqpError::ChannelClosed(format!(
            "delivery {} not settled",
            delivery.delivery_tag
        )));
    }

    let settled = match decision {
        AckDecision::Ack => {
            channel
                .ack(delivery.delivery_tag, BasicAckOptions { multiple: false })
                .await
        }
        AckDecision::Requeue => {
            channel
                .reject(delivery.delivery_tag, BasicRejectOptions { requeue: true })
                .await
        }
        AckDecision::Discard => {
            error!(
                delivery_tag = delivery.delivery_tag,
                delivery_count = msg.delivery_count,
                "too many attempts, rejecting without requeue"
            );
            channel
                .reject(delivery.delivery_tag, BasicRejectOptions { requeue: false })
                .await
        }
    };

    match settled {
        Err(err) => {
            error!(error = err.to_string(), "error whiling settling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            Err(err)
        }
        Ok(_) => {
            if let Some(key) = attempt_key {
                policy.attempts.record(key, decision);
            }

            if result.is_ok() {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
            } else {
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });
            }
            Ok(decision)
        }
    }
}

/// Extracts how many times the broker already delivered a message.
///
/// Quorum queues maintain `x-delivery-count`; dead-letter cycles leave a count
/// in the first `x-death` entry. The largest of both wins.
pub(crate) fn extract_delivery_count(props: &BasicProperties) -> i64 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    let delivery_count = headers
        .inner()
        .get(AMQP_HEADERS_X_DELIVERY_COUNT)
        .and_then(as_count)
        .unwrap_or_default();

    let death_count = headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(as_count)
        .unwrap_or_default();

    delivery_count.max(death_count)
}

fn as_count(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
