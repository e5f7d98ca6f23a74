// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! A [`Consumer`] is a registration that outlives connections: the client
//! spawns one worker for it per connection, each on a dedicated channel, and
//! every worker forwards broker deliveries into the same
//! [`Consumer::deliveries`] stream. Callers never see the reconnects, only a
//! pause in deliveries and, possibly, redelivered messages.

use crate::{
    errors::AmqpError,
    queue::QueueDefinition,
    registry::{next_registration_id, Registry},
    signal::{mailbox, offer, CancelSignal, Mailbox, WorkerSlot, ERRORS_CAPACITY},
    transport::{BrokerChannel, Delivery},
};
use futures_util::StreamExt;
use lapin::options::BasicConsumeOptions;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Slots between a worker and the caller. The worker runs at most one
/// delivery ahead of the caller, then waits until the caller takes it.
const DELIVERIES_CAPACITY: usize = 1;

/// Builder for [`Consumer`].
pub struct ConsumerBuilder {
    queue: Arc<QueueDefinition>,
    prefetch: u16,
    tag: String,
    auto_ack: bool,
    exclusive: bool,
    no_local: bool,
}

impl ConsumerBuilder {
    /// Sets the prefetch count applied to the consumer's channel.
    pub fn qos(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the consumer tag. An empty tag lets the broker pick one.
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// Generates a tag of the form `<queue>-pid-<pid>@<host>`.
    pub fn auto_tag(mut self) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
        self.tag = format!("{}-pid-{}@{}", self.queue.name(), std::process::id(), host);
        self
    }

    /// Lets the broker consider messages acknowledged once delivered.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Requests exclusive consumer access to the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Asks the broker not to deliver messages published on the same connection.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn build(self) -> Consumer {
        let (deliveries_tx, deliveries) = mailbox(DELIVERIES_CAPACITY);
        let (errors_tx, errors) = mailbox(ERRORS_CAPACITY);

        Consumer {
            inner: Arc::new(ConsumerInner {
                id: next_registration_id(),
                queue: self.queue,
                prefetch: self.prefetch,
                tag: self.tag,
                auto_ack: self.auto_ack,
                exclusive: self.exclusive,
                no_local: self.no_local,
                deliveries_tx,
                deliveries,
                errors_tx,
                errors,
                stop: CancelSignal::new(),
                slot: WorkerSlot::default(),
            }),
        }
    }
}

/// Consumption of one queue that survives reconnects.
///
/// Cloning is cheap; clones share the same registration.
#[derive(Clone)]
pub struct Consumer {
    pub(crate) inner: Arc<ConsumerInner>,
}

pub(crate) struct ConsumerInner {
    pub(crate) id: u64,
    queue: Arc<QueueDefinition>,
    prefetch: u16,
    tag: String,
    auto_ack: bool,
    exclusive: bool,
    no_local: bool,
    pub(crate) deliveries_tx: mpsc::Sender<Delivery>,
    deliveries: Mailbox<Delivery>,
    errors_tx: mpsc::Sender<AmqpError>,
    errors: Mailbox<AmqpError>,
    pub(crate) stop: CancelSignal,
    pub(crate) slot: WorkerSlot,
}

impl Consumer {
    pub fn builder(queue: &Arc<QueueDefinition>) -> ConsumerBuilder {
        ConsumerBuilder {
            queue: queue.clone(),
            prefetch: 0,
            tag: String::new(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
        }
    }

    /// Consumer with default options.
    pub fn new(queue: &Arc<QueueDefinition>) -> Consumer {
        Consumer::builder(queue).build()
    }

    pub fn queue(&self) -> &Arc<QueueDefinition> {
        &self.inner.queue
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Deliveries shipped to this consumer.
    ///
    /// The stream is never closed, not even across reconnects.
    pub fn deliveries(&self) -> &Mailbox<Delivery> {
        &self.inner.deliveries
    }

    /// Channel level errors: QoS, consume start and delivery stream failures.
    pub fn errors(&self) -> &Mailbox<AmqpError> {
        &self.inner.errors
    }

    /// Stops this consumer for good.
    ///
    /// The running worker, or the next one spawned, unregisters the consumer
    /// and closes its channel. Calling it again has no effect.
    pub fn cancel(&self) {
        self.inner.stop.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stop.is_cancelled()
    }
}

impl ConsumerInner {
    fn report(&self, err: AmqpError) {
        if !offer(&self.errors_tx, err) {
            warn!(queue = self.queue.name(), "consumer error dropped, stream is full");
        }
    }

    fn consume_options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: self.no_local,
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            nowait: false,
        }
    }
}

/// Worker body: one consumption on `channel` until cancellation or channel loss.
pub(crate) async fn serve(
    consumer: Arc<ConsumerInner>,
    registry: Arc<Registry>,
    channel: Arc<dyn BrokerChannel>,
) {
    if let Err(err) = channel.basic_qos(consumer.prefetch, false).await {
        error!(error = err.to_string(), "failure to configure qos");
        consumer.report(AmqpError::QoSDeclarationError(err.to_string()));
        let _ = channel.close().await;
        return;
    }

    let queue_name = consumer.queue.name();

    let mut deliveries = match channel
        .basic_consume(&queue_name, &consumer.tag, consumer.consume_options())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue_name, "error to create the consumer");
            consumer.report(AmqpError::BindingConsumerError(err.to_string()));
            let _ = channel.close().await;
            return;
        }
        Ok(stream) => stream,
    };

    debug!(queue_name, "consuming");

    loop {
        tokio::select! {
            _ = consumer.stop.cancelled() => {
                debug!(queue_name, "consumer cancelled");
                registry.remove_consumer(consumer.id);
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "error closing consumer channel");
                }
                return;
            }
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    if consumer.deliveries_tx.send(delivery).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue_name, "errors consume msg");
                    consumer.report(err);
                    return;
                }
                None => {
                    debug!(queue_name, "delivery stream closed");
                    return;
                }
            }
        }
    }
}
