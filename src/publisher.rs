// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Publisher
//!
//! A [`Publisher`] is a registration bound to one exchange. Publishing is
//! synchronous from the caller's point of view: the request is handed to the
//! worker currently serving the publisher and the caller waits for the
//! broker's answer. While the client is reconnecting requests wait for the
//! next worker.

use crate::{
    errors::AmqpError,
    otel,
    registry::{next_registration_id, Registry},
    signal::{CancelSignal, WorkerSlot},
    transport::{BrokerChannel, Publishing},
};
use lapin::types::ShortString;
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A publish request travelling from the caller to the worker.
pub(crate) struct PublishRequest {
    publishing: Publishing,
    routing_key: Option<String>,
    reply: oneshot::Sender<Result<(), AmqpError>>,
}

/// Builder for [`Publisher`].
pub struct PublisherBuilder {
    exchange: String,
    routing_key: String,
    template: Publishing,
}

impl PublisherBuilder {
    /// Message used as a base by [`Publisher::write`].
    pub fn template(mut self, template: Publishing) -> Self {
        self.template = template;
        self
    }

    pub fn build(self) -> Publisher {
        let (requests_tx, requests_rx) = mpsc::channel(1);

        Publisher {
            inner: Arc::new(PublisherInner {
                id: next_registration_id(),
                exchange: self.exchange,
                routing_key: self.routing_key,
                template: self.template,
                requests_tx,
                requests_rx: Mutex::new(requests_rx),
                stop: CancelSignal::new(),
                slot: WorkerSlot::default(),
            }),
        }
    }
}

/// Publishing to one exchange that survives reconnects.
///
/// Cloning is cheap; clones share the same registration.
#[derive(Clone)]
pub struct Publisher {
    pub(crate) inner: Arc<PublisherInner>,
}

pub(crate) struct PublisherInner {
    pub(crate) id: u64,
    exchange: String,
    routing_key: String,
    template: Publishing,
    requests_tx: mpsc::Sender<PublishRequest>,
    requests_rx: Mutex<mpsc::Receiver<PublishRequest>>,
    pub(crate) stop: CancelSignal,
    pub(crate) slot: WorkerSlot,
}

impl Publisher {
    /// Starts a publisher for `exchange` with a default routing key.
    pub fn builder(exchange: &str, routing_key: &str) -> PublisherBuilder {
        PublisherBuilder {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            template: Publishing::default(),
        }
    }

    pub fn new(exchange: &str, routing_key: &str) -> Publisher {
        Publisher::builder(exchange, routing_key).build()
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Publishes with the default routing key and waits for the outcome.
    pub async fn publish(&self, publishing: Publishing) -> Result<(), AmqpError> {
        self.request(publishing, None).await
    }

    /// Publishes with an explicit routing key and waits for the outcome.
    pub async fn publish_with_key(
        &self,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<(), AmqpError> {
        self.request(publishing, Some(routing_key.to_owned())).await
    }

    /// Publishes `bytes` as the body of the template message.
    ///
    /// The byte count is always `bytes.len()`, whatever the outcome.
    pub async fn write(&self, bytes: &[u8]) -> (usize, Result<(), AmqpError>) {
        let mut publishing = self.inner.template.clone();
        publishing.body = bytes.to_vec();

        (bytes.len(), self.publish(publishing).await)
    }

    /// Serializes `value` to JSON and publishes it with the given message type.
    pub async fn publish_json<T>(&self, msg_type: &str, value: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        let mut publishing = self.inner.template.clone();
        publishing.body = body;
        publishing.properties = publishing
            .properties
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(msg_type));

        self.publish(publishing).await
    }

    /// Stops this publisher for good.
    ///
    /// Callers still waiting, and every later request, get
    /// [`AmqpError::PublisherDead`] unless the worker already published their
    /// message. Calling it again has no effect.
    pub fn cancel(&self) {
        self.inner.stop.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    async fn request(
        &self,
        publishing: Publishing,
        routing_key: Option<String>,
    ) -> Result<(), AmqpError> {
        if self.inner.stop.is_cancelled() {
            return Err(AmqpError::PublisherDead);
        }

        let (reply, answer) = oneshot::channel();
        let request = PublishRequest {
            publishing,
            routing_key,
            reply,
        };

        tokio::select! {
            biased;
            _ = self.inner.stop.cancelled() => return Err(AmqpError::PublisherDead),
            sent = self.inner.requests_tx.send(request) => {
                if sent.is_err() {
                    return Err(AmqpError::PublisherDead);
                }
            }
        }

        // A cancelled publisher may never get another worker to answer.
        tokio::select! {
            biased;
            answer = answer => answer.unwrap_or(Err(AmqpError::PublisherDead)),
            _ = self.inner.stop.cancelled() => Err(AmqpError::PublisherDead),
        }
    }
}

impl PublisherInner {
    /// Fails every request still queued for a cancelled publisher that no
    /// worker serves any more.
    pub(crate) fn reject_pending(&self) {
        if let Ok(mut requests) = self.requests_rx.try_lock() {
            reject_queued(&mut requests);
        }
    }

    async fn publish(&self, channel: &dyn BrokerChannel, request: PublishRequest) {
        let PublishRequest {
            mut publishing,
            routing_key,
            reply,
        } = request;

        if publishing.properties.message_id().is_none() {
            publishing.properties = publishing
                .properties
                .with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }
        publishing.properties = otel::inject_context(&Context::current(), publishing.properties);

        let routing_key = routing_key.as_deref().unwrap_or(&self.routing_key);

        let result = channel
            .basic_publish(&self.exchange, routing_key, &publishing)
            .await;

        if let Err(err) = &result {
            error!(error = err.to_string(), "error publishing message");
        }

        if reply.send(result).is_err() {
            debug!("publish caller went away before the reply");
        }
    }
}

/// Closes the queue and drops the reply slot of every queued request.
fn reject_queued(requests: &mut mpsc::Receiver<PublishRequest>) {
    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(Err(AmqpError::PublisherDead));
    }
}

/// Worker body: serves publish requests on `channel` until cancellation or
/// channel loss.
pub(crate) async fn serve(
    publisher: Arc<PublisherInner>,
    registry: Arc<Registry>,
    channel: Arc<dyn BrokerChannel>,
) {
    let mut requests = publisher.requests_rx.lock().await;

    let closed = channel.closed();
    tokio::pin!(closed);

    debug!(exchange = publisher.exchange, "publisher serving");

    loop {
        tokio::select! {
            biased;
            _ = publisher.stop.cancelled() => {
                debug!(exchange = publisher.exchange, "publisher cancelled");
                registry.remove_publisher(publisher.id);
                reject_queued(&mut requests);
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "error closing publisher channel");
                }
                return;
            }
            err = &mut closed => {
                warn!(error = err.to_string(), exchange = publisher.exchange, "publisher channel closed");
                return;
            }
            request = requests.recv() => match request {
                Some(request) => publisher.publish(channel.as_ref(), request).await,
                None => return,
            }
        }
    }
}
