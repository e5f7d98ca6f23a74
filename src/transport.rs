// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Boundary
//!
//! The client never talks to the wire protocol directly. It dials through a
//! [`Connector`], opens channels on a [`BrokerConnection`] and drives every
//! topology, consume and publish operation through a [`BrokerChannel`].
//! [`crate::channel`] implements these traits over `lapin`.

use crate::{errors::AmqpError, exchange::ExchangeKind, otel::RabbitMQTracePropagator};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;

/// Stream of deliveries produced by a consumption started on a channel.
///
/// The stream ends when the channel or the connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Connection level notifications watched by the client guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is gone; no further events follow.
    Closed(AmqpError),
    /// The broker applies TCP flow control to the connection.
    Blocked(String),
    /// The broker lifted flow control.
    Unblocked,
}

/// Dials broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new multiplexed channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Hands out the notification receiver of this connection.
    ///
    /// Only the first call returns `Some`.
    fn notifications(&self) -> Option<mpsc::Receiver<ConnectionEvent>>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Topology, consume and publish operations of a single channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue and returns the name the broker assigned to it.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, AmqpError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Resolves once the channel is closed, with the reason.
    async fn closed(&self) -> AmqpError;
}

/// Settles a delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    /// Creates a delivery without an acknowledger.
    ///
    /// Settling such a delivery is a no-op, which is what auto-ack consumers get.
    pub fn new(body: Vec<u8>) -> Self {
        Delivery {
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            body,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.ack(multiple).await,
            None => Ok(()),
        }
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.nack(multiple, requeue).await,
            None => Ok(()),
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }

    /// Extracts the OpenTelemetry context propagated in the message headers.
    pub fn trace_context(&self) -> Context {
        let mut headers = self
            .properties
            .headers()
            .clone()
            .unwrap_or_default()
            .inner()
            .clone();

        global::get_text_map_propagator(|propagator| {
            propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
        })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body", &self.body)
            .finish()
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default)]
pub struct Publishing {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub mandatory: bool,
    pub immediate: bool,
}

impl Publishing {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Publishing {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }
}
