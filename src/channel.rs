// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! `lapin` implementation of the transport traits. Connection and channel
//! failures reported by lapin's error callbacks are turned into
//! [`ConnectionEvent::Closed`] notifications and channel close reasons.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{
        Acknowledger, BrokerChannel, BrokerConnection, ConnectionEvent, Connector, Delivery,
        DeliveryStream, Publishing,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

const NOTIFICATIONS_CAPACITY: usize = 8;

type CloseCell = Arc<watch::Sender<Option<AmqpError>>>;

/// Close cells of the channels opened on one connection.
#[derive(Default)]
struct OpenChannels {
    cells: Mutex<Vec<Weak<watch::Sender<Option<AmqpError>>>>>,
}

impl OpenChannels {
    /// Tracks `cell`, forgetting channels already dropped or closed.
    fn track(&self, cell: &CloseCell) {
        let mut cells = self.cells.lock();
        cells.retain(|cell| match cell.upgrade() {
            Some(cell) => {
                let open = cell.borrow().is_none();
                open
            }
            None => false,
        });
        cells.push(Arc::downgrade(cell));
    }

    /// Closes every tracked channel with `reason`.
    fn fail_all(&self, reason: &AmqpError) {
        for cell in self.cells.lock().drain(..) {
            if let Some(cell) = cell.upgrade() {
                cell.send_replace(Some(reason.clone()));
            }
        }
    }
}

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    connection_name: Option<String>,
}

impl LapinConnector {
    pub fn new() -> Self {
        LapinConnector::default()
    }

    /// Name shown for the connection in the broker management UI.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");

        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let connection = match Connection::connect(uri, options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        };
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

/// A live `lapin` connection.
pub struct LapinConnection {
    connection: Connection,
    events: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    channels: Arc<OpenChannels>,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let (events_tx, events_rx) = mpsc::channel(NOTIFICATIONS_CAPACITY);
        let channels: Arc<OpenChannels> = Arc::default();

        let open_channels = channels.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");

            let reason = AmqpError::ConnectionClosed(err.to_string());
            open_channels.fail_all(&reason);
            let _ = events_tx.try_send(ConnectionEvent::Closed(reason));
        });

        LapinConnection {
            connection,
            events: Mutex::new(Some(events_rx)),
            channels,
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");

        let channel = match self.connection.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        };
        debug!("channel created");

        let channel = LapinChannel::new(channel);
        self.channels.track(&channel.close_reason);
        Ok(Arc::new(channel))
    }

    fn notifications(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing connection");
            AmqpError::ConnectionClosed(err.to_string())
        })
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
    close_reason: CloseCell,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        let (close_reason, _) = watch::channel(None);
        let close_reason = Arc::new(close_reason);

        let on_error = Arc::downgrade(&close_reason);
        channel.on_error(move |err| {
            if let Some(close_reason) = on_error.upgrade() {
                close_reason.send_replace(Some(AmqpError::ChannelError(err.to_string())));
            }
        });

        LapinChannel {
            channel,
            close_reason,
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, AmqpError> {
        self.channel
            .queue_declare(name, options, arguments)
            .await
            .map(|queue| queue.name().as_str().to_owned())
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind.into(), options, arguments)
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        Ok(consumer
            .map(|delivery| match delivery {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
    ) -> Result<(), AmqpError> {
        let options = BasicPublishOptions {
            mandatory: publishing.mandatory,
            immediate: publishing.immediate,
        };

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options,
                &publishing.body,
                publishing.properties.clone(),
            )
            .await
        {
            Err(err) => Err(AmqpError::PublishingError(err.to_string())),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.close_reason
            .send_replace(Some(AmqpError::ChannelError("closed by client".to_owned())));

        self.channel
            .close(200, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn closed(&self) -> AmqpError {
        let mut rx = self.close_reason.subscribe();
        let reason = rx.wait_for(|reason| reason.is_some()).await.map(|r| r.clone());

        match reason {
            Ok(Some(err)) => err,
            _ => AmqpError::ChannelError("channel closed".to_owned()),
        }
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let acker = Arc::new(LapinAcker {
        acker: delivery.acker.clone(),
    });

    let mut out = Delivery::new(delivery.data);
    out.delivery_tag = delivery.delivery_tag;
    out.exchange = delivery.exchange.as_str().to_owned();
    out.routing_key = delivery.routing_key.as_str().to_owned();
    out.redelivered = delivery.redelivered;
    out.properties = delivery.properties;
    out.with_acker(acker)
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}
