// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declarations
//!
//! A declaration is an idempotent setup action replayed against a fresh
//! control channel every time the client gets a connection. Declarations run
//! in the order they were registered, so a binding registered after a
//! server-named queue sees the name the broker assigned in the same pass.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Idempotent topology setup action.
#[async_trait]
pub trait Declaration: Send + Sync {
    /// Short description used in logs.
    fn describe(&self) -> String;

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;
}

/// Declares a queue, writing the broker-assigned name back into `queue`.
pub fn declare_queue(queue: &Arc<QueueDefinition>) -> Arc<dyn Declaration> {
    Arc::new(DeclareQueue {
        queue: queue.clone(),
    })
}

/// Declares an exchange.
pub fn declare_exchange(exchange: ExchangeDefinition) -> Arc<dyn Declaration> {
    Arc::new(DeclareExchange { exchange })
}

/// Binds a queue to an exchange.
pub fn declare_binding(binding: QueueBinding) -> Arc<dyn Declaration> {
    Arc::new(DeclareBinding { binding })
}

/// Replays `declarations` in order, collecting the failures.
///
/// A failing declaration does not stop the ones after it.
pub(crate) async fn replay(
    declarations: &[Arc<dyn Declaration>],
    channel: &dyn BrokerChannel,
) -> Vec<AmqpError> {
    let mut failures = vec![];

    for declaration in declarations {
        debug!("declaring {}", declaration.describe());

        if let Err(err) = declaration.declare(channel).await {
            failures.push(err);
        }
    }

    failures
}

struct DeclareQueue {
    queue: Arc<QueueDefinition>,
}

impl DeclareQueue {
    fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.queue.passive,
            durable: self.queue.durable,
            exclusive: self.queue.exclusive,
            auto_delete: self.queue.auto_delete,
            nowait: false,
        }
    }

    async fn declare_dlq(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let Some(dlq_name) = self.queue.dlq_name() else {
            warn!("dead letter queue skipped for a server-named queue");
            return Ok(());
        };

        match channel
            .queue_declare(&dlq_name, self.options(), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare dlq");
                Err(AmqpError::DeclareQueueError(dlq_name))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Declaration for DeclareQueue {
    fn describe(&self) -> String {
        format!("queue `{}`", self.queue.name())
    }

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if self.queue.dlq {
            self.declare_dlq(channel).await?;
        }

        let name = self.queue.name();

        match channel
            .queue_declare(&name, self.options(), self.queue.arguments())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name))
            }
            Ok(assigned) => {
                debug!("queue: {} was declared", assigned);
                self.queue.set_name(assigned);
                Ok(())
            }
        }
    }
}

struct DeclareExchange {
    exchange: ExchangeDefinition,
}

#[async_trait]
impl Declaration for DeclareExchange {
    fn describe(&self) -> String {
        format!("{} exchange `{}`", self.exchange.kind, self.exchange.name)
    }

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let exch = &self.exchange;

        match channel
            .exchange_declare(
                &exch.name,
                exch.kind.clone(),
                ExchangeDeclareOptions {
                    passive: exch.passive,
                    durable: exch.durable,
                    auto_delete: exch.auto_delete,
                    internal: exch.internal,
                    nowait: false,
                },
                exch.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exch.name.clone()))
            }
            _ => Ok(()),
        }
    }
}

struct DeclareBinding {
    binding: QueueBinding,
}

#[async_trait]
impl Declaration for DeclareBinding {
    fn describe(&self) -> String {
        format!(
            "binding `{}` -> `{}`",
            self.binding.exchange_name,
            self.binding.queue.name()
        )
    }

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let queue_name = self.binding.queue.name();

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue_name, self.binding.exchange_name, self.binding.routing_key
        );

        match channel
            .queue_bind(
                &queue_name,
                &self.binding.exchange_name,
                &self.binding.routing_key,
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    self.binding.exchange_name.clone(),
                    queue_name,
                ))
            }
            _ => Ok(()),
        }
    }
}
