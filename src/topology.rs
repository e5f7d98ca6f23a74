// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology
//!
//! [`Topology`] groups the exchanges, queues and bindings an application
//! needs into one ordered list of declarations, registered on the client with
//! [`crate::client::Client::declare_topology`].
//!
//! Components are declared in the order they are added, so a binding must be
//! added after the queue and the exchange it refers to:
//!
//! ```ignore
//! let queue = Arc::new(QueueDefinition::new("orders").durable().with_dlq());
//!
//! let topology = Topology::new()
//!     .exchange(&ExchangeDefinition::new("orders").topic().durable())
//!     .queue(&queue)
//!     .queue_binding(&QueueBinding::new(&queue).exchange("orders").routing_key("order.*"));
//!
//! client.declare_topology(topology);
//! ```

use crate::{
    declaration::{declare_binding, declare_exchange, declare_queue, Declaration},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::sync::Arc;

/// Ordered set of topology declarations.
#[derive(Default)]
pub struct Topology {
    declarations: Vec<Arc<dyn Declaration>>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange declaration.
    pub fn exchange(mut self, def: &ExchangeDefinition) -> Self {
        self.declarations.push(declare_exchange(def.clone()));
        self
    }

    /// Adds a queue declaration.
    ///
    /// The broker-assigned name of a server-named queue is written back into
    /// `def` once declared.
    pub fn queue(mut self, def: &Arc<QueueDefinition>) -> Self {
        self.declarations.push(declare_queue(def));
        self
    }

    /// Adds a queue-to-exchange binding.
    pub fn queue_binding(mut self, binding: &QueueBinding) -> Self {
        self.declarations.push(declare_binding(binding.clone()));
        self
    }

    /// Adds an already built declaration.
    pub fn declaration(mut self, declaration: Arc<dyn Declaration>) -> Self {
        self.declarations.push(declaration);
        self
    }

    pub fn declarations(&self) -> &[Arc<dyn Declaration>] {
        &self.declarations
    }

    pub fn into_declarations(self) -> Vec<Arc<dyn Declaration>> {
        self.declarations
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_call_order() {
        let queue = Arc::new(QueueDefinition::new("orders"));

        let topology = Topology::new()
            .queue(&queue)
            .exchange(&ExchangeDefinition::new("orders").topic())
            .queue_binding(&QueueBinding::new(&queue).exchange("orders"));

        let described: Vec<String> = topology
            .declarations()
            .iter()
            .map(|d| d.describe())
            .collect();

        assert_eq!(
            described,
            vec![
                "queue `orders`",
                "topic exchange `orders`",
                "binding `orders` -> `orders`"
            ]
        );
    }

    #[test]
    fn empty_by_default() {
        let topology = Topology::new();

        assert!(topology.is_empty());
        assert!(topology.into_declarations().is_empty());
    }
}
