// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ connection layer.
//!
//! A [`Client`] keeps one connection to the broker alive, replays the
//! registered topology after every reconnect and supervises the workers of
//! registered [`Consumer`]s and [`Publisher`]s, so callers keep consuming and
//! publishing through the same handles across connection failures.

mod otel;
mod registry;

#[cfg(test)]
mod fake;

pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod declaration;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod signal;
pub mod topology;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy};
pub use client::{Blocking, Client, ClientBuilder, ConnectionState};
pub use config::RabbitMQConfigs;
pub use consumer::Consumer;
pub use errors::AmqpError;
pub use publisher::Publisher;
pub use topology::Topology;
pub use transport::{Delivery, Publishing};
