// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! Every failure the client, its declarations and its workers can surface is an
//! `AmqpError`. None of them is fatal: connection and declaration errors land on
//! the client's error stream, consumer errors on the consumer's own stream, and
//! publish errors are returned to the caller.

use thiserror::Error;

/// Represents errors that can occur while keeping a broker connection alive.
///
/// Variants wrapping a `String` carry the message of the underlying transport
/// error, so values stay cheap to clone and compare.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// An operation needed a live connection and there was none
    #[error("no connection available")]
    NoConnection,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The broker or the network closed an established connection
    #[error("connection closed `{0}`")]
    ConnectionClosed(String),

    /// Error creating a channel or a channel closed underneath a worker
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting consumption on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The delivery stream of a consumer failed
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The publisher was cancelled before or while handling the request
    #[error("publisher is dead")]
    PublisherDead,

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Invalid client configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
