// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable Messaging Layer
//!
//! `AmqpError` covers every failure the layer can surface: transport and
//! channel problems, topology conflicts, publish rejections and confirm
//! timeouts, handler failures and failures to reach a dead-letter
//! destination. Broker client errors are logged where they happen and then
//! mapped into one of these variants, so callers never see `lapin` errors.

use thiserror::Error;

/// Represents errors that can occur while publishing, consuming or managing
/// topology on the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating or checking out a channel
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error deleting a queue or an exchange
    #[error("failure to delete `{0}`")]
    DeleteError(String),

    /// Conflicting or malformed topology declaration
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Transport or broker rejected the publish
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// No publisher confirm arrived within the given milliseconds
    #[error("no publisher confirm within {0}ms")]
    ConfirmTimeout(u64),

    /// Requested delay is outside the configured bounds
    #[error("delay of {0}ms exceeds the configured maximum")]
    InvalidDelay(u64),

    /// Error (de)serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Consumer handler raised, after the given number of attempts
    #[error("handler failed after {attempts} attempt(s): {cause}")]
    HandlerError { attempts: u32, cause: String },

    /// The dead-letter destination itself could not be reached
    #[error("failure to route to dead letter `{0}`")]
    DeadLetterRouting(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error creating a consumer on a queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Invalid configuration values
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),
}

impl AmqpError {
    /// Short stable name of the variant, stamped on dead-lettered envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            AmqpError::InternalError(_) => "InternalError",
            AmqpError::ConnectionError => "ConnectionError",
            AmqpError::ChannelError => "ChannelError",
            AmqpError::DeclareExchangeError(_) => "DeclareExchangeError",
            AmqpError::DeclareQueueError(_) => "DeclareQueueError",
            AmqpError::BindingExchangeToQueueError(_, _) => "BindingExchangeToQueueError",
            AmqpError::DeleteError(_) => "DeleteError",
            AmqpError::InvalidTopology(_) => "InvalidTopology",
            AmqpError::PublishError(_) => "PublishError",
            AmqpError::ConfirmTimeout(_) => "ConfirmTimeout",
            AmqpError::InvalidDelay(_) => "InvalidDelay",
            AmqpError::SerializationError(_) => "SerializationError",
            AmqpError::HandlerError { .. } => "HandlerError",
            AmqpError::DeadLetterRouting(_) => "DeadLetterRouting",
            AmqpError::AckMessageError => "AckMessageError",
            AmqpError::NackMessageError => "NackMessageError",
            AmqpError::QoSDeclarationError(_) => "QoSDeclarationError",
            AmqpError::ConsumerDeclarationError(_) => "ConsumerDeclarationError",
            AmqpError::ConsumerError(_) => "ConsumerError",
            AmqpError::ConfigurationError(_) => "ConfigurationError",
        }
    }
}

/// Error returned by a batch publish: the first failure plus how many
/// messages of the batch had already been published when it happened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("batch aborted after {published} message(s): {source}")]
pub struct BatchPublishError {
    pub published: usize,
    pub source: AmqpError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_reports_attempts_and_cause() {
        let err = AmqpError::HandlerError {
            attempts: 3,
            cause: "boom".to_owned(),
        };

        assert_eq!(err.to_string(), "handler failed after 3 attempt(s): boom");
    }

    #[test]
    fn batch_error_exposes_the_first_failure() {
        let err = BatchPublishError {
            published: 2,
            source: AmqpError::PublishError("unreachable".to_owned()),
        };

        assert_eq!(err.published, 2);
        assert!(err.to_string().contains("unreachable"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
