// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their
//! bindings. It includes support for Dead Letter Queues (DLQ), broker-level
//! retry queues and dead-letter exchanges, which are the building blocks of
//! the reliability topology.

use crate::{envelope::HeaderValue, errors::AmqpError};
use lapin::types::{AMQPValue, ShortString};
use std::collections::BTreeMap;

/// Argument naming the exchange that receives rejected or expired messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Argument for the per-queue message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument for the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Argument for the maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Argument for the idle time after which the queue is deleted
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
    pub(crate) max_length_bytes: Option<u32>,
    pub(crate) expires: Option<u32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) arguments: BTreeMap<String, HeaderValue>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Message TTL in milliseconds.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Maximum number of ready messages; the oldest are dropped (or
    /// dead-lettered) past it.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Idle milliseconds after which the broker deletes the queue.
    pub fn expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Sends rejected and expired messages to `exchange`, optionally
    /// overriding the routing key.
    pub fn dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = routing_key.map(str::to_owned);
        self
    }

    /// Adds a raw queue argument.
    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    pub fn arguments(mut self, arguments: BTreeMap<String, HeaderValue>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    /// Adds a `<name>-dlq` queue receiving what the queue rejects.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a `<name>-retry` queue that holds rejected messages for `ttl`
    /// milliseconds and then dead-letters them back to this queue.
    pub fn with_retry(mut self, ttl: u32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retry_ttl = Some(ttl);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "queue name must not be empty".to_owned(),
            ));
        }

        if self.retry_name.is_some() && self.dlq_name.is_some() {
            return Err(AmqpError::InvalidTopology(format!(
                "queue `{}` cannot have both a retry queue and a dlq, nothing would reach the dlq",
                self.name
            )));
        }

        if self.retry_name.is_some() && self.dead_letter_exchange.is_some() {
            return Err(AmqpError::InvalidTopology(format!(
                "queue `{}` cannot have both a retry queue and a dead letter exchange",
                self.name
            )));
        }

        Ok(())
    }

    /// Full argument table sent with `queue.declare`.
    pub fn effective_arguments(&self) -> BTreeMap<String, HeaderValue> {
        let mut args = self.arguments.clone();

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::from(ttl));
        }
        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::from(max));
        }
        if let Some(max) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::from(max),
            );
        }
        if let Some(expires) = self.expires {
            args.insert(AMQP_HEADERS_EXPIRES.to_owned(), HeaderValue::from(expires));
        }

        // Rejections go to the retry queue, which cycles them back here.
        let dead_letter = match (&self.retry_name, &self.dlq_name) {
            (Some(retry), _) => Some(("".to_owned(), Some(retry.clone()))),
            (None, Some(dlq)) => Some(("".to_owned(), Some(dlq.clone()))),
            (None, None) => self
                .dead_letter_exchange
                .clone()
                .map(|exchange| (exchange, self.dead_letter_routing_key.clone())),
        };

        if let Some((exchange, routing_key)) = dead_letter {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::String(exchange),
            );
            if let Some(key) = routing_key {
                args.insert(
                    AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                    HeaderValue::String(key),
                );
            }
        }

        args
    }

    pub(crate) fn amqp_arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        self.effective_arguments()
            .iter()
            .map(|(key, value)| (ShortString::from(key.clone()), value.to_amqp()))
            .collect()
    }

    /// Companion retry queue declared ahead of this one.
    pub(crate) fn retry_queue(&self) -> Option<QueueDefinition> {
        let name = self.retry_name.as_ref()?;
        let mut def = QueueDefinition::new(name)
            .dead_letter("", Some(&self.name))
            .ttl(self.retry_ttl.unwrap_or_default());
        def.durable = self.durable;
        def.exclusive = self.exclusive;
        def.delete = self.delete;
        Some(def)
    }

    /// Companion dead letter queue declared ahead of this one.
    pub(crate) fn dlq_queue(&self) -> Option<QueueDefinition> {
        let name = self.dlq_name.as_ref()?;
        let mut def = QueueDefinition::new(name);
        def.durable = self.durable;
        def.exclusive = self.exclusive;
        def.delete = self.delete;
        Some(def)
    }

    /// Describes the first attribute that differs from `other`, if any.
    pub(crate) fn conflict_with(&self, other: &QueueDefinition) -> Option<String> {
        if self.durable != other.durable {
            return Some(format!("queue `{}` durable flag differs", self.name));
        }
        if self.exclusive != other.exclusive {
            return Some(format!("queue `{}` exclusive flag differs", self.name));
        }
        if self.delete != other.delete {
            return Some(format!("queue `{}` auto-delete flag differs", self.name));
        }
        if self.effective_arguments() != other.effective_arguments() {
            return Some(format!("queue `{}` arguments differ", self.name));
        }
        None
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue` with an empty exchange and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.queue_name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "binding queue must not be empty".to_owned(),
            ));
        }
        // The default exchange binds every queue implicitly.
        if self.exchange_name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(format!(
                "queue `{}` cannot be bound to the default exchange",
                self.queue_name
            )));
        }
        Ok(())
    }
}
