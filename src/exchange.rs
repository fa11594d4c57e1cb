// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ exchanges. Exchanges are
//! the routing mechanism that determines how messages are distributed to
//! queues. Definitions are owned and comparable so the topology registry can
//! tell an identical redeclaration from a conflicting one.

use crate::{envelope::HeaderValue, errors::AmqpError};
use lapin::types::{AMQPValue, ShortString};
use serde::Deserialize;
use std::{collections::BTreeMap, str::FromStr};

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Exchange type registered by the delayed message plugin
pub const AMQP_DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: exact match of routing keys
/// - Fanout: every bound queue regardless of routing key
/// - Topic: wildcard pattern matching of routing keys
/// - Headers: routes on header values instead of routing keys
/// - XMessageDelayed: delayed delivery (plugin required)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => AMQP_DELAYED_MESSAGE_EXCHANGE,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            AMQP_DELAYED_MESSAGE_EXCHANGE => Ok(ExchangeKind::XMessageDelayed),
            other => Err(AmqpError::InvalidTopology(format!(
                "unknown exchange type `{other}`"
            ))),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(AMQP_DELAYED_MESSAGE_EXCHANGE.to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<String, HeaderValue>,
}

impl ExchangeDefinition {
    /// Creates a non-durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Turns the exchange into a delayed exchange that routes like `inner`
    /// once the `x-delay` of each message has elapsed.
    ///
    /// This requires the x-delayed-message plugin on the RabbitMQ server.
    pub fn delayed(mut self, inner: ExchangeKind) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::String(inner.as_str().to_owned()),
        );
        self
    }

    pub fn direct_delayed(self) -> Self {
        self.delayed(ExchangeKind::Direct)
    }

    pub fn fanout_delayed(self) -> Self {
        self.delayed(ExchangeKind::Fanout)
    }

    /// Routing used by a delayed exchange once the delay elapsed.
    pub fn delayed_kind(&self) -> ExchangeKind {
        self.params
            .get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)
            .and_then(HeaderValue::as_str)
            .and_then(|kind| kind.parse().ok())
            .unwrap_or_default()
    }

    pub fn params(mut self, params: BTreeMap<String, HeaderValue>) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.params.insert(key.to_owned(), value.into());
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "exchange name must not be empty".to_owned(),
            ));
        }

        if self.name.starts_with("amq.") && !self.passive {
            return Err(AmqpError::InvalidTopology(format!(
                "exchange name `{}` uses the reserved `amq.` prefix",
                self.name
            )));
        }

        Ok(())
    }

    /// Describes the first attribute that differs from `other`, if any.
    /// Flags that don't change broker state (passive, no_wait) are ignored.
    pub(crate) fn conflict_with(&self, other: &ExchangeDefinition) -> Option<String> {
        if self.kind != other.kind {
            return Some(format!(
                "exchange `{}` kind {} != {}",
                self.name,
                self.kind.as_str(),
                other.kind.as_str()
            ));
        }
        if self.durable != other.durable {
            return Some(format!("exchange `{}` durable flag differs", self.name));
        }
        if self.delete != other.delete {
            return Some(format!("exchange `{}` auto-delete flag differs", self.name));
        }
        if self.internal != other.internal {
            return Some(format!("exchange `{}` internal flag differs", self.name));
        }
        if self.params != other.params {
            return Some(format!("exchange `{}` arguments differ", self.name));
        }
        None
    }

    pub(crate) fn amqp_params(&self) -> BTreeMap<ShortString, AMQPValue> {
        self.params
            .iter()
            .map(|(key, value)| (ShortString::from(key.clone()), value.to_amqp()))
            .collect()
    }
}
