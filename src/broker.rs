// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Adapter
//!
//! `BrokerClient` is the seam between the reliability layer and the broker.
//! It exposes publish (with and without publisher confirms), consumption,
//! topology declaration and the administrative queries used by health
//! checks. `RabbitMQBroker` implements it on top of `lapin`, and
//! `InMemoryBroker` implements it for tests and local development.

use crate::{
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Result of a publish awaiting a broker confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Acked,
    Nacked,
    TimedOut,
}

/// Options used when opening a consumer on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries outstanding on this consumer.
    pub prefetch: u16,
    /// Broker-side acknowledgement on delivery.
    pub no_ack: bool,
    pub exclusive: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            prefetch: 10,
            no_ack: false,
            exclusive: false,
        }
    }
}

/// Settles a single delivery on the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Guarantees that a delivery is settled at most once, whoever settles it.
#[derive(Clone)]
pub struct Settlement {
    acker: Arc<dyn Acknowledger>,
    settled: Arc<AtomicBool>,
}

impl Settlement {
    pub fn new(acker: Arc<dyn Acknowledger>) -> Settlement {
        Settlement {
            acker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A settlement for deliveries the broker already considers acked.
    pub fn pre_settled(acker: Arc<dyn Acknowledger>) -> Settlement {
        Settlement {
            acker,
            settled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Acks the delivery; `Ok(false)` when it was already settled.
    pub async fn ack(&self) -> Result<bool, AmqpError> {
        if !self.claim() {
            return Ok(false);
        }
        self.acker.ack().await.map(|_| true)
    }

    /// Nacks the delivery; `Ok(false)` when it was already settled.
    pub async fn nack(&self, requeue: bool) -> Result<bool, AmqpError> {
        if !self.claim() {
            return Ok(false);
        }
        self.acker.nack(requeue).await.map(|_| true)
    }
}

/// A message handed out by the broker, together with its settlement.
pub struct Delivery {
    pub envelope: Envelope,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
    settlement: Settlement,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Delivery {
        Delivery {
            envelope,
            exchange,
            routing_key,
            redelivered,
            delivery_tag,
            settlement,
        }
    }

    pub fn settlement(&self) -> Settlement {
        self.settlement.clone()
    }

    pub async fn ack(&self) -> Result<bool, AmqpError> {
        self.settlement.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<bool, AmqpError> {
        self.settlement.nack(requeue).await
    }
}

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Operations the reliability layer needs from a broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publishes without waiting for a broker confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;

    /// Publishes and waits for the broker's ack or nack. Never returns
    /// `Confirmation::TimedOut`; timing out is left to the caller.
    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<Confirmation, AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Fetches one message, if any, leaving it unacknowledged.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn queue_message_count(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn queue_consumer_count(&self, queue: &str) -> Result<u32, AmqpError>;

    fn is_connected(&self) -> bool;

    /// Human readable description of the connection, without credentials.
    fn connection_info(&self) -> String;
}
