// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! The `TopologyRegistry` declares exchanges, queues and bindings on the
//! broker and remembers what it declared. Redeclaring an identical entry is
//! a no-op, while redeclaring a name with different attributes fails with
//! `AmqpError::InvalidTopology`.
//!
//! It also owns the well-known reliability topology:
//! - the dead letter exchange, queue and binding;
//! - the delay exchange, queue and binding;
//! - the per-destination holding queues of the TTL delay strategy.
//!
//! The main components are:
//! - `Topology` trait: builder-style staging followed by `install`
//! - `TopologyPlan`: staged entries installed through a registry
//! - `TopologyRegistry`: idempotent declarations tracked in-process

use crate::{
    broker::BrokerClient,
    configs::{DelayStrategy, MessagingConfigs},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Idle time, past the delay, after which a holding queue is removed
const HOLDING_QUEUE_GRACE_MS: u64 = 60 * 1000;

/// A declared exchange or queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEntry {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
}

impl TopologyEntry {
    pub fn name(&self) -> &str {
        match self {
            TopologyEntry::Exchange(def) => def.name(),
            TopologyEntry::Queue(def) => def.name(),
        }
    }
}

/// Trait defining builder-style topology staging.
///
/// Entries are collected first and created on the broker by `install`, in
/// order: exchanges, queues (with their companion queues), bindings.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Staged topology installed through a `TopologyRegistry`.
pub struct TopologyPlan<'r> {
    registry: &'r TopologyRegistry,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

#[async_trait]
impl Topology for TopologyPlan<'_> {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for def in &self.exchanges {
            self.registry.declare_exchange(def).await?;
        }
        for def in &self.queues {
            self.registry.declare_queue(def).await?;
        }
        for binding in &self.queues_binding {
            self.registry.bind(binding).await?;
        }

        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.queues_binding.len(),
            "topology installed"
        );

        Ok(())
    }
}

/// In-process record of the topology declared on the broker.
pub struct TopologyRegistry {
    broker: Arc<dyn BrokerClient>,
    exchanges: RwLock<HashMap<String, ExchangeDefinition>>,
    queues: RwLock<HashMap<String, QueueDefinition>>,
    bindings: RwLock<HashSet<QueueBinding>>,
}

impl TopologyRegistry {
    pub fn new(broker: Arc<dyn BrokerClient>) -> TopologyRegistry {
        TopologyRegistry {
            broker,
            exchanges: RwLock::default(),
            queues: RwLock::default(),
            bindings: RwLock::default(),
        }
    }

    /// Starts staging a topology to install through this registry.
    pub fn plan(&self) -> TopologyPlan<'_> {
        TopologyPlan {
            registry: self,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Declares `def`, or checks it against the recorded declaration.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        def.validate()?;

        let mut exchanges = self.exchanges.write().await;

        if let Some(existing) = exchanges.get(def.name()) {
            if def.passive {
                return Ok(());
            }
            return match existing.conflict_with(def) {
                Some(reason) => {
                    error!(
                        name = def.name(),
                        reason = reason.as_str(),
                        "conflicting exchange redeclaration"
                    );
                    Err(AmqpError::InvalidTopology(reason))
                }
                None => Ok(()),
            };
        }

        debug!("creating exchange: {}", def.name());

        match self.broker.declare_exchange(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                Err(err)
            }
            _ => Ok(()),
        }?;

        if !def.passive {
            exchanges.insert(def.name().to_owned(), def.clone());
        }
        debug!("exchange: {} was created", def.name());

        Ok(())
    }

    /// Declares `def` together with its companion retry and dead letter
    /// queues, which are created first.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        def.validate()?;

        if let Some(retry) = def.retry_queue() {
            self.declare_single_queue(&retry).await?;
        }
        if let Some(dlq) = def.dlq_queue() {
            self.declare_single_queue(&dlq).await?;
        }

        self.declare_single_queue(def).await
    }

    async fn declare_single_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut queues = self.queues.write().await;

        if let Some(existing) = queues.get(def.name()) {
            if def.passive {
                return Ok(());
            }
            return match existing.conflict_with(def) {
                Some(reason) => {
                    error!(
                        name = def.name(),
                        reason = reason.as_str(),
                        "conflicting queue redeclaration"
                    );
                    Err(AmqpError::InvalidTopology(reason))
                }
                None => Ok(()),
            };
        }

        debug!("creating queue: {}", def.name());

        match self.broker.declare_queue(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the queue"
                );
                Err(err)
            }
            _ => Ok(()),
        }?;

        if !def.passive {
            queues.insert(def.name().to_owned(), def.clone());
        }
        debug!("queue: {} was created", def.name());

        Ok(())
    }

    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        binding.validate()?;

        let mut bindings = self.bindings.write().await;
        if bindings.contains(binding) {
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self.broker.bind_queue(binding).await {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(err)
            }
            _ => Ok(()),
        }?;

        bindings.insert(binding.clone());
        Ok(())
    }

    pub async fn unbind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        binding.validate()?;

        match self.broker.unbind_queue(binding).await {
            Err(err) => {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                Err(err)
            }
            _ => Ok(()),
        }?;

        self.bindings.write().await.remove(binding);
        Ok(())
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        if name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "queue name must not be empty".to_owned(),
            ));
        }

        match self.broker.delete_queue(name).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the queue");
                Err(err)
            }
            _ => Ok(()),
        }?;

        self.queues.write().await.remove(name);
        self.bindings
            .write()
            .await
            .retain(|binding| binding.queue_name != name);
        debug!("queue: {} was deleted", name);

        Ok(())
    }

    pub async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        if name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "exchange name must not be empty".to_owned(),
            ));
        }

        match self.broker.delete_exchange(name).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the exchange");
                Err(err)
            }
            _ => Ok(()),
        }?;

        self.exchanges.write().await.remove(name);
        self.bindings
            .write()
            .await
            .retain(|binding| binding.exchange_name != name);
        debug!("exchange: {} was deleted", name);

        Ok(())
    }

    pub async fn is_exchange_declared(&self, name: &str) -> bool {
        self.exchanges.read().await.contains_key(name)
    }

    /// True when `name` was declared as an `x-delayed-message` exchange.
    pub async fn is_delayed_exchange(&self, name: &str) -> bool {
        self.exchanges
            .read()
            .await
            .get(name)
            .is_some_and(|def| def.exchange_kind() == ExchangeKind::XMessageDelayed)
    }

    pub async fn is_queue_declared(&self, name: &str) -> bool {
        self.queues.read().await.contains_key(name)
    }

    /// Snapshot of every recorded exchange and queue.
    pub async fn entries(&self) -> Vec<TopologyEntry> {
        let mut entries: Vec<TopologyEntry> = self
            .exchanges
            .read()
            .await
            .values()
            .cloned()
            .map(TopologyEntry::Exchange)
            .collect();
        entries.extend(
            self.queues
                .read()
                .await
                .values()
                .cloned()
                .map(TopologyEntry::Queue),
        );
        entries
    }

    /// Declares the dead letter and delay topology described by `configs`.
    pub async fn install_well_known(&self, configs: &MessagingConfigs) -> Result<(), AmqpError> {
        let dead_letter = &configs.dead_letter;

        let mut dlq = QueueDefinition::new(&dead_letter.queue).durable();
        if let Some(ttl) = dead_letter.ttl_ms {
            dlq = dlq.ttl(ttl);
        }
        if let Some(max) = dead_letter.max_length {
            dlq = dlq.max_length(max);
        }

        let delay = &configs.delay;
        let delay_exchange = match delay.strategy {
            DelayStrategy::Plugin => ExchangeDefinition::new(&delay.exchange)
                .durable()
                .direct_delayed(),
            DelayStrategy::TtlQueue => ExchangeDefinition::new(&delay.exchange).durable().direct(),
        };

        self.plan()
            .exchange(
                ExchangeDefinition::new(&dead_letter.exchange)
                    .durable()
                    .direct(),
            )
            .exchange(delay_exchange)
            .queue(dlq)
            .queue(QueueDefinition::new(&delay.queue).durable())
            .queue_binding(
                QueueBinding::new(&dead_letter.queue)
                    .exchange(&dead_letter.exchange)
                    .routing_key(&dead_letter.routing_key),
            )
            .queue_binding(
                QueueBinding::new(&delay.queue)
                    .exchange(&delay.exchange)
                    .routing_key(&delay.routing_key),
            )
            .install()
            .await
    }

    /// Declares the holding queue that keeps messages for `delay` before
    /// dead-lettering them to `exchange` with `routing_key`, and returns its
    /// name.
    pub async fn declare_delay_queue(
        &self,
        configs: &MessagingConfigs,
        exchange: &str,
        routing_key: &str,
        delay: Duration,
    ) -> Result<String, AmqpError> {
        let def = delay_holding_queue(configs, exchange, routing_key, delay)?;
        self.declare_queue(&def).await?;
        Ok(def.name().to_owned())
    }
}

/// Holding queue definition for one destination and delay.
pub(crate) fn delay_holding_queue(
    configs: &MessagingConfigs,
    exchange: &str,
    routing_key: &str,
    delay: Duration,
) -> Result<QueueDefinition, AmqpError> {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let ttl = u32::try_from(delay_ms).map_err(|_| AmqpError::InvalidDelay(delay_ms))?;
    let expires = u32::try_from(delay_ms.saturating_add(HOLDING_QUEUE_GRACE_MS))
        .map_err(|_| AmqpError::InvalidDelay(delay_ms))?;

    let destination = if exchange.is_empty() { "default" } else { exchange };
    let name = format!(
        "{}.{}.{}.{}",
        configs.delay.queue, destination, routing_key, delay_ms
    );

    Ok(QueueDefinition::new(&name)
        .durable()
        .ttl(ttl)
        .expires(expires)
        .dead_letter(exchange, Some(routing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerClient,
        envelope::HeaderValue,
        exchange::ExchangeKind,
        memory::InMemoryBroker,
        queue::{
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQP_HEADERS_EXPIRES, AMQP_HEADERS_MESSAGE_TTL,
        },
    };

    #[tokio::test]
    async fn identical_redeclaration_reaches_the_broker_once() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_declare_exchange()
            .times(1)
            .returning(|_| Ok(()));
        broker.expect_declare_queue().times(1).returning(|_| Ok(()));
        broker.expect_bind_queue().times(1).returning(|_| Ok(()));

        let registry = TopologyRegistry::new(Arc::new(broker));
        let exchange = ExchangeDefinition::new("orders").durable().topic();
        let queue = QueueDefinition::new("orders.q").durable();
        let binding = QueueBinding::new("orders.q")
            .exchange("orders")
            .routing_key("orders.*");

        for _ in 0..2 {
            registry.declare_exchange(&exchange).await.unwrap();
            registry.declare_queue(&queue).await.unwrap();
            registry.bind(&binding).await.unwrap();
        }

        assert!(registry.is_exchange_declared("orders").await);
        assert!(registry.is_queue_declared("orders.q").await);
        assert_eq!(registry.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn conflicting_redeclaration_is_invalid_topology() {
        let mut broker = MockBrokerClient::new();
        broker.expect_declare_queue().times(1).returning(|_| Ok(()));

        let registry = TopologyRegistry::new(Arc::new(broker));
        registry
            .declare_queue(&QueueDefinition::new("orders.q").durable())
            .await
            .unwrap();

        let err = registry
            .declare_queue(&QueueDefinition::new("orders.q"))
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn broker_failures_are_not_recorded() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_declare_exchange()
            .times(2)
            .returning(|_| Err(AmqpError::DeclareExchangeError("orders".to_owned())));

        let registry = TopologyRegistry::new(Arc::new(broker));
        let def = ExchangeDefinition::new("orders");

        assert!(registry.declare_exchange(&def).await.is_err());
        assert!(registry.declare_exchange(&def).await.is_err());
        assert!(!registry.is_exchange_declared("orders").await);
    }

    #[tokio::test]
    async fn companion_queues_are_declared_first() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = TopologyRegistry::new(broker.clone());

        registry
            .declare_queue(&QueueDefinition::new("payments").durable().with_retry(500))
            .await
            .unwrap();
        registry
            .declare_queue(&QueueDefinition::new("refunds").durable().with_dlq())
            .await
            .unwrap();

        assert!(registry.is_queue_declared("payments-retry").await);
        assert!(registry.is_queue_declared("refunds-dlq").await);
        assert!(broker.has_queue("payments"));
        assert!(matches!(
            registry
                .declare_queue(&QueueDefinition::new("invoices").with_dlq().with_retry(500))
                .await,
            Err(AmqpError::InvalidTopology(_))
        ));
        assert!(!broker.has_queue("invoices-dlq"));
    }

    #[tokio::test]
    async fn well_known_topology_is_installed() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = TopologyRegistry::new(broker.clone());
        let configs = MessagingConfigs::default();

        registry.install_well_known(&configs).await.unwrap();
        registry.install_well_known(&configs).await.unwrap();

        assert!(registry.is_exchange_declared("dlx.exchange").await);
        assert!(registry.is_queue_declared("dlx.queue").await);
        assert!(registry.is_queue_declared("delay.queue").await);
        assert!(registry
            .entries()
            .await
            .iter()
            .any(|entry| matches!(
                entry,
                TopologyEntry::Exchange(def)
                    if def.name() == "delay.exchange"
                        && def.exchange_kind() == ExchangeKind::XMessageDelayed
            )));
    }

    #[tokio::test]
    async fn deleting_forgets_entries_and_bindings() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = TopologyRegistry::new(broker.clone());

        registry
            .plan()
            .exchange(ExchangeDefinition::new("audit").fanout())
            .queue(QueueDefinition::new("audit.q"))
            .queue_binding(QueueBinding::new("audit.q").exchange("audit"))
            .install()
            .await
            .unwrap();

        registry.delete_queue("audit.q").await.unwrap();
        registry.delete_exchange("audit").await.unwrap();

        assert!(!registry.is_queue_declared("audit.q").await);
        assert!(!registry.is_exchange_declared("audit").await);
        assert!(registry.bindings.read().await.is_empty());
        assert!(matches!(
            registry.delete_queue("").await,
            Err(AmqpError::InvalidTopology(_))
        ));
    }

    #[test]
    fn holding_queue_dead_letters_to_the_destination() {
        let configs = MessagingConfigs::default();

        let def =
            delay_holding_queue(&configs, "orders", "orders.created", Duration::from_millis(500))
                .unwrap();
        let args = def.effective_arguments();

        assert_eq!(def.name(), "delay.queue.orders.orders.created.500");
        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&HeaderValue::UInt(500)));
        assert_eq!(args.get(AMQP_HEADERS_EXPIRES), Some(&HeaderValue::UInt(60500)));
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::from("orders"))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("orders.created"))
        );
    }
}
