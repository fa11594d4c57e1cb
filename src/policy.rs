// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Policy Descriptors
//!
//! A `ProducerPolicy` describes how a call publishes: where to, with which
//! delivery attributes, whether to wait for a confirm, when to skip and what
//! to do when publishing keeps failing. A `ConsumerPolicy` describes how a
//! handler consumes a queue: binding, concurrency, acknowledgement, retries
//! and the final disposition of messages it cannot process.
//!
//! Exchanges, routing keys and dispatch conditions that depend on the call
//! are plain closures over a caller-chosen context type.

use crate::{
    configs::{ConsumerConfigs, MessagingConfigs, RetryConfigs},
    consumer::ConsumerMessage,
    envelope::{DeliveryMode, HeaderValue, Headers},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    retry::BackoffPolicy,
};
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};

/// Default time to wait for a publisher confirm
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait between producer retries
pub const DEFAULT_PRODUCER_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Acknowledgement mode of a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Settled by the engine once the handler completes.
    #[default]
    Auto,
    /// The handler may settle through `ConsumerMessage::ack`; the engine
    /// settles whatever is left once the handler completes.
    Manual,
    /// The broker considers deliveries acknowledged as soon as they are sent.
    None,
}

/// Predicate deciding whether a call or a message is dispatched.
pub type Condition<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// An exchange or routing key, fixed or derived from the call context.
pub enum Target<C> {
    Fixed(String),
    Resolve(Arc<dyn Fn(&C) -> String + Send + Sync>),
}

impl<C> Target<C> {
    pub fn resolver<F>(f: F) -> Target<C>
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        Target::Resolve(Arc::new(f))
    }

    pub fn resolve(&self, ctx: &C) -> String {
        match self {
            Target::Fixed(value) => value.clone(),
            Target::Resolve(f) => f(ctx),
        }
    }
}

impl<C> Clone for Target<C> {
    fn clone(&self) -> Self {
        match self {
            Target::Fixed(value) => Target::Fixed(value.clone()),
            Target::Resolve(f) => Target::Resolve(f.clone()),
        }
    }
}

impl<C> fmt::Debug for Target<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Target::Resolve(_) => f.write_str("Resolve(..)"),
        }
    }
}

impl<C> From<&str> for Target<C> {
    fn from(value: &str) -> Self {
        Target::Fixed(value.to_owned())
    }
}

impl<C> From<String> for Target<C> {
    fn from(value: String) -> Self {
        Target::Fixed(value)
    }
}

/// What a producer does once its retries are exhausted.
#[derive(Clone, Default)]
pub enum ProducerFailureStrategy {
    /// Propagate the error to the caller.
    #[default]
    Raise,
    /// Log the error and report success.
    LogAndIgnore,
    /// Republish the envelope, tagged with the error, to the dead letter
    /// exchange.
    SendToDeadLetter,
    Custom(Arc<dyn Fn(&crate::envelope::Envelope, &AmqpError) -> Result<(), AmqpError> + Send + Sync>),
}

impl fmt::Debug for ProducerFailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerFailureStrategy::Raise => f.write_str("Raise"),
            ProducerFailureStrategy::LogAndIgnore => f.write_str("LogAndIgnore"),
            ProducerFailureStrategy::SendToDeadLetter => f.write_str("SendToDeadLetter"),
            ProducerFailureStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Terminal action applied to a message its handler could not process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Republish to the dead letter destination, then ack.
    DeadLetter,
    /// Ack without republishing.
    Discard,
    /// Nack and let the broker redeliver.
    Requeue,
    /// Nack without requeue; the queue's own dead-letter exchange, if any,
    /// takes over.
    Reject,
}

/// What a consumer does once a handler keeps failing.
#[derive(Clone, Default)]
pub enum ConsumerFailureStrategy {
    #[default]
    RetryThenDeadLetter,
    DeadLetterImmediately,
    Discard,
    Requeue,
    Custom(Arc<dyn Fn(&ConsumerMessage, &AmqpError) -> Disposition + Send + Sync>),
}

impl ConsumerFailureStrategy {
    /// Whether local retries run before the disposition.
    pub fn retries(&self) -> bool {
        !matches!(self, ConsumerFailureStrategy::DeadLetterImmediately)
    }
}

impl fmt::Debug for ConsumerFailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerFailureStrategy::RetryThenDeadLetter => f.write_str("RetryThenDeadLetter"),
            ConsumerFailureStrategy::DeadLetterImmediately => {
                f.write_str("DeadLetterImmediately")
            }
            ConsumerFailureStrategy::Discard => f.write_str("Discard"),
            ConsumerFailureStrategy::Requeue => f.write_str("Requeue"),
            ConsumerFailureStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Declarative description of a publishing call-site.
pub struct ProducerPolicy<C> {
    pub(crate) exchange: Target<C>,
    pub(crate) routing_key: Target<C>,
    pub(crate) message_type: Option<String>,
    pub(crate) delivery_mode: DeliveryMode,
    pub(crate) ttl: Option<Duration>,
    pub(crate) priority: Option<u8>,
    pub(crate) wait_for_confirm: bool,
    pub(crate) confirm_timeout: Duration,
    pub(crate) condition: Option<Condition<C>>,
    pub(crate) headers: Headers,
    pub(crate) is_async: bool,
    pub(crate) retry_count: u32,
    pub(crate) retry_interval: Duration,
    pub(crate) on_failure: ProducerFailureStrategy,
}

impl<C> ProducerPolicy<C> {
    pub fn new(exchange: impl Into<Target<C>>, routing_key: impl Into<Target<C>>) -> Self {
        ProducerPolicy {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message_type: None,
            delivery_mode: DeliveryMode::Persistent,
            ttl: None,
            priority: None,
            wait_for_confirm: false,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            condition: None,
            headers: Headers::default(),
            is_async: false,
            retry_count: 0,
            retry_interval: DEFAULT_PRODUCER_RETRY_INTERVAL,
            on_failure: ProducerFailureStrategy::Raise,
        }
    }

    /// Resolves the exchange from the call context.
    pub fn exchange_from<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.exchange = Target::resolver(f);
        self
    }

    /// Resolves the routing key from the call context.
    pub fn routing_key_from<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.routing_key = Target::resolver(f);
        self
    }

    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn transient(mut self) -> Self {
        self.delivery_mode = DeliveryMode::Transient;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Waits up to `timeout` for the broker confirm.
    pub fn wait_for_confirm(mut self, timeout: Duration) -> Self {
        self.wait_for_confirm = true;
        self.confirm_timeout = timeout;
        self
    }

    /// Publishes only when `condition` holds for the call context.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Publishes off the calling task.
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn retry(mut self, count: u32, interval: Duration) -> Self {
        self.retry_count = count;
        self.retry_interval = interval;
        self
    }

    pub fn on_failure(mut self, strategy: ProducerFailureStrategy) -> Self {
        self.on_failure = strategy;
        self
    }

    pub(crate) fn should_dispatch(&self, ctx: &C) -> bool {
        self.condition.as_ref().map_or(true, |condition| condition(ctx))
    }
}

impl<C> Clone for ProducerPolicy<C> {
    fn clone(&self) -> Self {
        ProducerPolicy {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            message_type: self.message_type.clone(),
            delivery_mode: self.delivery_mode,
            ttl: self.ttl,
            priority: self.priority,
            wait_for_confirm: self.wait_for_confirm,
            confirm_timeout: self.confirm_timeout,
            condition: self.condition.clone(),
            headers: self.headers.clone(),
            is_async: self.is_async,
            retry_count: self.retry_count,
            retry_interval: self.retry_interval,
            on_failure: self.on_failure.clone(),
        }
    }
}

/// Declarative description of a consuming handler.
#[derive(Clone)]
pub struct ConsumerPolicy {
    pub(crate) queue: String,
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: Option<String>,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) concurrency: Option<(usize, usize)>,
    pub(crate) prefetch: Option<u16>,
    pub(crate) ack_mode: Option<AckMode>,
    pub(crate) message_type: Option<String>,
    pub(crate) condition: Option<Condition<ConsumerMessage>>,
    pub(crate) retry_count: Option<u32>,
    pub(crate) retry_interval: Option<Duration>,
    pub(crate) on_failure: ConsumerFailureStrategy,
    pub(crate) enable_dead_letter: bool,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) arguments: Headers,
}

impl ConsumerPolicy {
    /// Policy for `queue`. Concurrency, prefetch, ack mode and retry budget
    /// left unset come from the service configuration when the consumer is
    /// registered.
    pub fn new(queue: &str) -> ConsumerPolicy {
        ConsumerPolicy {
            queue: queue.to_owned(),
            exchange: None,
            routing_key: None,
            exchange_kind: ExchangeKind::Direct,
            durable: true,
            exclusive: false,
            auto_delete: false,
            concurrency: None,
            prefetch: None,
            ack_mode: None,
            message_type: None,
            condition: None,
            retry_count: None,
            retry_interval: None,
            on_failure: ConsumerFailureStrategy::RetryThenDeadLetter,
            enable_dead_letter: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            arguments: Headers::default(),
        }
    }

    /// Policy for `queue` with every unset value taken from `configs` up
    /// front.
    pub fn from_configs(queue: &str, configs: &MessagingConfigs) -> ConsumerPolicy {
        ConsumerPolicy::new(queue).resolve(configs)
    }

    /// Fills the values the caller left unset from `configs`.
    pub fn resolve(mut self, configs: &MessagingConfigs) -> ConsumerPolicy {
        self.concurrency.get_or_insert((
            configs.consumer.concurrency,
            configs.consumer.max_concurrency,
        ));
        self.prefetch.get_or_insert(configs.consumer.prefetch);
        self.ack_mode.get_or_insert(configs.consumer.ack_mode);
        self.retry_count.get_or_insert(configs.retry.retry_count());
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn min_concurrency(&self) -> usize {
        self.concurrency_range().0
    }

    pub fn max_concurrency(&self) -> usize {
        self.concurrency_range().1
    }

    pub fn ack_mode_value(&self) -> AckMode {
        self.ack_mode.unwrap_or_default()
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
            .unwrap_or_else(|| ConsumerConfigs::default().prefetch)
    }

    /// In-place retries after the first attempt.
    pub fn retry_budget(&self) -> u32 {
        self.retry_count
            .unwrap_or_else(|| RetryConfigs::default().retry_count())
    }

    fn concurrency_range(&self) -> (usize, usize) {
        self.concurrency.unwrap_or_else(|| {
            let defaults = ConsumerConfigs::default();
            (defaults.concurrency, defaults.max_concurrency)
        })
    }

    /// Binds the queue to `exchange` with `routing_key` (the queue name when
    /// `None`), declaring both if needed.
    pub fn bind(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.exchange = Some(exchange.to_owned());
        self.routing_key = routing_key.map(str::to_owned);
        self
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn non_durable(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn concurrency(mut self, min: usize, max: usize) -> Self {
        self.concurrency = Some((min, max));
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = Some(mode);
        self
    }

    /// Handles only messages whose type tag equals `kind`; others are
    /// acknowledged and dropped.
    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    /// Invokes the handler only when `condition` holds for the message.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ConsumerMessage) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// `count` in-place retries, starting `interval` apart.
    pub fn retry(mut self, count: u32, interval: Duration) -> Self {
        self.retry_count = Some(count);
        self.retry_interval = Some(interval);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn on_failure(mut self, strategy: ConsumerFailureStrategy) -> Self {
        self.on_failure = strategy;
        self
    }

    /// Dead-letters to `exchange`/`routing_key` instead of the default
    /// dead letter destination. The exchange must be declared before the
    /// consumer starts.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.enable_dead_letter = true;
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.enable_dead_letter = false;
        self
    }

    /// Extra `queue.declare` argument.
    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.queue.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "consumer queue must not be empty".to_owned(),
            ));
        }
        let (min, max) = self.concurrency_range();
        if min == 0 || min > max {
            return Err(AmqpError::ConfigurationError(format!(
                "consumer `{}` concurrency range {}..={} is invalid",
                self.queue, min, max
            )));
        }
        if self.prefetch_count() == 0 {
            return Err(AmqpError::ConfigurationError(format!(
                "consumer `{}` prefetch must be at least 1",
                self.queue
            )));
        }
        if self.exclusive && max > 1 {
            return Err(AmqpError::ConfigurationError(format!(
                "exclusive consumer `{}` cannot run more than one worker",
                self.queue
            )));
        }
        Ok(())
    }

    pub(crate) fn queue_definition(&self) -> QueueDefinition {
        let mut def = QueueDefinition::new(&self.queue).arguments(self.arguments.clone());
        def.durable = self.durable;
        def.exclusive = self.exclusive;
        def.delete = self.auto_delete;
        def
    }

    pub(crate) fn exchange_definition(&self) -> Option<ExchangeDefinition> {
        let name = self.exchange.as_ref()?;
        let mut def = ExchangeDefinition::new(name).kind(self.exchange_kind);
        def.durable = self.durable;
        Some(def)
    }

    pub(crate) fn binding(&self) -> Option<QueueBinding> {
        let exchange = self.exchange.as_ref()?;
        let routing_key = self.routing_key.as_deref().unwrap_or(&self.queue);
        Some(
            QueueBinding::new(&self.queue)
                .exchange(exchange)
                .routing_key(routing_key),
        )
    }

    /// Dead letter exchange and routing key, falling back to the configured
    /// defaults. `None` when dead-lettering is disabled.
    pub(crate) fn dead_letter_target(&self, configs: &MessagingConfigs) -> Option<(String, String)> {
        if !self.enable_dead_letter {
            return None;
        }
        Some((
            self.dead_letter_exchange
                .clone()
                .unwrap_or_else(|| configs.dead_letter.exchange.clone()),
            self.dead_letter_routing_key
                .clone()
                .unwrap_or_else(|| configs.dead_letter.routing_key.clone()),
        ))
    }

    pub(crate) fn backoff(&self, base: &BackoffPolicy) -> BackoffPolicy {
        match self.retry_interval {
            Some(interval) => base.clone().with_initial(interval),
            None => base.clone(),
        }
    }
}

impl fmt::Debug for ConsumerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerPolicy")
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("concurrency", &self.concurrency)
            .field("prefetch", &self.prefetch)
            .field("ack_mode", &self.ack_mode)
            .field("retry_count", &self.retry_count)
            .field("on_failure", &self.on_failure)
            .field("enable_dead_letter", &self.enable_dead_letter)
            .finish_non_exhaustive()
    }
}
