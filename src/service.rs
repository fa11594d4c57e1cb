// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Service
//!
//! `MessagingService` is the imperative entry point of the crate: plain,
//! header-carrying, asynchronous, delayed, confirmed and batch publishing,
//! polling receive, topology management and the introspection queries used
//! by health checks.
//!
//! Every outgoing envelope gets the default headers of the application, the
//! current trace context and a message id before it reaches the broker.

use crate::{
    broker::{BrokerClient, Confirmation},
    channel::RabbitMQBroker,
    configs::{DelayStrategy, MessagingConfigs},
    envelope::{Envelope, Headers, HEADER_DELAY, HEADER_SOURCE_SERVICE},
    errors::{AmqpError, BatchPublishError},
    exchange::ExchangeDefinition,
    otel,
    queue::{QueueBinding, QueueDefinition},
    topology::TopologyRegistry,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, warn};

/// Upper bound of the wait between two polls of `receive`.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A publish running off the calling task.
///
/// Awaiting yields the publish result. Cancelling or dropping it does not
/// take back a message the broker already accepted.
#[derive(Debug)]
pub struct PendingPublish {
    handle: JoinHandle<Result<(), AmqpError>>,
}

impl PendingPublish {
    pub(crate) fn spawn<F>(publish: F) -> PendingPublish
    where
        F: Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        PendingPublish {
            handle: tokio::spawn(publish),
        }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for PendingPublish {
    type Output = Result<(), AmqpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(err)) if err.is_cancelled() => Poll::Ready(Err(
                AmqpError::PublishError("publish cancelled".to_owned()),
            )),
            Poll::Ready(Err(err)) => Poll::Ready(Err(AmqpError::InternalError(err.to_string()))),
        }
    }
}

pub struct MessagingService {
    broker: Arc<dyn BrokerClient>,
    configs: MessagingConfigs,
    topology: TopologyRegistry,
}

impl MessagingService {
    pub fn new(broker: Arc<dyn BrokerClient>, configs: MessagingConfigs) -> Arc<MessagingService> {
        Arc::new(MessagingService {
            topology: TopologyRegistry::new(broker.clone()),
            broker,
            configs,
        })
    }

    /// Connects to RabbitMQ and declares the dead letter and delay topology.
    pub async fn connect(configs: MessagingConfigs) -> Result<Arc<MessagingService>, AmqpError> {
        configs.validate()?;

        let broker = RabbitMQBroker::connect(&configs).await?;
        let service = MessagingService::new(broker, configs);
        service.install_well_known().await?;

        Ok(service)
    }

    pub async fn install_well_known(&self) -> Result<(), AmqpError> {
        self.topology.install_well_known(&self.configs).await
    }

    pub fn configs(&self) -> &MessagingConfigs {
        &self.configs
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.broker
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    /// Serializes `message` into an envelope carrying `headers`.
    pub fn envelope<T: Serialize + ?Sized>(
        &self,
        message: &T,
        headers: Option<&Headers>,
    ) -> Result<Envelope, AmqpError> {
        let envelope = Envelope::json(message)?;
        Ok(match headers {
            Some(headers) => envelope.headers(headers),
            None => envelope,
        })
    }

    fn prepare(&self, envelope: Envelope) -> Envelope {
        let mut defaults = Headers::new();
        defaults.insert(
            HEADER_SOURCE_SERVICE.to_owned(),
            self.configs.app.name.as_str().into(),
        );

        let mut envelope = envelope.default_headers(&defaults).seal();
        otel::inject_context(&Context::current(), &mut envelope.headers);
        envelope
    }

    pub async fn send<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), AmqpError> {
        let envelope = self.envelope(message, None)?;
        self.publish_envelope(exchange, routing_key, envelope).await
    }

    /// Publishes with `headers` merged over the default ones.
    pub async fn send_with_headers<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        headers: &Headers,
    ) -> Result<(), AmqpError> {
        let envelope = self.envelope(message, Some(headers))?;
        self.publish_envelope(exchange, routing_key, envelope).await
    }

    pub async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        let envelope = self.prepare(envelope);

        match self.broker.publish(exchange, routing_key, &envelope).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(err)
            }
            _ => {
                debug!(
                    message_id = envelope.message_id,
                    exchange, routing_key, "message published"
                );
                Ok(())
            }
        }
    }

    /// Publishes on a spawned task.
    pub fn send_async<T: Serialize + ?Sized>(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> PendingPublish {
        let envelope = self.envelope(message, None);
        let service = self.clone();
        let exchange = exchange.to_owned();
        let routing_key = routing_key.to_owned();

        PendingPublish::spawn(async move {
            service
                .publish_envelope(&exchange, &routing_key, envelope?)
                .await
        })
    }

    pub fn publish_envelope_async(
        self: &Arc<Self>,
        exchange: String,
        routing_key: String,
        envelope: Envelope,
    ) -> PendingPublish {
        let service = self.clone();

        PendingPublish::spawn(async move {
            service
                .publish_envelope(&exchange, &routing_key, envelope)
                .await
        })
    }

    /// Publishes so that consumers see the message no earlier than `delay`,
    /// the configured default delay when `None`.
    pub async fn send_delayed<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        delay: Option<Duration>,
        headers: Option<&Headers>,
    ) -> Result<(), AmqpError> {
        let envelope = self.envelope(message, headers)?;
        self.publish_delayed(exchange, routing_key, envelope, delay)
            .await
    }

    /// With the plugin strategy only exchanges declared as
    /// `x-delayed-message` get the `x-delay` header. Any other destination
    /// is reached through a TTL holding queue.
    pub async fn publish_delayed(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        delay: Option<Duration>,
    ) -> Result<(), AmqpError> {
        let delay = delay.unwrap_or_else(|| self.configs.delay.default_delay());
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        if delay > self.configs.delay.max_delay() {
            warn!(delay_ms = millis, exchange, "delay above the allowed maximum");
            return Err(AmqpError::InvalidDelay(millis));
        }

        if delay.is_zero() {
            return self.publish_envelope(exchange, routing_key, envelope).await;
        }

        let plugin = match self.configs.delay.strategy {
            DelayStrategy::Plugin => self.topology.is_delayed_exchange(exchange).await,
            DelayStrategy::TtlQueue => false,
        };

        if plugin {
            let millis = i64::try_from(millis).map_err(|_| AmqpError::InvalidDelay(millis))?;
            return self
                .publish_envelope(exchange, routing_key, envelope.header(HEADER_DELAY, millis))
                .await;
        }

        if self.configs.delay.strategy == DelayStrategy::Plugin {
            debug!(
                exchange,
                delay_ms = millis,
                "exchange is not x-delayed-message, delaying through a ttl queue"
            );
        }

        let holding = self
            .topology
            .declare_delay_queue(&self.configs, exchange, routing_key, delay)
            .await?;
        self.publish_envelope("", &holding, envelope).await
    }

    /// Publishes and waits up to `timeout` for the broker confirm.
    pub async fn confirm_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Confirmation, AmqpError> {
        let envelope = self.prepare(envelope);

        let confirmed = tokio::time::timeout(
            timeout,
            self.broker
                .publish_confirmed(exchange, routing_key, &envelope),
        )
        .await;

        match confirmed {
            Err(_) => {
                warn!(
                    message_id = envelope.message_id,
                    exchange,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "publisher confirm timed out"
                );
                Ok(Confirmation::TimedOut)
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(err)
            }
            Ok(Ok(Confirmation::Nacked)) => {
                warn!(
                    message_id = envelope.message_id,
                    exchange, "message nacked by the broker"
                );
                Ok(Confirmation::Nacked)
            }
            Ok(Ok(confirmation)) => Ok(confirmation),
        }
    }

    /// `true` once the broker acked the message, `false` on nack or when
    /// `timeout` elapsed first.
    pub async fn send_and_await_confirm<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        headers: Option<&Headers>,
        timeout: Duration,
    ) -> Result<bool, AmqpError> {
        let envelope = self.envelope(message, headers)?;
        let confirmation = self
            .confirm_envelope(exchange, routing_key, envelope, timeout)
            .await?;

        Ok(confirmation == Confirmation::Acked)
    }

    /// Publishes `messages` in order and stops at the first failure; the
    /// messages before it stay published.
    pub async fn send_batch<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        messages: &[T],
    ) -> Result<usize, BatchPublishError> {
        for (published, message) in messages.iter().enumerate() {
            if let Err(source) = self.send(exchange, routing_key, message).await {
                error!(
                    error = source.to_string(),
                    published,
                    total = messages.len(),
                    "batch publishing aborted"
                );
                return Err(BatchPublishError { published, source });
            }
        }

        Ok(messages.len())
    }

    /// Waits up to `timeout` for a message on `queue` and acknowledges it.
    pub async fn receive(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Envelope>, AmqpError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(delivery) = self.broker.get(queue).await? {
                delivery.ack().await?;
                return Ok(Some(delivery.envelope));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<bool, AmqpError> {
        topology_result(self.topology.declare_exchange(def).await)
    }

    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<bool, AmqpError> {
        topology_result(self.topology.declare_queue(def).await)
    }

    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<bool, AmqpError> {
        topology_result(self.topology.bind(binding).await)
    }

    pub async fn unbind_queue(&self, binding: &QueueBinding) -> Result<bool, AmqpError> {
        topology_result(self.topology.unbind(binding).await)
    }

    pub async fn delete_queue(&self, name: &str) -> Result<bool, AmqpError> {
        topology_result(self.topology.delete_queue(name).await)
    }

    pub async fn delete_exchange(&self, name: &str) -> Result<bool, AmqpError> {
        topology_result(self.topology.delete_exchange(name).await)
    }

    pub fn is_connection_open(&self) -> bool {
        self.broker.is_connected()
    }

    pub async fn queue_message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.broker.queue_message_count(queue).await
    }

    pub async fn queue_consumer_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.broker.queue_consumer_count(queue).await
    }

    pub fn connection_info(&self) -> String {
        self.broker.connection_info()
    }
}

/// Broker failures become `Ok(false)`; malformed topology stays an error.
fn topology_result(result: Result<(), AmqpError>) -> Result<bool, AmqpError> {
    match result {
        Ok(()) => Ok(true),
        Err(err @ AmqpError::InvalidTopology(_)) => Err(err),
        Err(err) => {
            warn!(error = err.to_string(), "topology operation failed");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerClient,
        envelope::{HeaderValue, HEADER_TENANT_ID},
        memory::{ConfirmMode, InMemoryBroker},
        topology::Topology,
    };
    use serde_json::json;

    async fn setup(configs: MessagingConfigs) -> (InMemoryBroker, Arc<MessagingService>) {
        let broker = InMemoryBroker::new();
        let service = MessagingService::new(Arc::new(broker.clone()), configs);
        service.install_well_known().await.unwrap();

        service
            .topology()
            .plan()
            .exchange(ExchangeDefinition::new("orders").durable().direct())
            .queue(QueueDefinition::new("orders.q").durable())
            .queue_binding(
                QueueBinding::new("orders.q")
                    .exchange("orders")
                    .routing_key("orders.created"),
            )
            .install()
            .await
            .unwrap();

        (broker, service)
    }

    #[tokio::test]
    async fn send_stamps_defaults_and_caller_headers_win() {
        let (broker, service) = setup(MessagingConfigs::default()).await;

        service
            .send("orders", "orders.created", &json!({ "orderId": "A1" }))
            .await
            .unwrap();

        let mut headers = Headers::new();
        headers.insert(HEADER_SOURCE_SERVICE.to_owned(), "billing".into());
        headers.insert(HEADER_TENANT_ID.to_owned(), "t-1".into());
        service
            .send_with_headers("orders", "orders.created", &json!({ "orderId": "A2" }), &headers)
            .await
            .unwrap();

        let stored = broker.messages("orders.q");
        assert_eq!(stored.len(), 2);
        assert!(!stored[0].message_id.is_empty());
        assert_eq!(
            stored[0].get_header(HEADER_SOURCE_SERVICE),
            Some(&HeaderValue::from(service.configs().app.name.as_str()))
        );
        assert_eq!(
            stored[1].get_header(HEADER_SOURCE_SERVICE),
            Some(&HeaderValue::from("billing"))
        );
        assert_eq!(
            stored[1].get_header(HEADER_TENANT_ID),
            Some(&HeaderValue::from("t-1"))
        );
    }

    #[tokio::test]
    async fn send_fails_when_the_broker_is_unreachable() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        broker.set_reachable(false);

        let result = service.send("orders", "orders.created", &json!({})).await;

        assert!(matches!(result, Err(AmqpError::PublishError(_))));
        assert!(!service.is_connection_open());
    }

    #[tokio::test]
    async fn confirmed_order_is_retrievable() {
        let (_broker, service) = setup(MessagingConfigs::default()).await;

        let acked = service
            .send_and_await_confirm(
                "orders",
                "orders.created",
                &json!({ "orderId": "A1" }),
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(acked);

        let received = service
            .receive("orders.q", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(!received.message_id.is_empty());
        assert_eq!(received.decode::<serde_json::Value>().unwrap()["orderId"], "A1");
        assert_eq!(service.queue_message_count("orders.q").await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_confirm_resolves_to_false_after_the_timeout() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        broker.set_confirm_mode(ConfirmMode::Never);

        let started = Instant::now();
        let acked = service
            .send_and_await_confirm(
                "orders",
                "orders.created",
                &json!({}),
                None,
                Duration::from_millis(200),
            )
            .await
            .unwrap();

        assert!(!acked);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(300));

        broker.set_confirm_mode(ConfirmMode::Nack);
        let acked = service
            .send_and_await_confirm("orders", "orders.created", &json!({}), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!acked);
    }

    #[tokio::test]
    async fn batch_stops_at_the_first_failure() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        broker.fail_publish_after(2);

        let orders = [json!({ "n": 1 }), json!({ "n": 2 }), json!({ "n": 3 }), json!({ "n": 4 })];
        let err = service
            .send_batch("orders", "orders.created", &orders)
            .await
            .unwrap_err();

        assert_eq!(err.published, 2);
        assert!(matches!(err.source, AmqpError::PublishError(_)));
        assert_eq!(broker.messages("orders.q").len(), 2);
    }

    #[tokio::test]
    async fn async_send_resolves_through_the_future() {
        let (broker, service) = setup(MessagingConfigs::default()).await;

        service
            .send_async("orders", "orders.created", &json!({ "orderId": "A3" }))
            .await
            .unwrap();
        assert_eq!(broker.messages("orders.q").len(), 1);

        broker.set_reachable(false);
        let pending = service.send_async("orders", "orders.created", &json!({}));
        assert!(matches!(pending.await, Err(AmqpError::PublishError(_))));
    }

    #[tokio::test]
    async fn cancelling_or_dropping_does_not_take_back_a_publish() {
        let (broker, service) = setup(MessagingConfigs::default()).await;

        let pending = service.send_async("orders", "orders.created", &json!({ "orderId": "A4" }));
        while !pending.is_finished() {
            tokio::task::yield_now().await;
        }
        pending.cancel();
        assert_eq!(pending.await, Ok(()));
        assert_eq!(broker.messages("orders.q").len(), 1);

        drop(service.send_async("orders", "orders.created", &json!({ "orderId": "A5" })));
        for _ in 0..100 {
            if broker.messages("orders.q").len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.messages("orders.q").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_delay_hides_the_message_until_due() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        service
            .topology()
            .plan()
            .exchange(ExchangeDefinition::new("reminders").durable().direct_delayed())
            .queue(QueueDefinition::new("reminders.q").durable())
            .queue_binding(
                QueueBinding::new("reminders.q")
                    .exchange("reminders")
                    .routing_key("remind"),
            )
            .install()
            .await
            .unwrap();

        service
            .send_delayed(
                "reminders",
                "remind",
                &json!({ "orderId": "A1" }),
                Some(Duration::from_millis(500)),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(broker.messages("reminders.q").is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(broker.messages("reminders.q").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_delay_on_a_plain_exchange_is_still_held_back() {
        let (broker, service) = setup(MessagingConfigs::default()).await;

        service
            .send_delayed(
                "orders",
                "orders.created",
                &json!({ "orderId": "A1" }),
                Some(Duration::from_millis(500)),
                None,
            )
            .await
            .unwrap();

        assert!(broker.messages("orders.q").is_empty());
        assert!(service
            .topology()
            .is_queue_declared("delay.queue.orders.orders.created.500")
            .await);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(broker.messages("orders.q").is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let delivered = broker.messages("orders.q");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].get_header(HEADER_DELAY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_queue_delay_dead_letters_to_the_destination() {
        let mut configs = MessagingConfigs::default();
        configs.delay.strategy = DelayStrategy::TtlQueue;
        let (broker, service) = setup(configs).await;

        service
            .send_delayed(
                "orders",
                "orders.created",
                &json!({ "orderId": "A1" }),
                Some(Duration::from_millis(500)),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(broker.messages("orders.q").is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(broker.messages("orders.q").len(), 1);
    }

    #[tokio::test]
    async fn delays_above_the_maximum_are_rejected() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        let before = broker.publish_count();

        let result = service
            .send_delayed(
                "orders",
                "orders.created",
                &json!({}),
                Some(Duration::from_secs(25 * 60 * 60)),
                None,
            )
            .await;

        assert_eq!(result, Err(AmqpError::InvalidDelay(25 * 60 * 60 * 1000)));
        assert_eq!(broker.publish_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_returns_none_after_the_timeout() {
        let (_broker, service) = setup(MessagingConfigs::default()).await;

        let started = Instant::now();
        let received = service
            .receive("orders.q", Duration::from_millis(120))
            .await
            .unwrap();

        assert_eq!(received, None);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn topology_failures_are_reported_as_false() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_declare_queue()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));

        let service = MessagingService::new(Arc::new(broker), MessagingConfigs::default());

        assert_eq!(
            service.declare_queue(&QueueDefinition::new("orders.q")).await,
            Ok(false)
        );
        assert!(matches!(
            service.declare_queue(&QueueDefinition::new("")).await,
            Err(AmqpError::InvalidTopology(_))
        ));
        assert!(!service.topology().is_queue_declared("orders.q").await);
    }
}
