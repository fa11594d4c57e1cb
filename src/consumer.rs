// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module implements the per-delivery consumption logic. A delivery is
//! filtered by type and condition and then handed to the handler. A failing
//! handler is retried in place with backoff. Once retries are exhausted the
//! consumer policy picks the final disposition: dead letter, discard,
//! requeue, reject or a custom choice.
//!
//! No delivery is acknowledged before its handler completed or a terminal
//! disposition was applied, and every delivery is settled at most once.

use crate::{
    broker::{Confirmation, Delivery, Settlement},
    envelope::{
        Envelope, HEADER_EXCEPTION_MESSAGE, HEADER_EXCEPTION_TYPE, HEADER_FAILED_AT,
        HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_QUEUE, HEADER_ORIGINAL_ROUTING_KEY,
        HEADER_RETRY_COUNT,
    },
    errors::AmqpError,
    otel,
    policy::{
        AckMode, ConsumerFailureStrategy, ConsumerPolicy, Disposition, DEFAULT_CONFIRM_TIMEOUT,
    },
    retry::{BackoffPolicy, RetryState},
    service::MessagingService,
};
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, error::Error, future::Future, sync::Arc};
use tracing::{debug, error, warn};

/// Error type returned by handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Application code invoked for every message of a consumer.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a `ConsumerHandler`.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.0)(msg.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A message as seen by a handler.
#[derive(Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub envelope: Envelope,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// 1-based attempt number of the current handler invocation.
    pub attempt: u32,
    settlement: Settlement,
    ack_mode: AckMode,
}

impl ConsumerMessage {
    pub fn msg_type(&self) -> Option<&str> {
        self.envelope.message_type.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        self.envelope.decode()
    }

    /// Acknowledges the message from a handler running in manual ack mode.
    /// Returns `Ok(false)` in the other modes or when already settled.
    pub async fn ack(&self) -> Result<bool, AmqpError> {
        if self.ack_mode != AckMode::Manual {
            return Ok(false);
        }
        self.settlement.ack().await
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.is_settled()
    }
}

/// How a delivery left the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Acknowledged { attempts: u32 },
    /// Dropped by the type filter or the condition.
    Filtered,
    DeadLettered { attempts: u32 },
    Discarded { attempts: u32 },
    Requeued { attempts: u32 },
    Rejected { attempts: u32 },
    /// The dead letter destination was unreachable; the delivery went back
    /// to its queue.
    DeadLetterFailed { attempts: u32 },
}

/// Runs deliveries of one consumer policy through its handler.
pub struct ConsumerEngine {
    service: Arc<MessagingService>,
    policy: ConsumerPolicy,
    backoff: BackoffPolicy,
    handler: Arc<dyn ConsumerHandler>,
    dead_letter: Option<(String, String)>,
}

impl ConsumerEngine {
    pub fn new(
        service: Arc<MessagingService>,
        policy: ConsumerPolicy,
        handler: Arc<dyn ConsumerHandler>,
    ) -> ConsumerEngine {
        let policy = policy.resolve(service.configs());
        let backoff = policy.backoff(&service.configs().retry.backoff());
        let dead_letter = policy.dead_letter_target(service.configs());

        ConsumerEngine {
            service,
            policy,
            backoff,
            handler,
            dead_letter,
        }
    }

    pub fn policy(&self) -> &ConsumerPolicy {
        &self.policy
    }

    pub(crate) fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter.as_ref().map(|(exchange, _)| exchange.as_str())
    }

    /// Drives one delivery to a terminal state.
    pub async fn process_delivery(&self, delivery: Delivery) -> ConsumeOutcome {
        let settlement = delivery.settlement();
        let Delivery {
            envelope,
            exchange,
            routing_key,
            redelivered,
            ..
        } = delivery;

        let msg_type = envelope.message_type.clone().unwrap_or_default();
        let span_name = if msg_type.is_empty() {
            self.policy.queue.clone()
        } else {
            msg_type.clone()
        };

        let tracer = global::tracer("amqp consumer");
        let (parent, span) = otel::new_span(&envelope.headers, &tracer, &span_name);
        let ctx = parent.with_span(span);

        debug!(
            "received: {} - exchange: {} - queue: {}",
            msg_type, exchange, self.policy.queue
        );

        let mut msg = ConsumerMessage {
            queue: self.policy.queue.clone(),
            envelope,
            exchange,
            routing_key,
            redelivered,
            attempt: 0,
            settlement,
            ack_mode: self.policy.ack_mode_value(),
        };

        if !self.accepts(&msg) {
            debug!(
                queue = self.policy.queue,
                "removing message from queue - reason: filtered"
            );
            self.ack(&ctx, &msg).await;
            return ConsumeOutcome::Filtered;
        }

        let retries = if self.policy.on_failure.retries() {
            self.policy.retry_budget()
        } else {
            0
        };
        let mut retry = RetryState::new(self.backoff.clone());

        let failure = loop {
            msg.attempt = retry.attempts() + 1;

            match self.handler.exec(&ctx, &msg).await {
                Ok(()) => {
                    debug!("message successfully processed");
                    self.ack(&ctx, &msg).await;
                    ctx.span().set_status(Status::Ok);
                    return ConsumeOutcome::Acknowledged {
                        attempts: msg.attempt,
                    };
                }
                Err(err) => {
                    ctx.span().record_error(&*err);
                    retry.record_failure(err.to_string());
                    warn!(
                        error = err.to_string(),
                        queue = self.policy.queue,
                        attempt = msg.attempt,
                        "error whiling handling msg"
                    );

                    // A manual-ack handler may settle before failing.
                    if msg.is_settled() && msg.ack_mode == AckMode::Manual {
                        return ConsumeOutcome::Acknowledged {
                            attempts: msg.attempt,
                        };
                    }

                    if retry.can_retry(retries) {
                        tokio::time::sleep(retry.next_interval()).await;
                        continue;
                    }

                    break AmqpError::HandlerError {
                        attempts: retry.attempts(),
                        cause: retry.last_error().unwrap_or_default().to_owned(),
                    };
                }
            }
        };

        ctx.span().set_status(Status::Error {
            description: Cow::from(failure.to_string()),
        });

        let disposition = match &self.policy.on_failure {
            ConsumerFailureStrategy::RetryThenDeadLetter
            | ConsumerFailureStrategy::DeadLetterImmediately => Disposition::DeadLetter,
            ConsumerFailureStrategy::Discard => Disposition::Discard,
            ConsumerFailureStrategy::Requeue => Disposition::Requeue,
            ConsumerFailureStrategy::Custom(choose) => choose(&msg, &failure),
        };

        self.dispose(&ctx, &msg, &failure, disposition, retry.attempts())
            .await
    }

    fn accepts(&self, msg: &ConsumerMessage) -> bool {
        if let Some(expected) = &self.policy.message_type {
            if msg.msg_type() != Some(expected.as_str()) {
                return false;
            }
        }

        self.policy
            .condition
            .as_ref()
            .map_or(true, |condition| condition(msg))
    }

    async fn dispose(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage,
        failure: &AmqpError,
        disposition: Disposition,
        attempts: u32,
    ) -> ConsumeOutcome {
        match disposition {
            Disposition::DeadLetter => match &self.dead_letter {
                Some((exchange, routing_key)) => {
                    self.dead_letter(ctx, msg, failure, exchange, routing_key, attempts)
                        .await
                }
                None => {
                    warn!(
                        queue = self.policy.queue,
                        "dead letter disabled, rejecting msg"
                    );
                    self.nack(ctx, msg, false).await;
                    ConsumeOutcome::Rejected { attempts }
                }
            },
            Disposition::Discard => {
                warn!(
                    queue = self.policy.queue,
                    error = failure.to_string(),
                    "discarding msg after handler failure"
                );
                self.ack(ctx, msg).await;
                ConsumeOutcome::Discarded { attempts }
            }
            Disposition::Requeue => {
                if msg.ack_mode == AckMode::None {
                    warn!(
                        queue = self.policy.queue,
                        "msg already acknowledged by the broker, cannot requeue"
                    );
                    return ConsumeOutcome::Discarded { attempts };
                }
                warn!(queue = self.policy.queue, "requeuing msg for latter");
                self.nack(ctx, msg, true).await;
                ConsumeOutcome::Requeued { attempts }
            }
            Disposition::Reject => {
                self.nack(ctx, msg, false).await;
                ConsumeOutcome::Rejected { attempts }
            }
        }
    }

    async fn dead_letter(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage,
        failure: &AmqpError,
        exchange: &str,
        routing_key: &str,
        attempts: u32,
    ) -> ConsumeOutcome {
        let cause = match failure {
            AmqpError::HandlerError { cause, .. } => cause.clone(),
            other => other.to_string(),
        };

        let copy = msg
            .envelope
            .clone()
            .without_ttl()
            .header(HEADER_RETRY_COUNT, attempts)
            .header(HEADER_EXCEPTION_MESSAGE, cause)
            .header(HEADER_EXCEPTION_TYPE, failure.kind())
            .header(HEADER_ORIGINAL_EXCHANGE, msg.exchange.as_str())
            .header(HEADER_ORIGINAL_ROUTING_KEY, msg.routing_key.as_str())
            .header(HEADER_ORIGINAL_QUEUE, msg.queue.as_str())
            .header(HEADER_FAILED_AT, Utc::now().timestamp_millis());

        let routed = self
            .service
            .confirm_envelope(exchange, routing_key, copy, DEFAULT_CONFIRM_TIMEOUT)
            .await;

        match routed {
            Ok(Confirmation::Acked) => {
                error!(
                    queue = self.policy.queue,
                    attempts, "too many attempts, msg sent to dead letter"
                );
                self.ack(ctx, msg).await;
                ConsumeOutcome::DeadLettered { attempts }
            }
            other => {
                let reason = match other {
                    Err(err) => err.to_string(),
                    Ok(confirmation) => format!("{confirmation:?}"),
                };
                let err = AmqpError::DeadLetterRouting(format!("{exchange}: {reason}"));
                error!(
                    error = err.to_string(),
                    queue = self.policy.queue,
                    "FATAL: dead letter destination unreachable, requeuing msg"
                );
                ctx.span().record_error(&err);
                self.nack(ctx, msg, true).await;
                ConsumeOutcome::DeadLetterFailed { attempts }
            }
        }
    }

    async fn ack(&self, ctx: &Context, msg: &ConsumerMessage) {
        if msg.ack_mode == AckMode::None {
            return;
        }

        if let Err(err) = msg.settlement.ack().await {
            error!(error = err.to_string(), "error whiling ack msg");
            ctx.span().record_error(&err);
            ctx.span().set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
        }
    }

    async fn nack(&self, ctx: &Context, msg: &ConsumerMessage, requeue: bool) {
        if msg.ack_mode == AckMode::None {
            return;
        }

        if let Err(err) = msg.settlement.nack(requeue).await {
            error!(error = err.to_string(), requeue, "error whiling nack msg");
            ctx.span().record_error(&err);
            ctx.span().set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{BrokerClient, ConsumeOptions},
        configs::MessagingConfigs,
        envelope::HeaderValue,
        memory::InMemoryBroker,
        queue::QueueDefinition,
    };
    use futures_util::StreamExt;
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    const QUEUE: &str = "orders.q";

    struct FlakyHandler {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyHandler {
        fn failing(failures: u32) -> Arc<FlakyHandler> {
            Arc::new(FlakyHandler {
                calls: AtomicU32::new(0),
                failures,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConsumerHandler for FlakyHandler {
        async fn exec(&self, _ctx: &Context, _msg: &ConsumerMessage) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(format!("boom #{call}").into());
            }
            Ok(())
        }
    }

    async fn setup() -> (InMemoryBroker, Arc<MessagingService>) {
        let broker = InMemoryBroker::new();
        let service = MessagingService::new(Arc::new(broker.clone()), MessagingConfigs::default());
        service.install_well_known().await.unwrap();
        service
            .topology()
            .declare_queue(&QueueDefinition::new(QUEUE).durable())
            .await
            .unwrap();
        (broker, service)
    }

    async fn deliver(broker: &InMemoryBroker, envelope: Envelope) -> Delivery {
        broker.publish("", QUEUE, &envelope).await.unwrap();
        broker.get(QUEUE).await.unwrap().unwrap()
    }

    fn policy() -> ConsumerPolicy {
        ConsumerPolicy::new(QUEUE).retry(2, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retries_with_a_single_ack() {
        let (broker, service) = setup().await;
        let handler = FlakyHandler::failing(2);
        let engine = ConsumerEngine::new(service, policy(), handler.clone());

        let outcome = engine
            .process_delivery(deliver(&broker, Envelope::new(b"{}".to_vec())).await)
            .await;

        assert_eq!(outcome, ConsumeOutcome::Acknowledged { attempts: 3 });
        assert_eq!(handler.calls(), 3);
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert!(broker.messages(QUEUE).is_empty());
        assert!(broker.messages("dlx.queue").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_handler_is_dead_lettered_once() {
        let (broker, service) = setup().await;
        let handler = FlakyHandler::failing(u32::MAX);
        let engine = ConsumerEngine::new(service, policy(), handler.clone());

        let started = tokio::time::Instant::now();
        let outcome = engine
            .process_delivery(
                deliver(&broker, Envelope::new(b"{}".to_vec()).message_id("m-1")).await,
            )
            .await;

        assert_eq!(outcome, ConsumeOutcome::DeadLettered { attempts: 3 });
        assert_eq!(handler.calls(), 3);
        // 100ms then 200ms of backoff between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(300));

        let dead = broker.messages("dlx.queue");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, "m-1");
        assert_eq!(dead[0].retry_count(), 3);
        assert_eq!(
            dead[0].get_header(HEADER_EXCEPTION_MESSAGE),
            Some(&HeaderValue::from("boom #3"))
        );
        assert_eq!(
            dead[0].get_header(HEADER_ORIGINAL_QUEUE),
            Some(&HeaderValue::from(QUEUE))
        );
        assert!(broker.messages(QUEUE).is_empty());
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn dead_letter_immediately_skips_retries() {
        let (broker, service) = setup().await;
        let handler = FlakyHandler::failing(u32::MAX);
        let engine = ConsumerEngine::new(
            service,
            policy().on_failure(ConsumerFailureStrategy::DeadLetterImmediately),
            handler.clone(),
        );

        let outcome = engine
            .process_delivery(deliver(&broker, Envelope::new(vec![])).await)
            .await;

        assert_eq!(outcome, ConsumeOutcome::DeadLettered { attempts: 1 });
        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.messages("dlx.queue").len(), 1);
    }

    #[tokio::test]
    async fn filtered_messages_are_acked_without_calling_the_handler() {
        let (broker, service) = setup().await;
        let handler = FlakyHandler::failing(0);
        let engine = ConsumerEngine::new(
            service,
            ConsumerPolicy::new(QUEUE)
                .message_type("order.created")
                .when(|msg| msg.envelope.get_header("x-tenant-id").is_some()),
            handler.clone(),
        );

        let wrong_type = Envelope::new(vec![]).message_type("order.cancelled");
        let no_tenant = Envelope::new(vec![]).message_type("order.created");

        for envelope in [wrong_type, no_tenant] {
            let outcome = engine.process_delivery(deliver(&broker, envelope).await).await;
            assert_eq!(outcome, ConsumeOutcome::Filtered);
        }

        assert_eq!(handler.calls(), 0);
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert!(broker.messages(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn discard_and_requeue_strategies() {
        let (broker, service) = setup().await;

        let discard = ConsumerEngine::new(
            service.clone(),
            ConsumerPolicy::new(QUEUE)
                .retry_count(0)
                .on_failure(ConsumerFailureStrategy::Discard),
            FlakyHandler::failing(1),
        );
        let outcome = discard
            .process_delivery(deliver(&broker, Envelope::new(vec![])).await)
            .await;
        assert_eq!(outcome, ConsumeOutcome::Discarded { attempts: 1 });
        assert!(broker.messages(QUEUE).is_empty());
        assert!(broker.messages("dlx.queue").is_empty());

        let requeue = ConsumerEngine::new(
            service,
            ConsumerPolicy::new(QUEUE)
                .retry_count(0)
                .on_failure(ConsumerFailureStrategy::Requeue),
            FlakyHandler::failing(1),
        );
        let outcome = requeue
            .process_delivery(deliver(&broker, Envelope::new(vec![])).await)
            .await;
        assert_eq!(outcome, ConsumeOutcome::Requeued { attempts: 1 });

        let redelivered = broker.get(QUEUE).await.unwrap().unwrap();
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn disabled_dead_letter_rejects_to_the_queue_dead_letter_exchange() {
        let (broker, service) = setup().await;
        service
            .topology()
            .declare_queue(&QueueDefinition::new("payments").with_dlq())
            .await
            .unwrap();

        let engine = ConsumerEngine::new(
            service,
            ConsumerPolicy::new("payments")
                .retry_count(0)
                .without_dead_letter(),
            FlakyHandler::failing(1),
        );

        broker
            .publish("", "payments", &Envelope::new(vec![]))
            .await
            .unwrap();
        let delivery = broker.get("payments").await.unwrap().unwrap();

        assert_eq!(
            engine.process_delivery(delivery).await,
            ConsumeOutcome::Rejected { attempts: 1 }
        );
        assert_eq!(broker.messages("payments-dlq").len(), 1);
        assert!(broker.messages("dlx.queue").is_empty());
    }

    #[tokio::test]
    async fn unreachable_dead_letter_exchange_requeues() {
        let (broker, service) = setup().await;
        let engine = ConsumerEngine::new(
            service,
            ConsumerPolicy::new(QUEUE)
                .retry_count(0)
                .dead_letter("missing.dlx", "failed"),
            FlakyHandler::failing(1),
        );

        let outcome = engine
            .process_delivery(deliver(&broker, Envelope::new(vec![])).await)
            .await;

        assert_eq!(outcome, ConsumeOutcome::DeadLetterFailed { attempts: 1 });
        assert_eq!(broker.messages(QUEUE).len(), 1);
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn custom_strategy_chooses_the_disposition() {
        let (broker, service) = setup().await;
        let engine = ConsumerEngine::new(
            service,
            ConsumerPolicy::new(QUEUE).retry_count(0).on_failure(
                ConsumerFailureStrategy::Custom(Arc::new(|msg: &ConsumerMessage, err: &AmqpError| {
                    assert!(matches!(err, AmqpError::HandlerError { attempts: 1, .. }));
                    if msg.redelivered {
                        Disposition::Discard
                    } else {
                        Disposition::Requeue
                    }
                })),
            ),
            FlakyHandler::failing(2),
        );

        let first = engine
            .process_delivery(deliver(&broker, Envelope::new(vec![])).await)
            .await;
        assert_eq!(first, ConsumeOutcome::Requeued { attempts: 1 });

        let again = broker.get(QUEUE).await.unwrap().unwrap();
        assert_eq!(
            engine.process_delivery(again).await,
            ConsumeOutcome::Discarded { attempts: 1 }
        );
        assert!(broker.messages(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn manual_ack_handlers_settle_once() {
        let (broker, service) = setup().await;
        let engine = ConsumerEngine::new(
            service,
            ConsumerPolicy::new(QUEUE).ack_mode(AckMode::Manual),
            handler_fn(|msg: ConsumerMessage| async move {
                let order: serde_json::Value = msg.decode()?;
                assert_eq!(order["orderId"], "A1");
                assert_eq!(msg.ack().await, Ok(true));
                assert_eq!(msg.ack().await, Ok(false));
                Ok::<(), HandlerError>(())
            }),
        );

        let envelope = Envelope::json(&serde_json::json!({ "orderId": "A1" })).unwrap();
        let outcome = engine.process_delivery(deliver(&broker, envelope).await).await;

        assert_eq!(outcome, ConsumeOutcome::Acknowledged { attempts: 1 });
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_copy_drops_the_message_expiration() {
        let (broker, service) = setup().await;
        let engine = ConsumerEngine::new(
            service,
            ConsumerPolicy::new(QUEUE).retry_count(0),
            FlakyHandler::failing(u32::MAX),
        );

        let envelope = Envelope::new(b"{}".to_vec()).ttl(Duration::from_secs(30));
        let outcome = engine.process_delivery(deliver(&broker, envelope).await).await;
        assert_eq!(outcome, ConsumeOutcome::DeadLettered { attempts: 1 });

        let dead = broker.messages("dlx.queue");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].ttl, None);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(broker.messages("dlx.queue").len(), 1);
    }

    #[tokio::test]
    async fn requeue_without_acknowledgements_loses_the_message() {
        let (broker, service) = setup().await;
        let handler = FlakyHandler::failing(1);
        let engine = ConsumerEngine::new(
            service,
            ConsumerPolicy::new(QUEUE)
                .ack_mode(AckMode::None)
                .retry_count(0)
                .on_failure(ConsumerFailureStrategy::Requeue),
            handler.clone(),
        );

        broker.publish("", QUEUE, &Envelope::new(vec![])).await.unwrap();
        let mut deliveries = broker
            .consume(
                QUEUE,
                "auto-ack",
                ConsumeOptions {
                    prefetch: 1,
                    no_ack: true,
                    exclusive: false,
                },
            )
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = engine.process_delivery(delivery).await;

        assert_eq!(outcome, ConsumeOutcome::Discarded { attempts: 1 });
        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert!(broker.messages(QUEUE).is_empty());
        assert!(broker.messages("dlx.queue").is_empty());
    }

    #[tokio::test]
    async fn unset_policy_values_come_from_the_service_configuration() {
        let broker = InMemoryBroker::new();
        let mut configs = MessagingConfigs::default();
        configs.retry.max_attempts = 1;
        configs.consumer.ack_mode = AckMode::Manual;
        configs.consumer.prefetch = 3;
        let service = MessagingService::new(Arc::new(broker.clone()), configs);

        let engine = ConsumerEngine::new(service, ConsumerPolicy::new(QUEUE), FlakyHandler::failing(0));

        assert_eq!(engine.policy().retry_budget(), 0);
        assert_eq!(engine.policy().ack_mode_value(), AckMode::Manual);
        assert_eq!(engine.policy().prefetch_count(), 3);
    }
}
