// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reliable Publisher
//!
//! `ReliablePublisher` applies a `ProducerPolicy` to a publishing call: the
//! dispatch condition, the resolution of the destination from the call
//! context, the delivery attributes, the confirm wait, linear retries and,
//! once those are exhausted, the failure strategy of the policy.

use crate::{
    broker::Confirmation,
    envelope::{
        Envelope, HEADER_EXCEPTION_MESSAGE, HEADER_EXCEPTION_TYPE, HEADER_FAILED_AT,
        HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
    },
    errors::AmqpError,
    policy::{ProducerFailureStrategy, ProducerPolicy, DEFAULT_CONFIRM_TIMEOUT},
    service::{MessagingService, PendingPublish},
};
use chrono::Utc;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Result of a policy-driven publish.
#[derive(Debug)]
pub enum PublishOutcome {
    /// Handed to the broker without waiting for a confirm.
    Published,
    /// Acknowledged by the broker.
    Confirmed,
    /// The producer is disabled or the condition did not hold.
    Skipped,
    /// Failed, and the failure was logged and dropped.
    Ignored,
    /// Failed, and the envelope went to the dead letter exchange.
    DeadLettered,
    /// Failed, and the custom failure strategy accepted the error.
    Handled,
    /// Running on a spawned task.
    Dispatched(PendingPublish),
}

/// The parts of a policy that outlive the call context.
#[derive(Clone)]
struct Attempts {
    wait_for_confirm: bool,
    confirm_timeout: Duration,
    retry_count: u32,
    retry_interval: Duration,
    on_failure: ProducerFailureStrategy,
}

impl<C> From<&ProducerPolicy<C>> for Attempts {
    fn from(policy: &ProducerPolicy<C>) -> Self {
        Attempts {
            wait_for_confirm: policy.wait_for_confirm,
            confirm_timeout: policy.confirm_timeout,
            retry_count: policy.retry_count,
            retry_interval: policy.retry_interval,
            on_failure: policy.on_failure.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ReliablePublisher {
    service: Arc<MessagingService>,
}

impl ReliablePublisher {
    pub fn new(service: Arc<MessagingService>) -> ReliablePublisher {
        ReliablePublisher { service }
    }

    pub fn service(&self) -> &Arc<MessagingService> {
        &self.service
    }

    /// Publishes `message` as described by `policy` for the call `ctx`.
    pub async fn publish<C, T>(
        &self,
        policy: &ProducerPolicy<C>,
        ctx: &C,
        message: &T,
    ) -> Result<PublishOutcome, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        if !self.service.configs().producer.enabled {
            debug!("producer disabled, message skipped");
            return Ok(PublishOutcome::Skipped);
        }

        if !policy.should_dispatch(ctx) {
            debug!("producer condition not met, message skipped");
            return Ok(PublishOutcome::Skipped);
        }

        let (exchange, routing_key) = self.destination(policy, ctx);
        let envelope = self.envelope(policy, message)?;
        let attempts = Attempts::from(policy);

        if policy.is_async && !policy.wait_for_confirm {
            let service = self.service.clone();
            let pending = PendingPublish::spawn(async move {
                deliver(&service, &attempts, &exchange, &routing_key, envelope)
                    .await
                    .map(|_| ())
            });
            return Ok(PublishOutcome::Dispatched(pending));
        }

        deliver(&self.service, &attempts, &exchange, &routing_key, envelope).await
    }

    fn destination<C>(&self, policy: &ProducerPolicy<C>, ctx: &C) -> (String, String) {
        let producer = &self.service.configs().producer;

        let mut exchange = policy.exchange.resolve(ctx);
        if exchange.is_empty() {
            exchange = producer.default_exchange.clone();
        }

        let mut routing_key = policy.routing_key.resolve(ctx);
        if routing_key.is_empty() {
            routing_key = producer.default_routing_key.clone();
        }

        (exchange, routing_key)
    }

    fn envelope<C, T>(&self, policy: &ProducerPolicy<C>, message: &T) -> Result<Envelope, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let mut envelope = Envelope::json(message)?
            .headers(&policy.headers)
            .delivery_mode(policy.delivery_mode);

        if let Some(kind) = &policy.message_type {
            envelope = envelope.message_type(kind.as_str());
        }
        if let Some(ttl) = policy.ttl {
            envelope = envelope.ttl(ttl);
        }
        if let Some(priority) = policy.priority {
            envelope = envelope.priority(priority);
        }

        Ok(envelope)
    }
}

async fn deliver(
    service: &MessagingService,
    attempts: &Attempts,
    exchange: &str,
    routing_key: &str,
    envelope: Envelope,
) -> Result<PublishOutcome, AmqpError> {
    let mut failures = 0;

    let failure = loop {
        match attempt(service, attempts, exchange, routing_key, envelope.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                failures += 1;
                warn!(
                    error = err.to_string(),
                    exchange,
                    attempt = failures,
                    "error whiling publishing msg"
                );

                if failures > attempts.retry_count {
                    break err;
                }
                tokio::time::sleep(attempts.retry_interval).await;
            }
        }
    };

    fail(service, attempts, exchange, routing_key, envelope, failure, failures).await
}

async fn attempt(
    service: &MessagingService,
    attempts: &Attempts,
    exchange: &str,
    routing_key: &str,
    envelope: Envelope,
) -> Result<PublishOutcome, AmqpError> {
    if !attempts.wait_for_confirm {
        service
            .publish_envelope(exchange, routing_key, envelope)
            .await?;
        return Ok(PublishOutcome::Published);
    }

    match service
        .confirm_envelope(exchange, routing_key, envelope, attempts.confirm_timeout)
        .await?
    {
        Confirmation::Acked => Ok(PublishOutcome::Confirmed),
        Confirmation::Nacked => Err(AmqpError::PublishError(format!(
            "message nacked by the broker on `{exchange}`"
        ))),
        Confirmation::TimedOut => Err(AmqpError::ConfirmTimeout(
            u64::try_from(attempts.confirm_timeout.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

async fn fail(
    service: &MessagingService,
    attempts: &Attempts,
    exchange: &str,
    routing_key: &str,
    envelope: Envelope,
    failure: AmqpError,
    failures: u32,
) -> Result<PublishOutcome, AmqpError> {
    match &attempts.on_failure {
        ProducerFailureStrategy::Raise => {
            error!(
                error = failure.to_string(),
                exchange, routing_key, "publishing failed"
            );
            Err(failure)
        }
        ProducerFailureStrategy::LogAndIgnore => {
            warn!(
                error = failure.to_string(),
                message_id = envelope.message_id,
                exchange,
                "publishing failed, ignoring"
            );
            Ok(PublishOutcome::Ignored)
        }
        ProducerFailureStrategy::SendToDeadLetter => {
            let dead_letter = &service.configs().dead_letter;
            let copy = envelope
                .without_ttl()
                .header(HEADER_RETRY_COUNT, failures)
                .header(HEADER_EXCEPTION_MESSAGE, failure.to_string())
                .header(HEADER_EXCEPTION_TYPE, failure.kind())
                .header(HEADER_ORIGINAL_EXCHANGE, exchange)
                .header(HEADER_ORIGINAL_ROUTING_KEY, routing_key)
                .header(HEADER_FAILED_AT, Utc::now().timestamp_millis());

            match service
                .confirm_envelope(
                    &dead_letter.exchange,
                    &dead_letter.routing_key,
                    copy,
                    DEFAULT_CONFIRM_TIMEOUT,
                )
                .await
            {
                Ok(Confirmation::Acked) => {
                    warn!(
                        error = failure.to_string(),
                        exchange, "publishing failed, msg sent to dead letter"
                    );
                    Ok(PublishOutcome::DeadLettered)
                }
                other => {
                    let reason = match other {
                        Err(err) => err.to_string(),
                        Ok(confirmation) => format!("{confirmation:?}"),
                    };
                    let err = AmqpError::DeadLetterRouting(format!(
                        "{}: {reason}",
                        dead_letter.exchange
                    ));
                    error!(
                        error = err.to_string(),
                        cause = failure.to_string(),
                        "error whiling sending msg to dead letter"
                    );
                    Err(err)
                }
            }
        }
        ProducerFailureStrategy::Custom(handle) => {
            handle(&envelope, &failure).map(|()| PublishOutcome::Handled)
        }
    }
}
