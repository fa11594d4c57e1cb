// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs the consumers registered as `(ConsumerPolicy, handler)`
//! pairs. Starting the dispatcher declares the topology each policy needs,
//! then opens `min` workers per policy, each with its own consumer channel
//! and prefetch. A supervisor per policy grows the pool up to `max` workers
//! while the queue backlog exceeds what the current workers can hold, and
//! replaces workers whose consumer went away.
//!
//! `DispatcherHandle::shutdown` stops consumption, waits for in-flight
//! handlers up to a grace period and requeues whatever is still running
//! afterwards.

use crate::{
    broker::{BrokerClient, ConsumeOptions},
    consumer::{ConsumerEngine, ConsumerHandler},
    errors::AmqpError,
    policy::{AckMode, ConsumerPolicy},
    service::MessagingService,
};
use futures_util::StreamExt;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Registers consumers and starts them.
pub struct Dispatcher {
    service: Arc<MessagingService>,
    registrations: Vec<(ConsumerPolicy, Arc<dyn ConsumerHandler>)>,
}

impl Dispatcher {
    pub fn new(service: Arc<MessagingService>) -> Self {
        Dispatcher {
            service,
            registrations: Vec::new(),
        }
    }

    /// Registers `handler` for the queue described by `policy`.
    pub fn register(mut self, policy: ConsumerPolicy, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.registrations.push((policy, handler));
        self
    }

    /// Declares the topology of every registered policy and starts the
    /// workers.
    pub async fn start(self) -> Result<DispatcherHandle, AmqpError> {
        let configs = self.service.configs();
        let workers = Workers {
            broker: self.service.broker().clone(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            scale_interval: Duration::from_millis(configs.consumer.scale_interval_ms),
        };
        let grace = Duration::from_millis(configs.consumer.shutdown_timeout_ms);

        if !configs.consumer.enabled {
            info!("consumers disabled, dispatcher not started");
            return Ok(DispatcherHandle {
                workers,
                pools: Vec::new(),
                grace,
            });
        }

        let mut pools = Vec::with_capacity(self.registrations.len());
        for (policy, handler) in self.registrations {
            let policy = policy.resolve(configs);
            policy.validate()?;
            declare_topology(&self.service, &policy).await?;

            let engine = ConsumerEngine::new(self.service.clone(), policy, handler);
            if let Some(exchange) = engine.dead_letter_exchange() {
                if !self.service.topology().is_exchange_declared(exchange).await {
                    error!(
                        queue = engine.policy().queue(),
                        exchange, "dead letter exchange not declared"
                    );
                    return Err(AmqpError::InvalidTopology(format!(
                        "dead letter exchange `{exchange}` of consumer `{}` is not declared",
                        engine.policy().queue()
                    )));
                }
            }

            pools.push(Arc::new(Pool {
                engine,
                workers: AtomicUsize::new(0),
                next_tag: AtomicUsize::new(0),
            }));
        }

        for pool in &pools {
            for _ in 0..pool.engine.policy().min_concurrency() {
                workers.spawn_worker(pool);
            }

            let supervisor = workers.clone();
            let supervised = pool.clone();
            workers
                .tracker
                .spawn(async move { supervisor.supervise(supervised).await });

            debug!(queue = pool.queue(), "consumer started");
        }

        Ok(DispatcherHandle {
            workers,
            pools,
            grace,
        })
    }
}

/// Declares the exchange, queue and binding a consumer relies on.
async fn declare_topology(
    service: &MessagingService,
    policy: &ConsumerPolicy,
) -> Result<(), AmqpError> {
    let topology = service.topology();

    if let Some(exchange) = policy.exchange_definition() {
        topology.declare_exchange(&exchange).await?;
    }
    topology.declare_queue(&policy.queue_definition()).await?;
    if let Some(binding) = policy.binding() {
        topology.bind(&binding).await?;
    }

    Ok(())
}

/// Workers of one consumer policy.
struct Pool {
    engine: ConsumerEngine,
    workers: AtomicUsize,
    next_tag: AtomicUsize,
}

impl Pool {
    fn queue(&self) -> &str {
        self.engine.policy().queue()
    }
}

/// Decrements the worker count of a pool when a worker exits.
struct WorkerSlot(Arc<Pool>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct Workers {
    broker: Arc<dyn BrokerClient>,
    tracker: TaskTracker,
    /// Stops taking new deliveries.
    cancel: CancellationToken,
    /// Abandons in-flight deliveries.
    force: CancellationToken,
    scale_interval: Duration,
}

impl Workers {
    fn spawn_worker(&self, pool: &Arc<Pool>) {
        pool.workers.fetch_add(1, Ordering::SeqCst);
        let slot = WorkerSlot(pool.clone());
        let tag = format!(
            "{}-{}",
            pool.queue(),
            pool.next_tag.fetch_add(1, Ordering::SeqCst)
        );

        let workers = self.clone();
        self.tracker
            .spawn(async move { workers.run_worker(slot, tag).await });
    }

    async fn run_worker(self, slot: WorkerSlot, tag: String) {
        let pool = &slot.0;
        let policy = pool.engine.policy();
        let options = ConsumeOptions {
            prefetch: policy.prefetch_count(),
            no_ack: policy.ack_mode_value() == AckMode::None,
            exclusive: policy.exclusive,
        };

        let mut deliveries = match self.broker.consume(pool.queue(), &tag, options).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = pool.queue(),
                    "error to create the consumer"
                );
                return;
            }
            Ok(stream) => stream,
        };

        debug!(queue = pool.queue(), consumer_tag = tag.as_str(), "worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(
                        error = err.to_string(),
                        queue = pool.queue(),
                        "errors consume msg"
                    );
                    break;
                }
                None => {
                    debug!(queue = pool.queue(), "consumer stream closed");
                    break;
                }
            };

            let settlement = delivery.settlement();
            tokio::select! {
                outcome = pool.engine.process_delivery(delivery) => {
                    debug!(queue = pool.queue(), outcome = ?outcome, "delivery settled");
                }
                _ = self.force.cancelled() => {
                    warn!(queue = pool.queue(), "shutdown grace elapsed, requeuing in-flight msg");
                    if let Err(err) = settlement.nack(true).await {
                        error!(error = err.to_string(), "error whiling nack msg");
                    }
                    break;
                }
            }
        }

        debug!(queue = pool.queue(), consumer_tag = tag.as_str(), "worker stopped");
    }

    /// Keeps at least `min` workers and grows to `max` while the backlog
    /// exceeds `workers * prefetch`.
    async fn supervise(self, pool: Arc<Pool>) {
        let policy = pool.engine.policy();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.scale_interval) => {}
            }

            let workers = pool.workers.load(Ordering::SeqCst);
            if workers < policy.min_concurrency() {
                warn!(queue = pool.queue(), workers, "replacing stopped consumer");
                self.spawn_worker(&pool);
                continue;
            }

            if workers >= policy.max_concurrency() {
                continue;
            }

            match self.broker.queue_message_count(pool.queue()).await {
                Ok(backlog) => {
                    let capacity = workers * usize::from(policy.prefetch_count());
                    if usize::try_from(backlog).unwrap_or(usize::MAX) > capacity {
                        info!(
                            queue = pool.queue(),
                            backlog,
                            workers = workers + 1,
                            "scaling consumer up"
                        );
                        self.spawn_worker(&pool);
                    }
                }
                Err(err) => {
                    debug!(
                        error = err.to_string(),
                        queue = pool.queue(),
                        "error to read the queue backlog"
                    );
                }
            }
        }
    }
}

/// Controls the consumers started by a `Dispatcher`.
#[derive(Clone)]
pub struct DispatcherHandle {
    workers: Workers,
    pools: Vec<Arc<Pool>>,
    grace: Duration,
}

impl DispatcherHandle {
    /// Running workers consuming `queue`.
    pub fn worker_count(&self, queue: &str) -> usize {
        self.pools
            .iter()
            .filter(|pool| pool.queue() == queue)
            .map(|pool| pool.workers.load(Ordering::SeqCst))
            .sum()
    }

    /// Stops consuming and waits up to `grace` for in-flight handlers.
    /// Deliveries still in progress afterwards are requeued. Returns whether
    /// every worker finished within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("dispatcher shutting down");
        self.workers.cancel.cancel();
        self.workers.tracker.close();

        if tokio::time::timeout(grace, self.workers.tracker.wait())
            .await
            .is_ok()
        {
            return true;
        }

        warn!(
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "in-flight handlers did not finish in time"
        );
        self.workers.force.cancel();
        self.workers.tracker.wait().await;
        false
    }

    /// `shutdown` with the configured grace period.
    pub async fn stop(&self) -> bool {
        self.shutdown(self.grace).await
    }

    /// Waits until the dispatcher was shut down and every worker exited.
    pub async fn join(&self) {
        self.workers.cancel.cancelled().await;
        self.workers.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::MessagingConfigs,
        consumer::{handler_fn, ConsumerMessage, HandlerError},
        envelope::Envelope,
        memory::InMemoryBroker,
        policy::ConsumerFailureStrategy,
    };
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    async fn setup(configs: MessagingConfigs) -> (InMemoryBroker, Arc<MessagingService>) {
        let broker = InMemoryBroker::new();
        let service = MessagingService::new(Arc::new(broker.clone()), configs);
        service.install_well_known().await.unwrap();
        (broker, service)
    }

    fn counting(calls: &Arc<AtomicU32>, fail: bool) -> Arc<dyn ConsumerHandler> {
        let calls = calls.clone();
        handler_fn(move |_msg: ConsumerMessage| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err::<(), HandlerError>("handler failed".into());
                }
                Ok(())
            }
        })
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn consumes_through_the_declared_binding() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let handle = Dispatcher::new(service.clone())
            .register(
                ConsumerPolicy::new("orders.q").bind("orders", Some("orders.created")),
                counting(&calls, false),
            )
            .start()
            .await
            .unwrap();

        assert!(broker.has_exchange("orders"));
        assert!(broker.has_queue("orders.q"));
        assert_eq!(handle.worker_count("orders.q"), 1);

        for n in 0..5 {
            service
                .send("orders", "orders.created", &json!({ "n": n }))
                .await
                .unwrap();
        }

        wait_for(|| calls.load(Ordering::SeqCst) == 5).await;
        wait_for(|| broker.unacked_count("orders.q") == 0).await;
        assert!(broker.messages("orders.q").is_empty());

        assert!(handle.shutdown(Duration::from_secs(1)).await);
        assert_eq!(handle.worker_count("orders.q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_ends_in_the_dead_letter_queue() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let handle = Dispatcher::new(service.clone())
            .register(
                ConsumerPolicy::new("payments.q").retry(2, Duration::from_millis(100)),
                counting(&calls, true),
            )
            .start()
            .await
            .unwrap();

        service
            .publish_envelope("", "payments.q", Envelope::new(b"{}".to_vec()))
            .await
            .unwrap();

        wait_for(|| broker.messages("dlx.queue").len() == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(broker.messages("payments.q").is_empty());

        assert!(handle.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_consumer_defaults_shape_the_pool() {
        let mut configs = MessagingConfigs::default();
        configs.consumer.concurrency = 2;
        configs.consumer.max_concurrency = 2;
        configs.retry.max_attempts = 1;
        let (broker, service) = setup(configs).await;
        let calls = Arc::new(AtomicU32::new(0));

        let handle = Dispatcher::new(service.clone())
            .register(ConsumerPolicy::new("audit.q"), counting(&calls, true))
            .start()
            .await
            .unwrap();

        assert_eq!(handle.worker_count("audit.q"), 2);

        service
            .publish_envelope("", "audit.q", Envelope::new(vec![]))
            .await
            .unwrap();

        wait_for(|| broker.messages("dlx.queue").len() == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(handle.stop().await);
    }

    #[tokio::test]
    async fn auto_ack_consumers_never_get_requeued_messages_back() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let handle = Dispatcher::new(service.clone())
            .register(
                ConsumerPolicy::new("metrics.q")
                    .ack_mode(AckMode::None)
                    .retry_count(0)
                    .on_failure(ConsumerFailureStrategy::Requeue),
                counting(&calls, true),
            )
            .start()
            .await
            .unwrap();

        service
            .publish_envelope("", "metrics.q", Envelope::new(vec![]))
            .await
            .unwrap();

        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(broker.messages("metrics.q").is_empty());
        assert_eq!(broker.unacked_count("metrics.q"), 0);
        assert!(broker.messages("dlx.queue").is_empty());

        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn undeclared_dead_letter_exchange_fails_start() {
        let (_broker, service) = setup(MessagingConfigs::default()).await;

        let result = Dispatcher::new(service)
            .register(
                ConsumerPolicy::new("orders.q").dead_letter("orders.dlx", "failed"),
                counting(&Arc::new(AtomicU32::new(0)), false),
            )
            .start()
            .await;

        assert!(matches!(result, Err(AmqpError::InvalidTopology(_))));
    }

    #[tokio::test]
    async fn invalid_policies_fail_start() {
        let (_broker, service) = setup(MessagingConfigs::default()).await;

        let result = Dispatcher::new(service)
            .register(
                ConsumerPolicy::new("orders.q").concurrency(2, 1),
                counting(&Arc::new(AtomicU32::new(0)), false),
            )
            .start()
            .await;

        assert!(matches!(result, Err(AmqpError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn disabled_consumers_start_no_workers() {
        let mut configs = MessagingConfigs::default();
        configs.consumer.enabled = false;
        let (broker, service) = setup(configs).await;

        let handle = Dispatcher::new(service)
            .register(
                ConsumerPolicy::new("orders.q"),
                counting(&Arc::new(AtomicU32::new(0)), false),
            )
            .start()
            .await
            .unwrap();

        assert_eq!(handle.worker_count("orders.q"), 0);
        assert!(!broker.has_queue("orders.q"));
        assert!(handle.shutdown(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn scales_up_while_the_backlog_grows() {
        let (broker, service) = setup(MessagingConfigs::default()).await;

        let handle = Dispatcher::new(service.clone())
            .register(
                ConsumerPolicy::new("reports.q").concurrency(1, 3).prefetch(1),
                handler_fn(|_msg: ConsumerMessage| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<(), HandlerError>(())
                }),
            )
            .start()
            .await
            .unwrap();

        for n in 0..10 {
            service
                .publish_envelope("", "reports.q", Envelope::json(&json!({ "n": n })).unwrap())
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(handle.worker_count("reports.q"), 3);
        assert_eq!(broker.unacked_count("reports.q"), 3);

        assert!(!handle.shutdown(Duration::from_millis(100)).await);
        assert_eq!(broker.messages("reports.q").len(), 10);
        assert_eq!(broker.unacked_count("reports.q"), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_handlers() {
        let (broker, service) = setup(MessagingConfigs::default()).await;
        let started = Arc::new(AtomicU32::new(0));
        let signal = started.clone();

        let handle = Dispatcher::new(service.clone())
            .register(
                ConsumerPolicy::new("slow.q"),
                handler_fn(move |_msg: ConsumerMessage| {
                    let signal = signal.clone();
                    async move {
                        signal.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .start()
            .await
            .unwrap();

        service
            .publish_envelope("", "slow.q", Envelope::new(vec![]))
            .await
            .unwrap();
        wait_for(|| started.load(Ordering::SeqCst) == 1).await;

        assert!(handle.shutdown(Duration::from_secs(1)).await);
        assert!(broker.messages("slow.q").is_empty());
        assert_eq!(broker.unacked_count("slow.q"), 0);

        handle.join().await;
    }
}
