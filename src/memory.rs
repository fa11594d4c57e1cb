// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A `BrokerClient` holding exchanges and queues in process memory. It
//! follows the AMQP semantics the reliability layer relies on: direct,
//! fanout, topic and delayed-message routing, per-queue and per-message TTL
//! with dead-lettering, max-length overflow, prefetch-bounded consumers and
//! redelivery of unsettled messages when a consumer goes away.
//!
//! Publisher confirms and connectivity can be switched at runtime to
//! exercise failure paths.

use crate::{
    broker::{
        Acknowledger, BrokerClient, Confirmation, ConsumeOptions, Delivery, DeliveryStream,
        Settlement,
    },
    envelope::{Envelope, HeaderValue, HEADER_DELAY},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tracing::{debug, warn};

/// Dead-letter hops followed before a message is dropped
const MAX_DEAD_LETTER_HOPS: u8 = 8;

/// Publisher confirm behaviour of the in-memory broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    #[default]
    Ack,
    Nack,
    /// Confirms never arrive.
    Never,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    envelope: Envelope,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    enqueued_at: Instant,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
    consumers: u32,
}

struct ExchangeState {
    def: ExchangeDefinition,
    bindings: Vec<(String, String)>,
}

struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_consumer: u64,
    reachable: bool,
    confirm_mode: ConfirmMode,
    publish_count: usize,
    fail_publish_after: Option<usize>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Broker living in process memory; clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    exchanges: HashMap::default(),
                    queues: HashMap::default(),
                    next_tag: 1,
                    next_consumer: 1,
                    reachable: true,
                    confirm_mode: ConfirmMode::Ack,
                    publish_count: 0,
                    fail_publish_after: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Makes every operation fail as if the connection were lost.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state().reachable = reachable;
        self.inner.notify.notify_waiters();
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.inner.state().confirm_mode = mode;
    }

    /// Accepts `count` more publishes, then fails the following ones.
    pub fn fail_publish_after(&self, count: usize) {
        let mut state = self.inner.state();
        state.fail_publish_after = Some(state.publish_count + count);
    }

    /// Publishes accepted so far.
    pub fn publish_count(&self) -> usize {
        self.inner.state().publish_count
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.state().exchanges.contains_key(name)
    }

    /// Ready messages of `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Envelope> {
        let mut state = self.inner.state();
        self.inner.expire_queue(&mut state, queue);
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|msg| msg.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivered but unsettled messages of `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or_default()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(
        self: &Arc<Self>,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        hops: u8,
    ) -> Result<(), AmqpError> {
        if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                self.enqueue(state, routing_key, exchange, routing_key, envelope, hops);
            } else {
                debug!(routing_key, "unroutable message dropped");
            }
            return Ok(());
        }

        let Some(target) = state.exchanges.get(exchange) else {
            return Err(AmqpError::PublishError(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        };

        let kind = target.def.exchange_kind();
        if kind == ExchangeKind::XMessageDelayed {
            let delay = envelope
                .get_header(HEADER_DELAY)
                .and_then(HeaderValue::as_i64)
                .and_then(|ms| u64::try_from(ms).ok())
                .unwrap_or_default();

            if delay > 0 {
                self.schedule_delayed(exchange, routing_key, envelope, delay);
                return Ok(());
            }
        }

        self.route_bound(state, exchange, routing_key, envelope, hops);
        Ok(())
    }

    fn route_bound(
        self: &Arc<Self>,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        hops: u8,
    ) {
        let Some(target) = state.exchanges.get(exchange) else {
            return;
        };

        let kind = match target.def.exchange_kind() {
            ExchangeKind::XMessageDelayed => target.def.delayed_kind(),
            kind => kind,
        };

        let mut destinations: Vec<String> = target
            .bindings
            .iter()
            .filter(|(_, key)| match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                _ => key == routing_key,
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        destinations.sort();
        destinations.dedup();

        if destinations.is_empty() {
            debug!(exchange, routing_key, "unroutable message dropped");
        }

        for queue in destinations {
            self.enqueue(state, &queue, exchange, routing_key, envelope.clone(), hops);
        }
    }

    fn schedule_delayed(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        delay_ms: u64,
    ) {
        let inner = self.clone();
        let exchange = exchange.to_owned();
        let routing_key = routing_key.to_owned();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            {
                let mut state = inner.state();
                inner.route_bound(&mut state, &exchange, &routing_key, envelope, 0);
            }
            inner.notify.notify_waiters();
        });
    }

    fn enqueue(
        self: &Arc<Self>,
        state: &mut State,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        hops: u8,
    ) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        let ttl = effective_ttl(&q.def, &envelope);
        q.ready.push_back(StoredMessage {
            envelope,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            enqueued_at: Instant::now(),
        });

        let mut overflow = vec![];
        if let Some(max) = q.def.max_length {
            while q.ready.len() > max as usize {
                if let Some(dropped) = q.ready.pop_front() {
                    overflow.push(dropped);
                }
            }
        }

        if let Some(ttl) = ttl {
            self.schedule_expiry(queue, ttl);
        }

        for msg in overflow {
            self.dead_letter(state, queue, msg, hops);
        }
    }

    fn schedule_expiry(self: &Arc<Self>, queue: &str, after: Duration) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let inner = self.clone();
        let queue = queue.to_owned();

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            {
                let mut state = inner.state();
                inner.expire_queue(&mut state, &queue);
            }
            inner.notify.notify_waiters();
        });
    }

    /// Dead-letters the ready messages of `queue` whose TTL elapsed.
    fn expire_queue(self: &Arc<Self>, state: &mut State, queue: &str) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        let now = Instant::now();
        let def = q.def.clone();
        let (expired, alive): (VecDeque<_>, VecDeque<_>) =
            q.ready.drain(..).partition(|msg: &StoredMessage| {
                effective_ttl(&def, &msg.envelope)
                    .is_some_and(|ttl| now.duration_since(msg.enqueued_at) >= ttl)
            });
        q.ready = alive;

        for msg in expired {
            self.dead_letter(state, queue, msg, 0);
        }
    }

    /// Sends `msg` to the dead letter exchange of `queue`, or drops it.
    fn dead_letter(self: &Arc<Self>, state: &mut State, queue: &str, msg: StoredMessage, hops: u8) {
        if hops >= MAX_DEAD_LETTER_HOPS {
            warn!(queue, "dead letter cycle detected, message dropped");
            return;
        }

        let Some(args) = state.queues.get(queue).map(|q| q.def.effective_arguments()) else {
            return;
        };

        let Some(exchange) = args
            .get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
            .and_then(HeaderValue::as_str)
            .map(str::to_owned)
        else {
            debug!(queue, "message dropped without dead letter exchange");
            return;
        };

        let routing_key = args
            .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .and_then(HeaderValue::as_str)
            .map(str::to_owned)
            .unwrap_or(msg.routing_key);

        // Per-message expiration does not follow a message out of its queue.
        let mut envelope = msg.envelope;
        envelope.ttl = None;

        if let Err(err) = self.route(state, &exchange, &routing_key, envelope, hops + 1) {
            warn!(error = err.to_string(), queue, "dead letter routing failed");
        }
    }

    fn take_next(
        self: &Arc<Self>,
        state: &mut State,
        queue: &str,
        consumer_id: u64,
        no_ack: bool,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Delivery, Option<OwnedSemaphorePermit>> {
        let tag = state.next_tag;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(permit);
        };
        let Some(msg) = q.ready.pop_front() else {
            return Err(permit);
        };

        if !no_ack {
            q.unacked.insert(tag, (consumer_id, msg.clone()));
        }
        state.next_tag += 1;

        let acker = Arc::new(MemoryAcker {
            inner: self.clone(),
            queue: queue.to_owned(),
            tag,
            permit: Mutex::new(permit),
        });
        let settlement = if no_ack {
            Settlement::pre_settled(acker)
        } else {
            Settlement::new(acker)
        };

        Ok(Delivery::new(
            msg.envelope,
            msg.exchange,
            msg.routing_key,
            msg.redelivered,
            tag,
            settlement,
        ))
    }
}

fn effective_ttl(def: &QueueDefinition, envelope: &Envelope) -> Option<Duration> {
    let queue_ttl = def.ttl.map(|ms| Duration::from_millis(u64::from(ms)));
    match (queue_ttl, envelope.ttl) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((key_word, key_rest))) => {
                word == key_word && matches(rest, key_rest)
            }
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn release(&self) {
        self.permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.notify.notify_waiters();
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        {
            let mut state = self.inner.state();
            if !state.reachable {
                return Err(AmqpError::AckMessageError);
            }
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.unacked.remove(&self.tag);
            }
        }
        self.release();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        {
            let mut state = self.inner.state();
            if !state.reachable {
                return Err(AmqpError::NackMessageError);
            }
            let entry = state
                .queues
                .get_mut(&self.queue)
                .and_then(|q| q.unacked.remove(&self.tag));

            if let Some((_, mut msg)) = entry {
                if requeue {
                    msg.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&self.queue) {
                        q.ready.push_front(msg);
                    }
                } else {
                    self.inner.dead_letter(&mut state, &self.queue, msg, 0);
                }
            }
        }
        self.release();
        Ok(())
    }
}

/// Deregisters a consumer and requeues what it left unsettled.
struct ConsumerGuard {
    inner: Arc<Inner>,
    queue: String,
    consumer_id: u64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state();
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.consumers = q.consumers.saturating_sub(1);

                let mut orphaned: Vec<(u64, StoredMessage)> = q
                    .unacked
                    .iter()
                    .filter(|(_, (owner, _))| *owner == self.consumer_id)
                    .map(|(tag, (_, msg))| (*tag, msg.clone()))
                    .collect();
                orphaned.sort_by_key(|(tag, _)| *tag);

                for (tag, mut msg) in orphaned.into_iter().rev() {
                    q.unacked.remove(&tag);
                    msg.redelivered = true;
                    q.ready.push_front(msg);
                }
            }
        }
        self.inner.notify.notify_waiters();
    }
}

struct ConsumerCursor {
    inner: Arc<Inner>,
    queue: String,
    consumer_id: u64,
    no_ack: bool,
    prefetch: Arc<Semaphore>,
    done: bool,
    _guard: ConsumerGuard,
}

impl ConsumerCursor {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, AmqpError> {
        let mut permit = if self.no_ack {
            None
        } else {
            Some(
                self.prefetch
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))?,
            )
        };

        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.inner.state();
                if !state.reachable {
                    return Err(AmqpError::ConsumerError("broker unreachable".to_owned()));
                }
                if !state.queues.contains_key(&self.queue) {
                    return Ok(None);
                }

                self.inner.expire_queue(&mut state, &self.queue);

                match self.inner.take_next(
                    &mut state,
                    &self.queue,
                    self.consumer_id,
                    self.no_ack,
                    permit.take(),
                ) {
                    Ok(delivery) => return Ok(Some(delivery)),
                    Err(returned) => permit = returned,
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        {
            let mut state = self.inner.state();
            if !state.reachable {
                return Err(AmqpError::PublishError("broker unreachable".to_owned()));
            }
            if state
                .fail_publish_after
                .is_some_and(|limit| state.publish_count >= limit)
            {
                return Err(AmqpError::PublishError("publish rejected".to_owned()));
            }

            self.inner
                .route(&mut state, exchange, routing_key, envelope.clone(), 0)?;
            state.publish_count += 1;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<Confirmation, AmqpError> {
        self.publish(exchange, routing_key, envelope).await?;

        let mode = self.inner.state().confirm_mode;
        match mode {
            ConfirmMode::Ack => Ok(Confirmation::Acked),
            ConfirmMode::Nack => Ok(Confirmation::Nacked),
            ConfirmMode::Never => std::future::pending().await,
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        if !state.reachable {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }

        match state.exchanges.get(def.name()) {
            Some(existing) => match existing.def.conflict_with(def) {
                Some(reason) if !def.passive => Err(AmqpError::InvalidTopology(format!(
                    "PRECONDITION_FAILED - {reason}"
                ))),
                _ => Ok(()),
            },
            None if def.passive => Err(AmqpError::DeclareExchangeError(format!(
                "NOT_FOUND - no exchange '{}'",
                def.name()
            ))),
            None => {
                state.exchanges.insert(
                    def.name().to_owned(),
                    ExchangeState {
                        def: def.clone(),
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        if !state.reachable {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        match state.queues.get(def.name()) {
            Some(existing) => match existing.def.conflict_with(def) {
                Some(reason) if !def.passive => Err(AmqpError::InvalidTopology(format!(
                    "PRECONDITION_FAILED - {reason}"
                ))),
                _ => Ok(()),
            },
            None if def.passive => Err(AmqpError::DeclareQueueError(format!(
                "NOT_FOUND - no queue '{}'",
                def.name()
            ))),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        consumers: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        let error = || {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            )
        };

        if !state.reachable || !state.queues.contains_key(binding.queue_name()) {
            return Err(error());
        }

        let exchange = state
            .exchanges
            .get_mut(binding.exchange_name())
            .ok_or_else(error)?;

        let entry = (binding.queue_name().to_owned(), binding.key().to_owned());
        if !exchange.bindings.contains(&entry) {
            exchange.bindings.push(entry);
        }
        Ok(())
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        if !state.reachable {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        if let Some(exchange) = state.exchanges.get_mut(binding.exchange_name()) {
            exchange
                .bindings
                .retain(|(queue, key)| queue != binding.queue_name() || key != binding.key());
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        {
            let mut state = self.inner.state();
            if !state.reachable {
                return Err(AmqpError::DeleteError(name.to_owned()));
            }

            state.queues.remove(name);
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let mut state = self.inner.state();
        if !state.reachable {
            return Err(AmqpError::DeleteError(name.to_owned()));
        }

        state.exchanges.remove(name);
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.inner.state();
        if !state.reachable {
            return Err(AmqpError::ConsumerError("broker unreachable".to_owned()));
        }
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ConsumerError(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }

        self.inner.expire_queue(&mut state, queue);
        Ok(self.inner.take_next(&mut state, queue, 0, false, None).ok())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer_id = {
            let mut state = self.inner.state();
            if !state.reachable {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }

            let consumer_id = state.next_consumer;
            state.next_consumer += 1;

            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;
            q.consumers += 1;
            consumer_id
        };

        let cursor = ConsumerCursor {
            inner: self.inner.clone(),
            queue: queue.to_owned(),
            consumer_id,
            no_ack: options.no_ack,
            prefetch: Arc::new(Semaphore::new(usize::from(options.prefetch.max(1)))),
            done: false,
            _guard: ConsumerGuard {
                inner: self.inner.clone(),
                queue: queue.to_owned(),
                consumer_id,
            },
        };

        let stream = futures_util::stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            match cursor.next_delivery().await {
                Ok(Some(delivery)) => Some((Ok(delivery), cursor)),
                Ok(None) => None,
                Err(err) => {
                    cursor.done = true;
                    Some((Err(err), cursor))
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn queue_message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.inner.state();
        if !state.reachable {
            return Err(AmqpError::ConnectionError);
        }

        self.inner.expire_queue(&mut state, queue);
        state
            .queues
            .get(queue)
            .map(|q| u32::try_from(q.ready.len()).unwrap_or(u32::MAX))
            .ok_or_else(|| AmqpError::DeclareQueueError(queue.to_owned()))
    }

    async fn queue_consumer_count(&self, queue: &str) -> Result<u32, AmqpError> {
        let state = self.inner.state();
        if !state.reachable {
            return Err(AmqpError::ConnectionError);
        }

        state
            .queues
            .get(queue)
            .map(|q| q.consumers)
            .ok_or_else(|| AmqpError::DeclareQueueError(queue.to_owned()))
    }

    fn is_connected(&self) -> bool {
        self.inner.state().reachable
    }

    fn connection_info(&self) -> String {
        let state = self.inner.state();
        format!(
            "in-memory broker ({} exchanges, {} queues)",
            state.exchanges.len(),
            state.queues.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn declare(broker: &InMemoryBroker, exchange: ExchangeDefinition, queue: &str, key: &str) {
        broker.declare_exchange(&exchange).await.unwrap();
        broker
            .declare_queue(&QueueDefinition::new(queue))
            .await
            .unwrap();
        broker
            .bind_queue(
                &QueueBinding::new(queue)
                    .exchange(exchange.name())
                    .routing_key(key),
            )
            .await
            .unwrap();
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(!topic_matches("payments.*", "orders.created"));
    }

    #[tokio::test]
    async fn routes_by_exchange_kind() {
        let broker = InMemoryBroker::new();
        declare(&broker, ExchangeDefinition::new("orders").topic(), "orders.eu", "orders.*.eu").await;
        declare(&broker, ExchangeDefinition::new("audit").fanout(), "audit.q", "").await;

        let env = Envelope::new(b"{}".to_vec());
        broker.publish("orders", "orders.created.eu", &env).await.unwrap();
        broker.publish("orders", "orders.created.us", &env).await.unwrap();
        broker.publish("audit", "anything", &env).await.unwrap();
        broker.publish("", "audit.q", &env).await.unwrap();

        assert_eq!(broker.messages("orders.eu").len(), 1);
        assert_eq!(broker.messages("audit.q").len(), 2);
        assert!(matches!(
            broker.publish("missing", "k", &env).await,
            Err(AmqpError::PublishError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueDefinition::new("parking"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("holding").ttl(500).dead_letter("", Some("parking")))
            .await
            .unwrap();

        broker
            .publish("", "holding", &Envelope::new(b"{}".to_vec()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(broker.messages("parking").len(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.messages("holding").len(), 0);
        assert_eq!(broker.messages("parking").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_exchange_holds_messages_back() {
        let broker = InMemoryBroker::new();
        declare(
            &broker,
            ExchangeDefinition::new("delayed").direct_delayed(),
            "later",
            "later",
        )
        .await;

        let env = Envelope::new(b"{}".to_vec()).header(HEADER_DELAY, 300i64);
        broker.publish("delayed", "later", &env).await.unwrap();

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(broker.messages("later").is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(broker.messages("later").len(), 1);
    }

    #[tokio::test]
    async fn max_length_overflow_drops_the_oldest() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueDefinition::new("bounded").max_length(2))
            .await
            .unwrap();

        for id in ["a", "b", "c"] {
            broker
                .publish("", "bounded", &Envelope::new(vec![]).message_id(id))
                .await
                .unwrap();
        }

        let ids: Vec<String> = broker
            .messages("bounded")
            .into_iter()
            .map(|env| env.message_id)
            .collect();
        assert_eq!(ids, vec!["b".to_owned(), "c".to_owned()]);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        broker.publish("", "q", &Envelope::new(vec![])).await.unwrap();

        let first = broker.get("q").await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count("q"), 1);

        first.nack(true).await.unwrap();
        let second = broker.get("q").await.unwrap().unwrap();
        assert!(second.redelivered);

        second.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
        assert!(broker.get("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consumers_respect_prefetch_and_requeue_on_drop() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        for _ in 0..3 {
            broker.publish("", "q", &Envelope::new(vec![])).await.unwrap();
        }

        let mut stream = broker
            .consume(
                "q",
                "test",
                ConsumeOptions {
                    prefetch: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(broker.queue_consumer_count("q").await, Ok(1));

        let a = stream.next().await.unwrap().unwrap();
        let _b = stream.next().await.unwrap().unwrap();
        let third = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(third.is_err());

        a.ack().await.unwrap();
        let _c = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 2);

        drop(stream);
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.queue_message_count("q").await, Ok(2));
        assert_eq!(broker.queue_consumer_count("q").await, Ok(0));
    }

    #[tokio::test]
    async fn confirm_modes_and_reachability() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        let env = Envelope::new(vec![]);

        assert_eq!(
            broker.publish_confirmed("", "q", &env).await,
            Ok(Confirmation::Acked)
        );

        broker.set_confirm_mode(ConfirmMode::Nack);
        assert_eq!(
            broker.publish_confirmed("", "q", &env).await,
            Ok(Confirmation::Nacked)
        );

        broker.set_confirm_mode(ConfirmMode::Never);
        let pending =
            tokio::time::timeout(Duration::from_millis(20), broker.publish_confirmed("", "q", &env))
                .await;
        assert!(pending.is_err());

        broker.set_reachable(false);
        assert!(!broker.is_connected());
        assert!(broker.publish("", "q", &env).await.is_err());
    }
}
