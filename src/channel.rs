// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and
//! channels. Publishing and topology operations borrow channels from a
//! bounded `ChannelPool`; every consumer gets a dedicated channel with its
//! own prefetch, closed when the consumer stream is dropped.
//!
//! `RabbitMQBroker` implements `BrokerClient` on top of these channels.

use crate::{
    broker::{
        Acknowledger, BrokerClient, Confirmation, ConsumeOptions, Delivery, DeliveryStream,
        Settlement,
    },
    configs::MessagingConfigs,
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, Stream, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::{
    ops::Deref,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

/// Creates a new AMQP connection to the configured RabbitMQ server.
///
/// The connection is named after the application so it can be told apart in
/// the management UI.
pub async fn new_amqp_connection(cfg: &MessagingConfigs) -> Result<Arc<Connection>, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    match Connection::connect(&cfg.uri(), options).await {
        Ok(conn) => {
            debug!(uri = cfg.redacted_uri(), "amqp connected");
            Ok(Arc::new(conn))
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                uri = cfg.redacted_uri(),
                "failure to connect"
            );
            Err(AmqpError::ConnectionError)
        }
    }
}

/// Opens a channel in publisher-confirm mode.
async fn new_amqp_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }?;

    match channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to enable publisher confirms");
            Err(AmqpError::ChannelError)
        }
        _ => {
            debug!("channel created");
            Ok(channel)
        }
    }
}

/// Bounded pool of confirm-mode channels.
pub struct ChannelPool {
    connection: Arc<Connection>,
    idle: Mutex<Vec<Channel>>,
    permits: Arc<Semaphore>,
}

impl ChannelPool {
    pub fn new(connection: Arc<Connection>, size: usize) -> Arc<ChannelPool> {
        Arc::new(ChannelPool {
            connection,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size.max(1))),
        })
    }

    /// Borrows a channel, waiting while all of them are in use.
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledChannel, AmqpError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AmqpError::ChannelError)?;

        let reused = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let mut reused = None;
            while let Some(channel) = idle.pop() {
                if channel.status().connected() {
                    reused = Some(channel);
                    break;
                }
            }
            reused
        };

        let channel = match reused {
            Some(channel) => channel,
            None => new_amqp_channel(&self.connection).await?,
        };

        Ok(PooledChannel {
            pool: self.clone(),
            channel,
            _permit: permit,
        })
    }

    fn give_back(&self, channel: Channel) {
        // Channels closed by a broker error are not reusable.
        if channel.status().connected() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(channel);
        }
    }
}

/// A channel borrowed from the pool, returned when dropped.
pub struct PooledChannel {
    pool: Arc<ChannelPool>,
    channel: Channel,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.pool.give_back(self.channel.clone());
    }
}

/// Maps a broker refusal of a redeclaration to `InvalidTopology`.
fn declare_error(err: &lapin::Error, fallback: AmqpError) -> AmqpError {
    let message = err.to_string();
    if message.contains("PRECONDITION_FAILED") {
        AmqpError::InvalidTopology(message)
    } else {
        fallback
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

fn into_delivery(delivery: lapin::message::Delivery, no_ack: bool) -> Delivery {
    let envelope = Envelope::from_properties(delivery.data, &delivery.properties);
    let acker: Arc<dyn Acknowledger> = Arc::new(LapinAcker {
        acker: delivery.acker,
    });

    Delivery::new(
        envelope,
        delivery.exchange.to_string(),
        delivery.routing_key.to_string(),
        delivery.redelivered,
        delivery.delivery_tag,
        if no_ack {
            Settlement::pre_settled(acker)
        } else {
            Settlement::new(acker)
        },
    )
}

/// Deliveries of one consumer; closes the consumer channel when dropped so
/// the broker requeues whatever is still unacknowledged.
struct LapinDeliveries {
    inner: BoxStream<'static, Result<Delivery, AmqpError>>,
    channel: Channel,
}

impl Stream for LapinDeliveries {
    type Item = Result<Delivery, AmqpError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for LapinDeliveries {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let channel = self.channel.clone();
        handle.spawn(async move {
            if let Err(err) = channel.close(200, "consumer stopped").await {
                debug!(error = err.to_string(), "consumer channel already closed");
            }
        });
    }
}

/// `BrokerClient` backed by a RabbitMQ connection.
pub struct RabbitMQBroker {
    connection: Arc<Connection>,
    pool: Arc<ChannelPool>,
    info: String,
}

impl RabbitMQBroker {
    pub fn new(connection: Arc<Connection>, cfg: &MessagingConfigs) -> Arc<RabbitMQBroker> {
        Arc::new(RabbitMQBroker {
            pool: ChannelPool::new(connection.clone(), cfg.rabbitmq.channel_pool_size),
            connection,
            info: format!("{} ({})", cfg.redacted_uri(), cfg.app.name),
        })
    }

    pub async fn connect(cfg: &MessagingConfigs) -> Result<Arc<RabbitMQBroker>, AmqpError> {
        let connection = new_amqp_connection(cfg).await?;
        Ok(RabbitMQBroker::new(connection, cfg))
    }

    async fn queue_info(&self, queue: &str) -> Result<lapin::Queue, AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to inspect the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
            Ok(info) => Ok(info),
        }
    }
}

#[async_trait]
impl BrokerClient for RabbitMQBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        // Pooled channels are in confirm mode and lapin keeps every
        // confirm that is dropped unawaited, so plain publishes settle theirs.
        match self.publish_confirmed(exchange, routing_key, envelope).await? {
            Confirmation::Nacked => {
                error!(exchange, routing_key, "message nacked by the broker");
                Err(AmqpError::PublishError(format!(
                    "message nacked by the broker on `{exchange}`"
                )))
            }
            _ => Ok(()),
        }
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<Confirmation, AmqpError> {
        let channel = self.pool.checkout().await?;

        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                envelope.to_properties(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(AmqpError::PublishError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(LapinConfirmation::Nack(_)) => Ok(Confirmation::Nacked),
            Ok(_) => Ok(Confirmation::Acked),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for the publisher confirm");
                Err(AmqpError::PublishError(err.to_string()))
            }
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.amqp_params()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                Err(declare_error(
                    &err,
                    AmqpError::DeclareExchangeError(def.name().to_owned()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.amqp_arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(declare_error(
                    &err,
                    AmqpError::DeclareQueueError(def.name().to_owned()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .queue_unbind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the queue");
                Err(AmqpError::DeleteError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the exchange");
                Err(AmqpError::DeleteError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        let channel = self.pool.checkout().await?;

        match channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to get a message");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
            Ok(message) => Ok(message.map(|message| into_delivery(message.delivery, false))),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let channel = new_amqp_channel(&self.connection).await?;

        match channel
            .basic_qos(options.prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to define the consumer prefetch");
                Err(AmqpError::QoSDeclarationError(queue.to_owned()))
            }
            _ => Ok(()),
        }?;

        let consumer = match channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let no_ack = options.no_ack;
        let inner = consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(into_delivery(delivery, no_ack)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed();

        Ok(LapinDeliveries { inner, channel }.boxed())
    }

    async fn queue_message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        Ok(self.queue_info(queue).await?.message_count())
    }

    async fn queue_consumer_count(&self, queue: &str) -> Result<u32, AmqpError> {
        Ok(self.queue_info(queue).await?.consumer_count())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }
}
