// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod policy;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod service;
pub mod topology;

pub use broker::{BrokerClient, Confirmation, Delivery};
pub use configs::MessagingConfigs;
pub use consumer::{handler_fn, ConsumeOutcome, ConsumerHandler, ConsumerMessage, HandlerError};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use envelope::{Envelope, HeaderValue, Headers};
pub use errors::{AmqpError, BatchPublishError};
pub use policy::{
    AckMode, ConsumerFailureStrategy, ConsumerPolicy, Disposition, ProducerFailureStrategy,
    ProducerPolicy,
};
pub use producer::{PublishOutcome, ReliablePublisher};
pub use service::{MessagingService, PendingPublish};
