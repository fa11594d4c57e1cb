// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The `Envelope` is the unit moved through the layer: an opaque payload plus
//! the AMQP properties and headers the reliability machinery relies on
//! (message id, creation time, retry count, error tagging on dead-letter).
//!
//! Envelopes convert to and from `lapin` properties here, so the rest of the
//! crate never touches `AMQPValue` directly.

use crate::errors::AmqpError;
use chrono::{DateTime, TimeZone, Utc};
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ByteArray, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, time::Duration};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Local attempts consumed before the envelope was republished
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Creation time in milliseconds since the epoch
pub const HEADER_CREATED_AT: &str = "x-created-at";
/// Name of the publishing application
pub const HEADER_SOURCE_SERVICE: &str = "x-source-service";
/// Name of the intended receiving application
pub const HEADER_TARGET_SERVICE: &str = "x-target-service";
/// User on whose behalf the message was produced
pub const HEADER_USER_ID: &str = "x-user-id";
/// Tenant on whose behalf the message was produced
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
/// Delay attribute read by the delayed-message exchange
pub const HEADER_DELAY: &str = "x-delay";
/// Message of the error that caused a dead-letter
pub const HEADER_EXCEPTION_MESSAGE: &str = "x-exception-message";
/// Kind of the error that caused a dead-letter
pub const HEADER_EXCEPTION_TYPE: &str = "x-exception-type";
/// Exchange the envelope was originally published to
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Routing key the envelope was originally published with
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Queue the envelope was consumed from before dead-lettering
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
/// Time of the terminal failure in milliseconds since the epoch
pub const HEADER_FAILED_AT: &str = "x-failed-at";

/// Persistence of a message on the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Header value carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::UInt(v) => i64::try_from(*v).ok(),
            HeaderValue::String(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub(crate) fn to_amqp(&self) -> AMQPValue {
        match self {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::UInt(v) => match i64::try_from(*v) {
                Ok(v) => AMQPValue::LongLongInt(v),
                Err(_) => AMQPValue::LongString(LongString::from(v.to_string())),
            },
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        }
    }

    /// Nested tables, arrays and floating point values have no
    /// representation here and are dropped.
    pub(crate) fn from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
        match value {
            AMQPValue::LongString(v) => Some(HeaderValue::String(
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(v) => Some(HeaderValue::String(v.to_string())),
            AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
            AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValue::UInt(u64::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValue::UInt(u64::from(*v))),
            AMQPValue::LongUInt(v) => Some(HeaderValue::UInt(u64::from(*v))),
            AMQPValue::Timestamp(v) => Some(HeaderValue::UInt(*v)),
            AMQPValue::ByteArray(v) => Some(HeaderValue::Bytes(v.as_slice().to_vec())),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::UInt(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::UInt(u64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Ordered header map attached to an envelope.
pub type Headers = BTreeMap<String, HeaderValue>;

/// The unit moved through the messaging layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub headers: Headers,
    pub delivery_mode: DeliveryMode,
    pub ttl: Option<Duration>,
    pub priority: Option<u8>,
    pub message_type: Option<String>,
    pub content_type: String,
}

impl Envelope {
    /// Creates a persistent envelope with a fresh id and timestamp.
    pub fn new(payload: Vec<u8>) -> Envelope {
        Envelope {
            payload,
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            headers: Headers::default(),
            delivery_mode: DeliveryMode::Persistent,
            ttl: None,
            priority: None,
            message_type: None,
            content_type: JSON_CONTENT_TYPE.to_owned(),
        }
    }

    /// Serializes `message` as JSON into a new envelope.
    pub fn json<T: Serialize + ?Sized>(message: &T) -> Result<Envelope, AmqpError> {
        let payload = serde_json::to_vec(message)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))?;

        Ok(Envelope::new(payload))
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Merges `headers` over the current ones; incoming values win.
    pub fn headers(mut self, headers: &Headers) -> Self {
        for (key, value) in headers {
            self.headers.insert(key.clone(), value.clone());
        }
        self
    }

    /// Inserts `headers` only where no value is present yet.
    pub fn default_headers(mut self, headers: &Headers) -> Self {
        for (key, value) in headers {
            self.headers
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Drops the per-message expiration, as the broker does when it moves a
    /// message to a dead letter exchange.
    pub fn without_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn message_type(mut self, kind: impl Into<String>) -> Self {
        self.message_type = Some(kind.into());
        self
    }

    /// Guarantees a non-empty message id before the envelope leaves the
    /// process.
    pub fn seal(mut self) -> Self {
        if self.message_id.trim().is_empty() {
            self.message_id = Uuid::new_v4().to_string();
        }
        self.headers
            .entry(HEADER_CREATED_AT.to_owned())
            .or_insert_with(|| HeaderValue::Int(self.timestamp.timestamp_millis()));
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// Local attempts recorded by a previous republish, zero when absent.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(HEADER_RETRY_COUNT)
            .and_then(HeaderValue::as_i64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or_default()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))
    }

    pub(crate) fn amqp_headers(&self) -> BTreeMap<ShortString, AMQPValue> {
        self.headers
            .iter()
            .map(|(key, value)| (ShortString::from(key.clone()), value.to_amqp()))
            .collect()
    }

    pub(crate) fn to_properties(&self) -> BasicProperties {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_message_id(ShortString::from(self.message_id.clone()))
            .with_timestamp(u64::try_from(self.timestamp.timestamp()).unwrap_or_default())
            .with_delivery_mode(self.delivery_mode.as_amqp())
            .with_headers(FieldTable::from(self.amqp_headers()));

        if let Some(kind) = &self.message_type {
            props = props.with_type(ShortString::from(kind.clone()));
        }

        if let Some(ttl) = self.ttl {
            props = props.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }

        if let Some(priority) = self.priority {
            props = props.with_priority(priority);
        }

        props
    }

    pub(crate) fn from_properties(payload: Vec<u8>, props: &AMQPProperties) -> Envelope {
        let headers: Headers = props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(key, value)| {
                        HeaderValue::from_amqp(value).map(|v| (key.to_string(), v))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let timestamp = headers
            .get(HEADER_CREATED_AT)
            .and_then(HeaderValue::as_i64)
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .or_else(|| {
                props
                    .timestamp()
                    .and_then(|secs| i64::try_from(secs).ok())
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            })
            .unwrap_or_else(Utc::now);

        let delivery_mode = match props.delivery_mode() {
            Some(1) => DeliveryMode::Transient,
            _ => DeliveryMode::Persistent,
        };

        Envelope {
            payload,
            message_id: props
                .message_id()
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            timestamp,
            headers,
            delivery_mode,
            ttl: props
                .expiration()
                .as_ref()
                .and_then(|exp| exp.as_str().parse::<u64>().ok())
                .map(Duration::from_millis),
            priority: *props.priority(),
            message_type: props.kind().as_ref().map(|kind| kind.to_string()),
            content_type: props
                .content_type()
                .as_ref()
                .map(|ct| ct.to_string())
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
        }
    }
}
