// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through envelope headers. Producers inject the
//! current context before publishing; consumers extract it and open a
//! consumer span around the handler.

use crate::envelope::{HeaderValue, Headers};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Injects into and extracts from envelope headers.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeadersPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject_context(ctx: &Context, headers: &mut Headers) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Extracts the remote context from `headers` and starts a consumer span
/// named `name` under it.
pub fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_keys_are_lowercase_strings() {
        let mut headers = Headers::new();
        HeadersPropagator::new(&mut headers).set("Traceparent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::from("00-abc-def-01"))
        );
    }

    #[test]
    fn extractor_ignores_non_string_headers() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), HeaderValue::Int(1));
        headers.insert("tracestate".to_owned(), HeaderValue::from("k=v"));

        let propagator = HeadersPropagator::new(&mut headers);

        assert_eq!(propagator.get("traceparent"), None);
        assert_eq!(propagator.get("tracestate"), Some("k=v"));
        assert_eq!(propagator.keys().len(), 2);
    }
}
