// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Propagates trace context through RabbitMQ message headers: publishers
//! inject the current context, deliveries extract it back.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Returns `props` with `ctx` injected into its headers.
///
/// Existing headers are kept; propagation keys overwrite headers of the same name.
pub(crate) fn inject_context(ctx: &Context, props: BasicProperties) -> BasicProperties {
    let mut headers = props.headers().clone().unwrap_or_default().inner().clone();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
    });

    props.with_headers(FieldTable::from(headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn extractor_reads_long_string_headers_only() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        headers.insert(ShortString::from("x-count"), AMQPValue::LongInt(3));

        let propagator = RabbitMQTracePropagator::new(&mut headers);

        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.get("x-count"), None);
        assert_eq!(propagator.get("missing"), None);
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        RabbitMQTracePropagator::new(&mut headers).set("TraceParent", "value".to_owned());

        assert!(headers.contains_key(&ShortString::from("traceparent")));
    }

    #[test]
    fn injection_keeps_existing_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("tenant"), AMQPValue::LongInt(7));
        let props = BasicProperties::default().with_headers(FieldTable::from(headers));

        let props = inject_context(&Context::current(), props);

        let headers = props.headers().clone().unwrap_or_default();
        assert!(headers.inner().contains_key(&ShortString::from("tenant")));
    }
}
