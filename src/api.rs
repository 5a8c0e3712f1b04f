use crate::model::Span;
use serde::Serialize;
use std::collections::HashMap;

pub const META_CLIENT_IP: &str = "network.client.ip";
pub const META_EVENTS: &str = "events";

#[derive(Debug, Serialize, Clone, PartialEq)]
struct SpanEvent<'a> {
    name: &'a str,
    time_unix_nano: u64,
}

fn micros_to_nanos(micros: i64) -> u64 {
    (micros.max(0) as u64).saturating_mul(1_000)
}

fn fill_meta(span: &Span, env: Option<&str>) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    if let Some(env) = env {
        meta.insert("env".to_string(), env.to_string());
    }
    if let Some(address) = span.remote_endpoint {
        meta.insert(META_CLIENT_IP.to_string(), address.to_string());
    }
    if !span.annotations.is_empty() {
        let events: Vec<SpanEvent> = span
            .annotations
            .iter()
            .map(|a| SpanEvent {
                name: &a.value,
                time_unix_nano: micros_to_nanos(a.timestamp),
            })
            .collect();
        if let Ok(encoded) = serde_json::to_string(&events) {
            meta.insert(META_EVENTS.to_string(), encoded);
        }
    }
    for (key, value) in &span.tags {
        meta.insert(key.to_string(), value.to_string());
    }
    meta
}

fn fill_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();
    metrics.insert("_sampling_priority_v1".to_string(), 1f64);
    metrics
}

/// A span in the Datadog agent's `v0.3/traces` JSON form.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RawSpan {
    service: String,
    name: String,
    resource: String,
    trace_id: u64,
    span_id: u64,
    parent_id: Option<u64>,
    start: u64,
    duration: u64,
    error: i32,
    meta: HashMap<String, String>,
    metrics: HashMap<String, f64>,
    r#type: String,
}

impl RawSpan {
    pub fn from_span(span: &Span, service: &str, env: Option<&str>) -> RawSpan {
        RawSpan {
            service: service.to_string(),
            trace_id: span.trace_id,
            span_id: span.id,
            name: span.name.clone(),
            resource: span.resource.clone(),
            parent_id: span.parent_id,
            start: micros_to_nanos(span.start),
            duration: micros_to_nanos(span.duration),
            error: 0,
            r#type: "db".to_string(),
            meta: fill_meta(span, env),
            metrics: fill_metrics(),
        }
    }
}

/// Encode one trace as the agent's request body (a list of traces).
pub fn encode_trace(stack: &[Span], service: &str, env: Option<&str>) -> Vec<Vec<RawSpan>> {
    vec![stack
        .iter()
        .map(|s| RawSpan::from_span(s, service, env))
        .collect()]
}
