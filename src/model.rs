use crate::{propagation::SpanContext, record::Micros};
use std::{collections::HashMap, net::IpAddr};

/// Opaque reference to a span open in a tracing backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanHandle {
    pub trace_id: u64,
    pub span_id: u64,
}

impl SpanHandle {
    /// Context a child or continued span is created from.
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id,
            trace_id_high: None,
            span_id: self.span_id,
        }
    }
}

/// A span as the Datadog tracer records it, finished or not.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub id: u64,
    pub trace_id: u64,
    pub name: String,
    pub resource: String,
    pub parent_id: Option<u64>,
    pub start: Micros,
    pub duration: Micros,
    pub remote_endpoint: Option<IpAddr>,
    pub annotations: Vec<Annotation>,
    pub tags: HashMap<String, String>,
}

impl Span {
    pub fn new(trace_id: u64, id: u64, parent_id: Option<u64>) -> Span {
        Span {
            id,
            trace_id,
            name: String::new(),
            resource: String::new(),
            parent_id,
            start: 0,
            duration: 0,
            remote_endpoint: None,
            annotations: Vec::new(),
            tags: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub timestamp: Micros,
    pub value: String,
}
