use crate::{
    error::{PropagationError, TracerError},
    model::SpanHandle,
    propagation::{self, SpanContext},
    record::Micros,
};
use std::net::IpAddr;

/// The calls this crate makes against a tracing backend.
///
/// Handles are created unstarted; naming, tagging and start time are applied
/// separately so callers can decorate spans with session data they own.
pub trait Tracer {
    /// A new span with no local parent. With `continued`, the span joins that
    /// context's trace as its child; otherwise a fresh trace is started.
    fn new_root_span(&self, continued: Option<&SpanContext>) -> Result<SpanHandle, TracerError>;

    fn new_child_span(&self, parent: &SpanHandle) -> Result<SpanHandle, TracerError>;

    fn name_span(&self, handle: &SpanHandle, name: &str) -> Result<(), TracerError>;

    fn set_resource(&self, handle: &SpanHandle, resource: &str) -> Result<(), TracerError>;

    fn tag_span(&self, handle: &SpanHandle, key: &str, value: &str) -> Result<(), TracerError>;

    fn set_remote_endpoint(&self, handle: &SpanHandle, address: IpAddr) -> Result<(), TracerError>;

    fn start_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError>;

    fn annotate_span(&self, handle: &SpanHandle, timestamp: Micros, text: &str) -> Result<(), TracerError>;

    fn finish_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError>;

    /// Drop a handle without reporting it.
    fn discard_span(&self, handle: &SpanHandle) -> Result<(), TracerError>;

    fn decode_propagated_context(&self, token: &str) -> Result<SpanContext, PropagationError> {
        propagation::decode_b3_single(token)
    }
}

impl<T: Tracer + ?Sized> Tracer for &T {
    fn new_root_span(&self, continued: Option<&SpanContext>) -> Result<SpanHandle, TracerError> {
        (**self).new_root_span(continued)
    }

    fn new_child_span(&self, parent: &SpanHandle) -> Result<SpanHandle, TracerError> {
        (**self).new_child_span(parent)
    }

    fn name_span(&self, handle: &SpanHandle, name: &str) -> Result<(), TracerError> {
        (**self).name_span(handle, name)
    }

    fn set_resource(&self, handle: &SpanHandle, resource: &str) -> Result<(), TracerError> {
        (**self).set_resource(handle, resource)
    }

    fn tag_span(&self, handle: &SpanHandle, key: &str, value: &str) -> Result<(), TracerError> {
        (**self).tag_span(handle, key, value)
    }

    fn set_remote_endpoint(&self, handle: &SpanHandle, address: IpAddr) -> Result<(), TracerError> {
        (**self).set_remote_endpoint(handle, address)
    }

    fn start_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError> {
        (**self).start_span(handle, timestamp)
    }

    fn annotate_span(&self, handle: &SpanHandle, timestamp: Micros, text: &str) -> Result<(), TracerError> {
        (**self).annotate_span(handle, timestamp, text)
    }

    fn finish_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError> {
        (**self).finish_span(handle, timestamp)
    }

    fn discard_span(&self, handle: &SpanHandle) -> Result<(), TracerError> {
        (**self).discard_span(handle)
    }

    fn decode_propagated_context(&self, token: &str) -> Result<SpanContext, PropagationError> {
        (**self).decode_propagated_context(token)
    }
}
